//! LLM provider implementations.
//!
//! Contains the concrete [`LlmProvider`](promptchain_core::llm::provider::LlmProvider)
//! used in production, plus a factory that builds it from the global config.

pub mod openai_compat;

use promptchain_types::config::GlobalConfig;
use promptchain_types::llm::LlmError;

use self::openai_compat::OpenAiCompatibleProvider;
use self::openai_compat::config::OpenAiCompatConfig;

/// Create the configured provider.
pub fn create_provider(config: &GlobalConfig) -> Result<OpenAiCompatibleProvider, LlmError> {
    OpenAiCompatibleProvider::new(OpenAiCompatConfig::from_global(config))
}
