//! LlmProvider trait definition.
//!
//! This is the seam between the execution engine and whatever model backend
//! answers its prompts. Uses RPITIT for `complete` so implementations stay
//! free of boxing.

use promptchain_types::llm::{CompletionRequest, CompletionResponse, LlmError};

/// Trait for LLM provider backends.
///
/// Uses native async fn in traits (RPITIT, Rust 2024 edition). Implementations
/// live in promptchain-infra (e.g., `OpenAiCompatibleProvider`); tests use a
/// scripted in-memory provider.
pub trait LlmProvider: Send + Sync {
    /// Human-readable provider name (e.g., "openai-compatible").
    fn name(&self) -> &str;

    /// Send a completion request and receive the full response.
    ///
    /// Transient failures should be reported with an `LlmError` whose
    /// `is_transient()` is true so the step runner can retry them without
    /// spending the criteria budget.
    fn complete(
        &self,
        request: &CompletionRequest,
    ) -> impl std::future::Future<Output = Result<CompletionResponse, LlmError>> + Send;
}

impl<P: LlmProvider> LlmProvider for std::sync::Arc<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn complete(
        &self,
        request: &CompletionRequest,
    ) -> impl std::future::Future<Output = Result<CompletionResponse, LlmError>> + Send {
        (**self).complete(request)
    }
}
