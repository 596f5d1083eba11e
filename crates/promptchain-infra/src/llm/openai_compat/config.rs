//! Configuration for the OpenAI-compatible chat completions client.

use std::time::Duration;

use promptchain_types::config::GlobalConfig;
use secrecy::SecretString;

/// Configuration for an [`super::OpenAiCompatibleProvider`].
pub struct OpenAiCompatConfig {
    /// Name reported in logs and spans.
    pub provider_name: String,
    /// Base URL; `/chat/completions` is appended.
    pub base_url: String,
    /// API key for bearer authentication. `None` fails every call with
    /// `AuthenticationFailed`.
    pub api_key: Option<SecretString>,
    /// HTTP-level timeout for one request.
    pub timeout: Duration,
}

impl OpenAiCompatConfig {
    /// Build from the global config, reading the key from the configured
    /// environment variable.
    pub fn from_global(config: &GlobalConfig) -> Self {
        let api_key = std::env::var(&config.provider.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .map(SecretString::from);
        if api_key.is_none() {
            tracing::warn!(
                env = config.provider.api_key_env.as_str(),
                "no API key found; provider calls will fail"
            );
        }

        Self {
            provider_name: "openai_compatible".to_string(),
            base_url: config.provider.base_url.trim_end_matches('/').to_string(),
            api_key,
            timeout: Duration::from_secs(config.engine.call_timeout_secs.max(1)),
        }
    }
}
