//! Global configuration types for promptchain.
//!
//! `GlobalConfig` represents the top-level `config.toml` that controls the
//! engine's retry and timeout policy, the provider endpoint, `auto` model
//! resolution, and per-model pricing.

use serde::{Deserialize, Serialize};

/// Top-level configuration.
///
/// Loaded from `~/.promptchain/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub models: ModelConfig,

    /// Price per 1000 tokens for models not matched by `pricing`.
    #[serde(default = "default_price_per_1k")]
    pub default_price_per_1k: f64,

    /// Pricing overrides, consulted before the built-in table.
    #[serde(default)]
    pub pricing: Vec<ModelPricing>,
}

/// Retry, timeout and lease policy for the execution engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Immediate retries for transient provider failures, per attempt.
    #[serde(default = "default_transport_retries")]
    pub transport_retries: u32,

    /// Upper bound on a single provider call.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Character limit for the `truncate_chars` context strategy.
    #[serde(default = "default_truncate_chars")]
    pub truncate_chars: usize,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// How long a store lease stays valid without renewal.
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,

    /// Reject launching a workflow while another execution of it is unfinished.
    #[serde(default = "default_single_active_run")]
    pub single_active_run: bool,
}

fn default_transport_retries() -> u32 {
    2
}

fn default_call_timeout_secs() -> u64 {
    120
}

fn default_truncate_chars() -> usize {
    4096
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f64 {
    1.0
}

fn default_lease_ttl_secs() -> u64 {
    900
}

fn default_single_active_run() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transport_retries: default_transport_retries(),
            call_timeout_secs: default_call_timeout_secs(),
            truncate_chars: default_truncate_chars(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            lease_ttl_secs: default_lease_ttl_secs(),
            single_active_run: default_single_active_run(),
        }
    }
}

/// OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL; `/chat/completions` is appended.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

fn default_base_url() -> String {
    "https://api.getunbound.ai/v1".to_string()
}

fn default_api_key_env() -> String {
    "PROMPTCHAIN_API_KEY".to_string()
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
        }
    }
}

/// Models picked for steps declared with `model: auto`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Used when the criterion is `regex` or `valid_json`.
    #[serde(default = "default_auto_structured")]
    pub auto_structured: String,

    /// Used for every other criterion.
    #[serde(default = "default_auto_default")]
    pub auto_default: String,
}

fn default_auto_structured() -> String {
    "kimi-k2-instruct-0905".to_string()
}

fn default_auto_default() -> String {
    "kimi-k2p5".to_string()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            auto_structured: default_auto_structured(),
            auto_default: default_auto_default(),
        }
    }
}

fn default_price_per_1k() -> f64 {
    0.002
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            provider: ProviderConfig::default(),
            models: ModelConfig::default(),
            default_price_per_1k: default_price_per_1k(),
            pricing: Vec::new(),
        }
    }
}

/// Price for models whose identifier starts with `model`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Model identifier or prefix (e.g. "kimi-k2").
    pub model: String,
    /// USD per 1000 tokens.
    pub price_per_1k: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_config_default_values() {
        let config = GlobalConfig::default();
        assert_eq!(config.default_price_per_1k, 0.002);
        assert_eq!(config.engine.max_tokens, 4096);
        assert_eq!(config.provider.api_key_env, "PROMPTCHAIN_API_KEY");
    }

    #[test]
    fn test_global_config_deserialize_with_defaults() {
        let config: GlobalConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.transport_retries, 2);
        assert_eq!(config.engine.call_timeout_secs, 120);
        assert_eq!(config.engine.truncate_chars, 4096);
        assert!(config.engine.single_active_run);
        assert_eq!(config.provider.base_url, "https://api.getunbound.ai/v1");
        assert_eq!(config.models.auto_default, "kimi-k2p5");
        assert_eq!(config.default_price_per_1k, 0.002);
        assert!(config.pricing.is_empty());
    }

    #[test]
    fn test_global_config_deserialize_with_values() {
        let toml_str = r#"
default_price_per_1k = 0.003

[engine]
transport_retries = 5
truncate_chars = 1000

[models]
auto_structured = "gpt-4o-mini"

[[pricing]]
model = "gpt-4o"
price_per_1k = 0.005
"#;
        let config: GlobalConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.transport_retries, 5);
        assert_eq!(config.engine.truncate_chars, 1000);
        // Unset fields in a present section still default.
        assert_eq!(config.engine.lease_ttl_secs, 900);
        assert_eq!(config.models.auto_structured, "gpt-4o-mini");
        assert_eq!(config.models.auto_default, "kimi-k2p5");
        assert_eq!(config.pricing.len(), 1);
        assert_eq!(config.pricing[0].price_per_1k, 0.005);
        assert_eq!(config.default_price_per_1k, 0.003);
    }
}
