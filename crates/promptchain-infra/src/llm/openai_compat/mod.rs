//! OpenAI-compatible LLM provider implementation.
//!
//! A single [`OpenAiCompatibleProvider`] talks to any endpoint speaking the
//! chat completions protocol (the default gateway, OpenAI itself, or a local
//! proxy) through a configurable base URL.
//!
//! Each call is one non-streaming `POST {base_url}/chat/completions`. HTTP
//! statuses are mapped onto [`LlmError`] so the step runner can tell
//! transient failures from permanent ones.

pub mod config;
pub mod types;

use secrecy::{ExposeSecret, SecretString};

use promptchain_core::llm::provider::LlmProvider;
use promptchain_types::llm::{CompletionRequest, CompletionResponse, LlmError, Usage};

use self::config::OpenAiCompatConfig;
use self::types::{ChatMessage, ChatRequest, ChatResponse, ErrorEnvelope};

/// Unified provider for any OpenAI-compatible API.
///
/// Does NOT derive Debug so the API key cannot leak through a stray `{:?}`.
pub struct OpenAiCompatibleProvider {
    client: reqwest::Client,
    provider_name: String,
    base_url: String,
    api_key: Option<SecretString>,
    timeout_secs: u64,
}

impl OpenAiCompatibleProvider {
    /// Create a new OpenAI-compatible provider from a configuration.
    pub fn new(config: OpenAiCompatConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Transport(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            provider_name: config.provider_name,
            base_url: config.base_url,
            api_key: config.api_key,
            timeout_secs: config.timeout.as_secs(),
        })
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

/// Build the wire request from a generic [`CompletionRequest`].
fn build_request(request: &CompletionRequest) -> ChatRequest {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if let Some(ref system) = request.system {
        messages.push(ChatMessage {
            role: "system".to_string(),
            content: Some(system.clone()),
        });
    }
    messages.extend(request.messages.iter().map(|m| ChatMessage {
        role: m.role.to_string(),
        content: Some(m.content.clone()),
    }));

    ChatRequest {
        model: request.model.clone(),
        messages,
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        stream: false,
    }
}

/// Turn a successful wire response into a [`CompletionResponse`].
///
/// Content is trimmed; a missing `choices` entry is an empty completion.
fn parse_response(response: ChatResponse, requested_model: &str) -> CompletionResponse {
    let first = response.choices.into_iter().next();
    let finish_reason = first.as_ref().and_then(|c| c.finish_reason.clone());
    let content = first
        .and_then(|c| c.message.content)
        .map(|c| c.trim().to_string())
        .unwrap_or_default();

    let usage = response
        .usage
        .map(|u| Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        })
        .unwrap_or_default();

    CompletionResponse {
        id: response.id,
        content,
        model: if response.model.is_empty() {
            requested_model.to_string()
        } else {
            response.model
        },
        finish_reason,
        usage,
    }
}

/// Map a non-success HTTP status and its body to an [`LlmError`].
fn map_status_error(status: u16, body: &str, retry_after: Option<&str>) -> LlmError {
    let envelope = serde_json::from_str::<ErrorEnvelope>(body).ok();
    let message = envelope
        .as_ref()
        .map(|e| e.error.message.clone())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| body.chars().take(500).collect());
    let code = envelope
        .as_ref()
        .and_then(|e| e.error.code.as_ref())
        .and_then(|c| c.as_str())
        .unwrap_or("");

    match status {
        401 | 403 => LlmError::AuthenticationFailed,
        429 => LlmError::RateLimited {
            retry_after_ms: retry_after
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(|secs| secs.saturating_mul(1000)),
        },
        400 | 413 | 422
            if code == "context_length_exceeded"
                || message.contains("maximum context length") =>
        {
            LlmError::ContextLengthExceeded(message)
        }
        400 | 404 | 413 | 422 => LlmError::InvalidRequest(format!("HTTP {status}: {message}")),
        503 | 529 => LlmError::Overloaded(message),
        _ => LlmError::Provider {
            message: format!("HTTP {status}: {message}"),
        },
    }
}

/// Map a transport-level reqwest failure.
fn map_reqwest_error(err: reqwest::Error, timeout_secs: u64) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout(timeout_secs)
    } else {
        LlmError::Transport(format!("HTTP request failed: {err}"))
    }
}

impl LlmProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.provider_name
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let Some(api_key) = self.api_key.as_ref() else {
            return Err(LlmError::AuthenticationFailed);
        };
        let body = build_request(request);

        let response = self
            .client
            .post(self.url())
            .bearer_auth(api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, self.timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let error_body = response.text().await.unwrap_or_default();
            let err = map_status_error(status.as_u16(), &error_body, retry_after.as_deref());
            tracing::warn!(
                provider = self.provider_name.as_str(),
                status = status.as_u16(),
                error = %err,
                "provider returned an error"
            );
            return Err(err);
        }

        let chat: ChatResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout(self.timeout_secs)
            } else {
                LlmError::Deserialization(format!("failed to parse response: {e}"))
            }
        })?;

        Ok(parse_response(chat, &request.model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use promptchain_types::llm::Message;
    use std::time::Duration;

    fn sample_request() -> CompletionRequest {
        CompletionRequest {
            model: "kimi-k2p5".to_string(),
            messages: vec![Message::user("Hello")],
            system: Some("Be terse.".to_string()),
            max_tokens: 256,
            temperature: Some(0.2),
        }
    }

    #[test]
    fn test_build_request_prepends_system_message() {
        let wire = build_request(&sample_request());
        let json = serde_json::to_value(&wire).unwrap();

        assert_eq!(json["model"], "kimi-k2p5");
        assert_eq!(json["max_tokens"], 256);
        assert_eq!(json["stream"], false);
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][0]["content"], "Be terse.");
        assert_eq!(json["messages"][1]["role"], "user");
        assert_eq!(json["messages"][1]["content"], "Hello");
    }

    #[test]
    fn test_build_request_omits_unset_temperature() {
        let mut request = sample_request();
        request.temperature = None;
        request.system = None;
        let json = serde_json::to_value(build_request(&request)).unwrap();
        assert!(json.get("temperature").is_none());
        assert_eq!(json["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_parse_response_trims_and_reads_usage() {
        let body = r#"{
            "id": "chatcmpl-1",
            "model": "kimi-k2p5",
            "choices": [{"message": {"role": "assistant", "content": "  OK done \n"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 30, "total_tokens": 42}
        }"#;
        let chat: ChatResponse = serde_json::from_str(body).unwrap();
        let response = parse_response(chat, "kimi-k2p5");

        assert_eq!(response.content, "OK done");
        assert_eq!(response.finish_reason.as_deref(), Some("stop"));
        assert_eq!(response.usage.total(), 42);
    }

    #[test]
    fn test_parse_response_without_choices_or_usage() {
        let chat: ChatResponse = serde_json::from_str(r#"{"id": "x"}"#).unwrap();
        let response = parse_response(chat, "fallback-model");
        assert_eq!(response.content, "");
        assert_eq!(response.model, "fallback-model");
        assert_eq!(response.usage.total(), 0);
    }

    #[test]
    fn test_map_status_error_auth_and_rate_limit() {
        assert!(matches!(
            map_status_error(401, "", None),
            LlmError::AuthenticationFailed
        ));
        assert!(matches!(
            map_status_error(403, "", None),
            LlmError::AuthenticationFailed
        ));
        assert!(matches!(
            map_status_error(429, "", Some("3")),
            LlmError::RateLimited {
                retry_after_ms: Some(3000)
            }
        ));
    }

    #[test]
    fn test_map_status_error_context_length() {
        let body = r#"{"error": {"message": "This model's maximum context length is 8192 tokens", "type": "invalid_request_error", "code": "context_length_exceeded"}}"#;
        let err = map_status_error(400, body, None);
        assert!(matches!(err, LlmError::ContextLengthExceeded(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_map_status_error_transient_statuses() {
        let overloaded = map_status_error(529, "busy", None);
        assert!(matches!(overloaded, LlmError::Overloaded(_)));
        assert!(overloaded.is_transient());

        let server = map_status_error(500, "boom", None);
        assert!(matches!(server, LlmError::Provider { .. }));
        assert!(server.is_transient());

        let bad = map_status_error(400, r#"{"error": {"message": "unknown model"}}"#, None);
        assert!(matches!(bad, LlmError::InvalidRequest(ref m) if m.contains("unknown model")));
        assert!(!bad.is_transient());
    }

    #[tokio::test]
    async fn test_missing_api_key_fails_without_network() {
        let provider = OpenAiCompatibleProvider::new(OpenAiCompatConfig {
            provider_name: "test".to_string(),
            base_url: "http://127.0.0.1:9".to_string(),
            api_key: None,
            timeout: Duration::from_secs(1),
        })
        .unwrap();

        let err = provider.complete(&sample_request()).await.unwrap_err();
        assert!(matches!(err, LlmError::AuthenticationFailed));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient() {
        let provider = OpenAiCompatibleProvider::new(OpenAiCompatConfig {
            provider_name: "test".to_string(),
            base_url: "http://127.0.0.1:9".to_string(),
            api_key: Some(SecretString::from("sk-test".to_string())),
            timeout: Duration::from_secs(2),
        })
        .unwrap();

        let err = provider.complete(&sample_request()).await.unwrap_err();
        assert!(err.is_transient(), "{err}");
    }
}
