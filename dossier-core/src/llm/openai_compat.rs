//! OpenAI-compatible LLM provider.
//!
//! Works against OpenAI and any endpoint following the chat completions
//! format (Azure OpenAI, Ollama, vLLM, LM Studio).

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::debug;

use super::rate_limiter::parse_retry_after;
use super::{CompletionRequest, CompletionResponse, LlmProvider, TokenUsage};
use crate::config::LlmProviderConfig;
use crate::error::LlmError;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiCompatibleProvider {
    client: Client,
    name: String,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: Option<usize>,
}

impl OpenAiCompatibleProvider {
    /// Create a provider, reading the API key from `config.api_key_env`.
    ///
    /// Local endpoints (localhost / 127.0.0.1) do not need a key.
    pub fn new(config: &LlmProviderConfig) -> Result<Self, LlmError> {
        let is_local = config
            .base_url
            .as_ref()
            .is_some_and(|u| u.contains("localhost") || u.contains("127.0.0.1"));

        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| {
                if is_local {
                    debug!(provider = %config.name, "No API key set for local provider; using placeholder");
                    Some("local".to_string())
                } else {
                    None
                }
            })
            .ok_or_else(|| LlmError::AuthFailed {
                provider: format!("{}: env var '{}' not set", config.name, config.api_key_env),
            })?;
        Ok(Self::new_with_key(config, api_key))
    }

    pub fn new_with_key(config: &LlmProviderConfig, api_key: String) -> Self {
        Self {
            client: Client::new(),
            name: config.name.clone(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }

    fn request_body(&self, request: &CompletionRequest) -> Value {
        let mut messages = Vec::with_capacity(2);
        if !request.system.is_empty() {
            messages.push(json!({"role": "system", "content": request.system}));
        }
        messages.push(json!({"role": "user", "content": request.user}));

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": request.temperature.unwrap_or(self.temperature),
            "stream": false,
        });
        if let Some(max_tokens) = request.max_tokens.or(self.max_tokens) {
            body["max_tokens"] = json!(max_tokens);
        }
        if request.json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }
        body
    }

    fn parse_response(body: &Value, model: &str) -> Result<CompletionResponse, LlmError> {
        let message = body
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .ok_or_else(|| LlmError::ResponseParse {
                message: "No message in response choices".to_string(),
            })?;

        let text = message
            .get("content")
            .and_then(|c| c.as_str())
            .ok_or_else(|| LlmError::ResponseParse {
                message: "Message has no text content".to_string(),
            })?
            .to_string();

        let usage = body
            .get("usage")
            .map(|u| TokenUsage {
                input_tokens: u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as usize,
                output_tokens: u
                    .get("completion_tokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as usize,
            })
            .unwrap_or_default();

        Ok(CompletionResponse {
            text,
            model: body
                .get("model")
                .and_then(|m| m.as_str())
                .unwrap_or(model)
                .to_string(),
            usage,
        })
    }

    /// Map an HTTP status code to the appropriate LlmError.
    fn map_http_error(
        provider: &str,
        status: reqwest::StatusCode,
        body: &str,
        retry_after: Option<u64>,
    ) -> LlmError {
        match status.as_u16() {
            401 | 403 => {
                debug!(body = %body, "Authentication failed");
                LlmError::AuthFailed {
                    provider: provider.to_string(),
                }
            }
            429 => {
                // "Rate limit reached ... Please try again in 20s."
                let from_body = serde_json::from_str::<Value>(body)
                    .ok()
                    .and_then(|v| v.get("error")?.get("message")?.as_str().map(str::to_string))
                    .and_then(|msg| {
                        msg.split("in ")
                            .last()
                            .and_then(|s| s.trim_end_matches('.').trim_end_matches('s').parse::<u64>().ok())
                    });
                LlmError::RateLimited {
                    retry_after_secs: retry_after.or(from_body).unwrap_or(5),
                }
            }
            408 => LlmError::Timeout { timeout_secs: 0 },
            code if code >= 500 => LlmError::ServerError {
                status: code,
                message: body.chars().take(500).collect(),
            },
            code => LlmError::ApiRequest {
                message: format!("HTTP {code}: {body}"),
            },
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.request_body(&request);

        debug!(url = %url, model = %self.model, purpose = %request.purpose, "Sending completion request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout { timeout_secs: 0 }
                } else {
                    LlmError::Connection {
                        message: format!("Request failed: {e}"),
                    }
                }
            })?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let response_body = response.text().await.map_err(|e| LlmError::Connection {
            message: format!("Failed to read response body: {e}"),
        })?;

        if !status.is_success() {
            return Err(Self::map_http_error(&self.name, status, &response_body, retry_after));
        }

        let json: Value =
            serde_json::from_str(&response_body).map_err(|e| LlmError::ResponseParse {
                message: format!("Invalid JSON: {e}"),
            })?;

        Self::parse_response(&json, &self.model)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> LlmProviderConfig {
        LlmProviderConfig {
            name: "openai".into(),
            model: "gpt-4o".into(),
            base_url: None,
            api_key_env: "DOSSIER_TEST_OPENAI_KEY".into(),
            temperature: 0.2,
            max_tokens: Some(1024),
        }
    }

    fn request(json_mode: bool) -> CompletionRequest {
        CompletionRequest {
            purpose: "plan".into(),
            system: "You plan.".into(),
            user: "Plan this.".into(),
            temperature: None,
            max_tokens: None,
            json_mode,
        }
    }

    #[test]
    fn test_request_body() {
        let provider = OpenAiCompatibleProvider::new_with_key(&test_config(), "sk".into());
        let body = provider.request_body(&request(true));
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "Plan this.");
        assert_eq!(body["max_tokens"], 1024);
        assert_eq!(body["response_format"]["type"], "json_object");

        let body = provider.request_body(&request(false));
        assert!(body.get("response_format").is_none());
    }

    #[test]
    fn test_parse_text_response() {
        let body = json!({
            "model": "gpt-4o-2024-08-06",
            "choices": [{"message": {"role": "assistant", "content": "{\"a\":1}"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3}
        });
        let response = OpenAiCompatibleProvider::parse_response(&body, "gpt-4o").unwrap();
        assert_eq!(response.text, "{\"a\":1}");
        assert_eq!(response.model, "gpt-4o-2024-08-06");
        assert_eq!(response.usage.input_tokens, 12);
        assert_eq!(response.usage.output_tokens, 3);
    }

    #[test]
    fn test_parse_response_no_choices() {
        let err = OpenAiCompatibleProvider::parse_response(&json!({"choices": []}), "m").unwrap_err();
        assert!(matches!(err, LlmError::ResponseParse { .. }));
    }

    #[test]
    fn test_http_error_mapping() {
        let err = OpenAiCompatibleProvider::map_http_error(
            "openai",
            reqwest::StatusCode::UNAUTHORIZED,
            "Unauthorized",
            None,
        );
        assert!(matches!(err, LlmError::AuthFailed { .. }));
        assert!(!err.is_retryable());

        let err = OpenAiCompatibleProvider::map_http_error(
            "openai",
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            r#"{"error":{"message":"Rate limit reached. Please try again in 20s."}}"#,
            None,
        );
        match err {
            LlmError::RateLimited { retry_after_secs } => assert_eq!(retry_after_secs, 20),
            other => panic!("Expected RateLimited, got {other:?}"),
        }

        let err = OpenAiCompatibleProvider::map_http_error(
            "openai",
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            "",
            Some(3),
        );
        assert!(matches!(err, LlmError::RateLimited { retry_after_secs: 3 }));

        let err = OpenAiCompatibleProvider::map_http_error(
            "openai",
            reqwest::StatusCode::SERVICE_UNAVAILABLE,
            "overloaded",
            None,
        );
        assert!(matches!(err, LlmError::ServerError { status: 503, .. }));
        assert!(err.is_retryable());

        let err = OpenAiCompatibleProvider::map_http_error(
            "openai",
            reqwest::StatusCode::BAD_REQUEST,
            "bad",
            None,
        );
        assert!(matches!(err, LlmError::ApiRequest { .. }));
    }

    #[test]
    fn test_new_missing_key() {
        // SAFETY: test-only env var manipulation
        unsafe { std::env::remove_var("DOSSIER_TEST_OPENAI_KEY_MISSING") };
        let mut config = test_config();
        config.api_key_env = "DOSSIER_TEST_OPENAI_KEY_MISSING".into();
        assert!(matches!(
            OpenAiCompatibleProvider::new(&config),
            Err(LlmError::AuthFailed { .. })
        ));
    }

    #[test]
    fn test_local_provider_needs_no_key() {
        let mut config = test_config();
        config.api_key_env = "DOSSIER_TEST_LOCAL_KEY_UNSET".into();
        config.base_url = Some("http://localhost:11434/v1/".into());
        let provider = OpenAiCompatibleProvider::new(&config).unwrap();
        assert_eq!(provider.base_url, "http://localhost:11434/v1");
        assert_eq!(provider.model_name(), "gpt-4o");
    }
}
