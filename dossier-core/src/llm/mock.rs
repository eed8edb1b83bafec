//! Scripted LLM provider for tests and offline runs.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{CompletionRequest, CompletionResponse, LlmProvider, TokenUsage};
use crate::error::LlmError;

type Handler = Box<dyn Fn(&CompletionRequest) -> Result<String, LlmError> + Send + Sync>;

/// A mock LLM provider for testing.
///
/// Replies come from the queue first, then from the handler if one is set.
/// With neither available the call fails with `ApiRequest`. Every request is
/// recorded so tests can inspect the prompts a stage produced.
pub struct MockLlmProvider {
    name: String,
    model: String,
    responses: Mutex<VecDeque<Result<String, LlmError>>>,
    handler: Option<Handler>,
    delay: Option<Duration>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockLlmProvider {
    /// Usage reported on every successful reply.
    pub const USAGE: TokenUsage = TokenUsage {
        input_tokens: 100,
        output_tokens: 50,
    };

    pub fn new() -> Self {
        Self::named("mock")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: "mock-model".to_string(),
            responses: Mutex::new(VecDeque::new()),
            handler: None,
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answer requests that the queue does not cover.
    pub fn with_handler(
        mut self,
        handler: impl Fn(&CompletionRequest) -> Result<String, LlmError> + Send + Sync + 'static,
    ) -> Self {
        self.handler = Some(Box::new(handler));
        self
    }

    /// Sleep before answering each request.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn queue_response(&self, text: impl Into<String>) {
        self.lock_responses().push_back(Ok(text.into()));
    }

    pub fn queue_json(&self, value: serde_json::Value) {
        self.queue_response(value.to_string());
    }

    pub fn queue_error(&self, error: LlmError) {
        self.lock_responses().push_back(Err(error));
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Recorded requests with the given purpose tag.
    pub fn requests_for(&self, purpose: &str) -> Vec<CompletionRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.purpose == purpose)
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn lock_responses(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<String, LlmError>>> {
        self.responses.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MockLlmProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmProvider for MockLlmProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let queued = self.lock_responses().pop_front();
        let text = match (queued, &self.handler) {
            (Some(reply), _) => reply?,
            (None, Some(handler)) => handler(&request)?,
            (None, None) => {
                return Err(LlmError::ApiRequest {
                    message: format!("mock '{}' has no scripted reply", self.name),
                });
            }
        };

        Ok(CompletionResponse {
            text,
            model: self.model.clone(),
            usage: Self::USAGE,
        })
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

    fn request(purpose: &str) -> CompletionRequest {
        CompletionRequest {
            purpose: purpose.into(),
            system: String::new(),
            user: "hello".into(),
            temperature: None,
            max_tokens: None,
            json_mode: false,
        }
    }

    #[tokio::test]
    async fn test_queue_then_handler() {
        let mock = MockLlmProvider::new().with_handler(|req| Ok(format!("handled {}", req.purpose)));
        mock.queue_response("queued");

        let first = mock.complete(request("plan")).await.unwrap();
        let second = mock.complete(request("synthesis")).await.unwrap();
        assert_eq!(first.text, "queued");
        assert_eq!(second.text, "handled synthesis");
        assert_eq!(mock.requests_for("plan").len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_queue_errors() {
        let mock = MockLlmProvider::new();
        let err = mock.complete(request("plan")).await.unwrap_err();
        assert!(matches!(err, LlmError::ApiRequest { .. }));
        assert_eq!(mock.call_count(), 1);
    }
}
