//! LLM Gateway: one call interface over an ordered list of providers.
//!
//! The gateway owns retry with exponential backoff, per-call timeouts,
//! circuit breakers, optional request-rate limiting and the one-shot
//! correction re-prompt used when a reply does not match the requested
//! contract. Callers either get a validated value or
//! [`LlmError::Unavailable`]; transient provider errors never escape.

pub mod mock;
pub mod openai_compat;
pub mod rate_limiter;

pub use mock::MockLlmProvider;
pub use openai_compat::OpenAiCompatibleProvider;
pub use rate_limiter::RequestLimiter;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::circuit::{Admission, CircuitBreaker};
use crate::config::LlmConfig;
use crate::error::{LlmError, ValidationError};
use crate::schema::{self, Contract};
use crate::trace::{AttemptOutcome, GatewayKind, TraceEvent, TraceSink};

pub use crate::types::TokenUsage;

/// A rendered prompt for one workflow step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    /// Short tag naming the step (`plan`, `synthesis`, ...).
    pub purpose: &'static str,
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn new(purpose: &'static str, system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            purpose,
            system: system.into(),
            user: user.into(),
        }
    }

    /// The same prompt with an instruction to fix a rejected reply.
    pub fn with_correction(&self, violation: &ValidationError, shape: &str) -> Self {
        Self {
            purpose: self.purpose,
            system: self.system.clone(),
            user: format!(
                "{}\n\nYour previous reply was rejected: field `{}` {}.\n\
                 Reply again with only a JSON object of this shape:\n{}",
                self.user, violation.path, violation.rule, shape
            ),
        }
    }

    fn to_request(&self) -> CompletionRequest {
        CompletionRequest {
            purpose: self.purpose.to_string(),
            system: self.system.clone(),
            user: self.user.clone(),
            temperature: None,
            max_tokens: None,
            json_mode: true,
        }
    }
}

/// Request sent to a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub purpose: String,
    pub system: String,
    pub user: String,
    /// Overrides the provider's configured temperature.
    pub temperature: Option<f32>,
    pub max_tokens: Option<usize>,
    /// Ask the provider for a JSON object reply.
    pub json_mode: bool,
}

/// Provider reply.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResponse {
    pub text: String,
    pub model: String,
    pub usage: TokenUsage,
}

/// Trait for LLM providers, allowing pluggable backends.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a completion request and return the full response.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// Name used for preference and in traces.
    fn name(&self) -> &str;

    fn model_name(&self) -> &str;
}

/// Retry, timeout and breaker settings for the gateway.
#[derive(Debug, Clone)]
pub struct GatewayPolicy {
    /// Attempts per provider before failing over.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Independent timeout for every provider call.
    pub timeout: Duration,
    pub failure_threshold: usize,
    pub recovery_timeout: Duration,
    /// Requests per minute per provider (0 = unlimited).
    pub requests_per_minute: usize,
}

impl Default for GatewayPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(32),
            timeout: Duration::from_secs(60),
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
            requests_per_minute: 0,
        }
    }
}

impl GatewayPolicy {
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_cap: Duration::from_millis(config.backoff_cap_ms),
            timeout: Duration::from_secs(config.timeout_secs),
            failure_threshold: config.failure_threshold,
            recovery_timeout: Duration::from_secs(config.recovery_timeout_secs),
            requests_per_minute: config.requests_per_minute,
        }
    }

    /// Delay before retrying after the `attempt`-th failure (1-based).
    pub fn backoff(&self, attempt: u32, error: &LlmError) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_cap);
        match error {
            LlmError::RateLimited { retry_after_secs } => {
                delay.max(Duration::from_secs(*retry_after_secs).min(self.backoff_cap))
            }
            _ => delay,
        }
    }
}

struct ProviderEntry {
    provider: Arc<dyn LlmProvider>,
    breaker: Mutex<CircuitBreaker>,
    limiter: Mutex<RequestLimiter>,
}

/// A validated value and the tokens spent producing it, rejected replies
/// included.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply<T> {
    pub value: T,
    pub usage: TokenUsage,
}

/// Uniform call interface over capability-equivalent providers.
pub struct LlmGateway {
    entries: Vec<ProviderEntry>,
    policy: GatewayPolicy,
    trace: Arc<dyn TraceSink>,
}

impl LlmGateway {
    /// Providers are tried in the given order.
    pub fn new(
        providers: Vec<Arc<dyn LlmProvider>>,
        policy: GatewayPolicy,
        trace: Arc<dyn TraceSink>,
    ) -> Self {
        let entries = providers
            .into_iter()
            .map(|provider| ProviderEntry {
                breaker: Mutex::new(CircuitBreaker::new(
                    provider.name(),
                    policy.failure_threshold,
                    policy.recovery_timeout,
                )),
                limiter: Mutex::new(RequestLimiter::new(policy.requests_per_minute)),
                provider,
            })
            .collect();
        Self {
            entries,
            policy,
            trace,
        }
    }

    /// Build OpenAI-compatible providers from configuration.
    ///
    /// Providers that fail to initialize (usually a missing API key) are
    /// skipped with a warning; at least one must remain.
    pub fn from_config(config: &LlmConfig, trace: Arc<dyn TraceSink>) -> Result<Self, LlmError> {
        let mut providers: Vec<Arc<dyn LlmProvider>> = Vec::new();
        for provider_config in &config.providers {
            match OpenAiCompatibleProvider::new(provider_config) {
                Ok(p) => providers.push(Arc::new(p)),
                Err(e) => {
                    warn!(
                        provider = %provider_config.name,
                        model = %provider_config.model,
                        error = %e,
                        "Skipping LLM provider that failed to initialize"
                    );
                }
            }
        }
        if providers.is_empty() {
            return Err(LlmError::NoProviders);
        }
        Ok(Self::new(providers, GatewayPolicy::from_config(config), trace))
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.provider.name()).collect()
    }

    /// Call the providers and validate the reply against contract `T`.
    pub async fn invoke<T: Contract>(
        &self,
        prompt: &Prompt,
        preference: Option<&str>,
    ) -> Result<Reply<T>, LlmError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempts = 0u32;
        let mut last_error: Option<LlmError> = None;
        let mut usage = TokenUsage::default();

        for entry in self.ordered(preference) {
            let name = entry.provider.name();
            if let Admission::Rejected { retry_in } = entry.breaker.lock().await.admit() {
                debug!(
                    provider = %name,
                    retry_in_ms = retry_in.as_millis() as u64,
                    "Skipping provider with open circuit"
                );
                continue;
            }

            for attempt in 1..=max_attempts {
                attempts += 1;
                match self.attempt::<T>(entry, prompt, attempt, &mut usage).await {
                    Ok(value) => {
                        entry.breaker.lock().await.record_success();
                        return Ok(Reply { value, usage });
                    }
                    Err(err) => {
                        let retryable = err.is_retryable();
                        warn!(
                            provider = %name,
                            purpose = prompt.purpose,
                            attempt,
                            retryable,
                            error = %err,
                            "LLM attempt failed"
                        );
                        let delay = self.policy.backoff(attempt, &err);
                        last_error = Some(err);
                        if !retryable || attempt == max_attempts {
                            break;
                        }
                        info!(
                            provider = %name,
                            backoff_ms = delay.as_millis() as u64,
                            "Retrying after transient error"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }

            entry.breaker.lock().await.record_failure();
            info!(provider = %name, "Failing over to next LLM provider");
        }

        Err(LlmError::Unavailable {
            attempts,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no provider accepted the call".to_string()),
        })
    }

    /// One attempt against one provider, including the correction re-prompt.
    async fn attempt<T: Contract>(
        &self,
        entry: &ProviderEntry,
        prompt: &Prompt,
        attempt: u32,
        usage: &mut TokenUsage,
    ) -> Result<T, LlmError> {
        let (response, latency) = self.complete_once(entry, prompt, attempt).await?;
        usage.accumulate(&response.usage);
        let violation = match schema_reply::<T>(&response.text) {
            Ok(value) => {
                self.emit(entry, prompt, attempt, latency, AttemptOutcome::Success);
                return Ok(value);
            }
            Err(violation) => violation,
        };

        self.emit(entry, prompt, attempt, latency, AttemptOutcome::SchemaViolation);
        debug!(
            provider = %entry.provider.name(),
            purpose = prompt.purpose,
            path = %violation.path,
            rule = %violation.rule,
            "Re-prompting after contract violation"
        );
        let corrected = prompt.with_correction(&violation, T::shape());
        let (response, latency) = self.complete_once(entry, &corrected, attempt).await?;
        usage.accumulate(&response.usage);
        match schema_reply::<T>(&response.text) {
            Ok(value) => {
                self.emit(entry, prompt, attempt, latency, AttemptOutcome::Success);
                Ok(value)
            }
            Err(violation) => {
                self.emit(entry, prompt, attempt, latency, AttemptOutcome::SchemaViolation);
                Err(LlmError::SchemaViolation { violation })
            }
        }
    }

    /// A single rate-limited, timed provider call.
    async fn complete_once(
        &self,
        entry: &ProviderEntry,
        prompt: &Prompt,
        attempt: u32,
    ) -> Result<(CompletionResponse, Duration), LlmError> {
        {
            let mut limiter = entry.limiter.lock().await;
            while let Some(wait) = limiter.check() {
                debug!(
                    provider = %entry.provider.name(),
                    wait_ms = wait.as_millis() as u64,
                    "Waiting for request budget"
                );
                tokio::time::sleep(wait).await;
            }
            limiter.record();
        }

        let started = Instant::now();
        let result = tokio::time::timeout(
            self.policy.timeout,
            entry.provider.complete(prompt.to_request()),
        )
        .await
        .unwrap_or_else(|_| {
            Err(LlmError::Timeout {
                timeout_secs: self.policy.timeout.as_secs(),
            })
        });
        let latency = started.elapsed();

        match result {
            Ok(response) => Ok((response, latency)),
            Err(err) => {
                let outcome = if err.is_retryable() {
                    AttemptOutcome::Transient
                } else {
                    AttemptOutcome::Fatal
                };
                self.emit(entry, prompt, attempt, latency, outcome);
                Err(err)
            }
        }
    }

    fn ordered(&self, preference: Option<&str>) -> Vec<&ProviderEntry> {
        let mut ordered: Vec<&ProviderEntry> = self.entries.iter().collect();
        if let Some(name) = preference
            && let Some(pos) = ordered.iter().position(|e| e.provider.name() == name)
        {
            let preferred = ordered.remove(pos);
            ordered.insert(0, preferred);
        }
        ordered
    }

    fn emit(
        &self,
        entry: &ProviderEntry,
        prompt: &Prompt,
        attempt: u32,
        latency: Duration,
        outcome: AttemptOutcome,
    ) {
        self.trace.emit(TraceEvent::Attempt {
            gateway: GatewayKind::Llm,
            provider: entry.provider.name().to_string(),
            purpose: prompt.purpose.to_string(),
            attempt,
            latency_ms: latency.as_millis() as u64,
            outcome,
        });
    }
}

/// Parse a model reply as contract `T`.
pub fn schema_reply<T: Contract>(text: &str) -> Result<T, ValidationError> {
    let value = extract_json(text).ok_or_else(|| ValidationError {
        schema: T::SCHEMA,
        path: "$".to_string(),
        rule: "reply is not a JSON object".to_string(),
    })?;
    schema::validate::<T>(value)
}

/// Find the JSON object in a model reply, tolerating code fences and
/// surrounding prose.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        if let Some(end) = body.find("```")
            && let Ok(value) = serde_json::from_str::<Value>(body[..end].trim())
        {
            return Some(value);
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::MemoryTraceSink;
    use crate::types::ResearchPlan;
    use serde_json::json;

    fn fast_policy() -> GatewayPolicy {
        GatewayPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(4),
            timeout: Duration::from_secs(5),
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
            requests_per_minute: 0,
        }
    }

    fn plan_json() -> Value {
        json!({"sub_queries": ["remote work productivity studies"], "rationale": "focus"})
    }

    fn prompt() -> Prompt {
        Prompt::new("plan", "You plan research.", "Plan: remote work")
    }

    fn gateway(
        providers: Vec<Arc<MockLlmProvider>>,
        policy: GatewayPolicy,
    ) -> (LlmGateway, Arc<MemoryTraceSink>) {
        let trace = Arc::new(MemoryTraceSink::new());
        let providers = providers
            .into_iter()
            .map(|p| p as Arc<dyn LlmProvider>)
            .collect();
        (LlmGateway::new(providers, policy, trace.clone()), trace)
    }

    #[test]
    fn test_extract_json_variants() {
        assert_eq!(extract_json(r#"{"a":1}"#), Some(json!({"a": 1})));
        assert_eq!(
            extract_json("Here you go:\n```json\n{\"a\": 2}\n```\nThanks"),
            Some(json!({"a": 2}))
        );
        assert_eq!(
            extract_json("Sure! {\"a\": 3} hope that helps"),
            Some(json!({"a": 3}))
        );
        assert_eq!(extract_json("no json here"), None);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = GatewayPolicy {
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(5),
            ..Default::default()
        };
        let err = LlmError::Timeout { timeout_secs: 1 };
        assert_eq!(policy.backoff(1, &err), Duration::from_secs(1));
        assert_eq!(policy.backoff(2, &err), Duration::from_secs(2));
        assert_eq!(policy.backoff(3, &err), Duration::from_secs(4));
        assert_eq!(policy.backoff(4, &err), Duration::from_secs(5));
        let limited = LlmError::RateLimited {
            retry_after_secs: 3,
        };
        assert_eq!(policy.backoff(1, &limited), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_invoke_returns_validated_value() {
        let mock = Arc::new(MockLlmProvider::named("primary"));
        mock.queue_json(plan_json());
        let (gw, trace) = gateway(vec![mock.clone()], fast_policy());

        let plan = gw.invoke::<ResearchPlan>(&prompt(), None).await.unwrap().value;
        assert_eq!(plan.sub_queries.len(), 1);
        assert_eq!(mock.call_count(), 1);
        assert!(mock.requests()[0].json_mode);
        assert_eq!(trace.attempts(GatewayKind::Llm).len(), 1);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let mock = Arc::new(MockLlmProvider::named("primary"));
        mock.queue_error(LlmError::Timeout { timeout_secs: 1 });
        mock.queue_error(LlmError::Connection {
            message: "reset".into(),
        });
        mock.queue_json(plan_json());
        let (gw, trace) = gateway(vec![mock.clone()], fast_policy());

        let plan = gw.invoke::<ResearchPlan>(&prompt(), None).await.unwrap().value;
        assert_eq!(plan.rationale, "focus");
        assert_eq!(mock.call_count(), 3);
        let outcomes: Vec<AttemptOutcome> = trace
            .attempts(GatewayKind::Llm)
            .into_iter()
            .filter_map(|e| match e {
                TraceEvent::Attempt { outcome, .. } => Some(outcome),
                _ => None,
            })
            .collect();
        assert_eq!(
            outcomes,
            vec![
                AttemptOutcome::Transient,
                AttemptOutcome::Transient,
                AttemptOutcome::Success
            ]
        );
    }

    #[tokio::test]
    async fn test_fatal_error_fails_over_immediately() {
        let primary = Arc::new(MockLlmProvider::named("primary"));
        primary.queue_error(LlmError::AuthFailed {
            provider: "primary".into(),
        });
        let secondary = Arc::new(MockLlmProvider::named("secondary"));
        secondary.queue_json(plan_json());
        let (gw, _) = gateway(vec![primary.clone(), secondary.clone()], fast_policy());

        let plan = gw.invoke::<ResearchPlan>(&prompt(), None).await.unwrap().value;
        assert_eq!(plan.sub_queries[0], "remote work productivity studies");
        assert_eq!(primary.call_count(), 1);
        assert_eq!(secondary.call_count(), 1);
    }

    #[tokio::test]
    async fn test_schema_violation_reprompts_once() {
        let mock = Arc::new(MockLlmProvider::named("primary"));
        mock.queue_json(json!({"sub_queries": []}));
        mock.queue_json(plan_json());
        let (gw, _) = gateway(vec![mock.clone()], fast_policy());

        let plan = gw.invoke::<ResearchPlan>(&prompt(), None).await.unwrap().value;
        assert_eq!(plan.sub_queries.len(), 1);
        let requests = mock.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].user.contains("previous reply was rejected"));
        assert!(requests[1].user.contains("sub_queries"));
    }

    #[tokio::test]
    async fn test_exhaustion_is_unavailable() {
        let primary = Arc::new(MockLlmProvider::named("primary"));
        let secondary = Arc::new(MockLlmProvider::named("secondary"));
        for _ in 0..3 {
            primary.queue_error(LlmError::Timeout { timeout_secs: 1 });
            secondary.queue_error(LlmError::ServerError {
                status: 503,
                message: "down".into(),
            });
        }
        let (gw, _) = gateway(vec![primary.clone(), secondary.clone()], fast_policy());

        let err = gw.invoke::<ResearchPlan>(&prompt(), None).await.unwrap_err();
        match err {
            LlmError::Unavailable { attempts, .. } => assert_eq!(attempts, 6),
            other => panic!("Expected Unavailable, got {other:?}"),
        }
        assert_eq!(primary.call_count(), 3);
        assert_eq!(secondary.call_count(), 3);
    }

    #[tokio::test]
    async fn test_preference_moves_provider_first() {
        let primary = Arc::new(MockLlmProvider::named("primary"));
        let secondary = Arc::new(MockLlmProvider::named("secondary"));
        secondary.queue_json(plan_json());
        let (gw, _) = gateway(vec![primary.clone(), secondary.clone()], fast_policy());

        let plan = gw
            .invoke::<ResearchPlan>(&prompt(), Some("secondary"))
            .await
            .unwrap()
            .value;
        assert_eq!(plan.rationale, "focus");
        assert_eq!(primary.call_count(), 0);
        assert_eq!(secondary.call_count(), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let slow = Arc::new(MockLlmProvider::named("slow").with_delay(Duration::from_millis(200)));
        slow.queue_json(plan_json());
        let fast = Arc::new(MockLlmProvider::named("fast"));
        fast.queue_json(plan_json());
        let policy = GatewayPolicy {
            max_attempts: 1,
            timeout: Duration::from_millis(20),
            ..fast_policy()
        };
        let (gw, trace) = gateway(vec![slow.clone(), fast.clone()], policy);

        let plan = gw.invoke::<ResearchPlan>(&prompt(), None).await.unwrap().value;
        assert_eq!(plan.sub_queries.len(), 1);
        assert_eq!(fast.call_count(), 1);
        assert!(trace.attempts(GatewayKind::Llm).iter().any(|e| matches!(
            e,
            TraceEvent::Attempt {
                outcome: AttemptOutcome::Transient,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_open_circuit_skips_provider() {
        let flaky = Arc::new(MockLlmProvider::named("flaky"));
        let backup = Arc::new(MockLlmProvider::named("backup"));
        flaky.queue_error(LlmError::AuthFailed {
            provider: "flaky".into(),
        });
        backup.queue_json(plan_json());
        backup.queue_json(plan_json());
        let policy = GatewayPolicy {
            failure_threshold: 1,
            ..fast_policy()
        };
        let (gw, _) = gateway(vec![flaky.clone(), backup.clone()], policy);

        assert!(gw.invoke::<ResearchPlan>(&prompt(), None).await.is_ok());
        assert!(gw.invoke::<ResearchPlan>(&prompt(), None).await.is_ok());
        assert_eq!(flaky.call_count(), 1);
        assert_eq!(backup.call_count(), 2);
    }

    #[tokio::test]
    async fn test_reply_usage_is_per_call() {
        let mock = Arc::new(MockLlmProvider::named("primary"));
        mock.queue_json(plan_json());
        mock.queue_json(json!({"sub_queries": []}));
        mock.queue_json(plan_json());
        let (gw, _) = gateway(vec![mock], fast_policy());

        let first = gw.invoke::<ResearchPlan>(&prompt(), None).await.unwrap();
        assert_eq!(first.usage, MockLlmProvider::USAGE);

        // the rejected reply is paid for too
        let corrected = gw.invoke::<ResearchPlan>(&prompt(), None).await.unwrap();
        assert_eq!(corrected.usage.total(), 2 * MockLlmProvider::USAGE.total());
    }
}
