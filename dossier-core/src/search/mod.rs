//! Search Gateway: uniform interface over prioritized search providers.
//!
//! [`SearchGateway::search`] never fails. Provider errors and timeouts are
//! logged, traced and skipped; when nothing usable comes back the gateway
//! returns an explicitly empty [`SearchResultSet`], which the workflow
//! treats as the signal to retry with a revised query.

pub mod duckduckgo;
pub mod mock;
pub mod tavily;

pub use duckduckgo::DuckDuckGoSearch;
pub use mock::MockSearchProvider;
pub use tavily::TavilySearch;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::circuit::{Admission, CircuitBreaker};
use crate::config::{SearchConfig, SearchProviderConfig, SearchProviderKind};
use crate::error::SearchError;
use crate::trace::{AttemptOutcome, GatewayKind, TraceEvent, TraceSink};
use crate::types::{SearchResult, SearchResultSet};

/// Trait for search backends.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, max_results: usize)
    -> Result<Vec<SearchResult>, SearchError>;

    fn name(&self) -> &str;
}

struct SearchEntry {
    provider: Arc<dyn SearchProvider>,
    breaker: Mutex<CircuitBreaker>,
}

pub struct SearchGateway {
    entries: Vec<SearchEntry>,
    timeout: Duration,
    trace: Arc<dyn TraceSink>,
}

impl SearchGateway {
    /// Providers are queried in the given order.
    pub fn new(
        providers: Vec<Arc<dyn SearchProvider>>,
        timeout: Duration,
        trace: Arc<dyn TraceSink>,
    ) -> Self {
        Self::with_breakers(providers, timeout, 3, Duration::from_secs(120), trace)
    }

    pub fn with_breakers(
        providers: Vec<Arc<dyn SearchProvider>>,
        timeout: Duration,
        failure_threshold: usize,
        recovery_timeout: Duration,
        trace: Arc<dyn TraceSink>,
    ) -> Self {
        let entries = providers
            .into_iter()
            .map(|provider| SearchEntry {
                breaker: Mutex::new(CircuitBreaker::new(
                    provider.name(),
                    failure_threshold,
                    recovery_timeout,
                )),
                provider,
            })
            .collect();
        Self {
            entries,
            timeout,
            trace,
        }
    }

    /// Build the configured providers. Providers missing credentials are
    /// skipped with a warning.
    pub fn from_config(config: &SearchConfig, trace: Arc<dyn TraceSink>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .user_agent(concat!("Dossier/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();

        let mut providers: Vec<Arc<dyn SearchProvider>> = Vec::new();
        for provider_config in &config.providers {
            match build_provider(provider_config, client.clone()) {
                Ok(provider) => providers.push(provider),
                Err(e) => warn!(error = %e, "Skipping search provider that failed to initialize"),
            }
        }
        Self::with_breakers(
            providers,
            Duration::from_secs(config.timeout_secs),
            config.failure_threshold,
            Duration::from_secs(config.recovery_timeout_secs),
            trace,
        )
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.provider.name()).collect()
    }

    /// Return the first non-empty result set, or an empty set.
    pub async fn search(&self, query: &str, max_results: usize) -> SearchResultSet {
        for (index, entry) in self.entries.iter().enumerate() {
            let name = entry.provider.name();
            if let Admission::Rejected { retry_in } = entry.breaker.lock().await.admit() {
                debug!(
                    provider = %name,
                    retry_in_ms = retry_in.as_millis() as u64,
                    "Skipping search provider with open circuit"
                );
                continue;
            }

            let started = Instant::now();
            let outcome =
                tokio::time::timeout(self.timeout, entry.provider.search(query, max_results)).await;
            let latency = started.elapsed();

            let (set, attempt_outcome) = match outcome {
                Ok(Ok(results)) => {
                    entry.breaker.lock().await.record_success();
                    let set = SearchResultSet::from_results(
                        results
                            .into_iter()
                            .map(|mut r| {
                                r.provider.get_or_insert_with(|| name.to_string());
                                r
                            })
                            .collect(),
                        max_results,
                    );
                    let outcome = if set.is_empty() {
                        AttemptOutcome::Empty
                    } else {
                        AttemptOutcome::Success
                    };
                    (Some(set), outcome)
                }
                Ok(Err(e)) => {
                    entry.breaker.lock().await.record_failure();
                    warn!(provider = %name, query, error = %e, "Search provider failed");
                    (None, AttemptOutcome::Transient)
                }
                Err(_) => {
                    entry.breaker.lock().await.record_failure();
                    warn!(
                        provider = %name,
                        query,
                        timeout_secs = self.timeout.as_secs(),
                        "Search provider timed out"
                    );
                    (None, AttemptOutcome::Transient)
                }
            };

            self.trace.emit(TraceEvent::Attempt {
                gateway: GatewayKind::Search,
                provider: name.to_string(),
                purpose: "search".to_string(),
                attempt: index as u32 + 1,
                latency_ms: latency.as_millis() as u64,
                outcome: attempt_outcome,
            });

            if let Some(set) = set
                && !set.is_empty()
            {
                info!(provider = %name, query, results = set.len(), "Search returned results");
                return set;
            }
        }

        info!(query, "Every search provider came back empty");
        SearchResultSet::empty()
    }

    /// Merge per-sub-query result sets.
    pub fn merge(sets: Vec<SearchResultSet>, max_results: usize) -> SearchResultSet {
        SearchResultSet::merge(sets, max_results)
    }
}

fn build_provider(
    config: &SearchProviderConfig,
    client: reqwest::Client,
) -> Result<Arc<dyn SearchProvider>, SearchError> {
    match config.kind {
        SearchProviderKind::Tavily => {
            let var = config
                .api_key_env
                .clone()
                .unwrap_or_else(|| "TAVILY_API_KEY".to_string());
            let api_key = std::env::var(&var)
                .ok()
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| SearchError::MissingCredentials {
                    provider: "tavily".to_string(),
                    var: var.clone(),
                })?;
            Ok(Arc::new(TavilySearch::new(client, api_key, config.base_url.clone())))
        }
        SearchProviderKind::DuckDuckGo => Ok(Arc::new(DuckDuckGoSearch::new(
            client,
            config.base_url.clone(),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::MemoryTraceSink;

    fn hit(url: &str, relevance: f64) -> SearchResult {
        SearchResult::new(url, "t", "s", relevance)
    }

    fn gateway(providers: Vec<Arc<MockSearchProvider>>) -> (SearchGateway, Arc<MemoryTraceSink>) {
        let trace = Arc::new(MemoryTraceSink::new());
        let providers = providers
            .into_iter()
            .map(|p| p as Arc<dyn SearchProvider>)
            .collect();
        (
            SearchGateway::new(providers, Duration::from_millis(200), trace.clone()),
            trace,
        )
    }

    #[tokio::test]
    async fn test_first_non_empty_provider_wins() {
        let first = Arc::new(MockSearchProvider::named("first"));
        first.queue_results(vec![]);
        let second =
            Arc::new(MockSearchProvider::named("second").with_results(vec![hit("https://b.com", 0.5)]));
        let third = Arc::new(MockSearchProvider::named("third"));
        let (gw, trace) = gateway(vec![first.clone(), second.clone(), third.clone()]);

        let set = gw.search("q", 5).await;
        assert_eq!(set.len(), 1);
        assert_eq!(set.results()[0].provider.as_deref(), Some("second"));
        assert_eq!(first.call_count(), 1);
        assert_eq!(third.call_count(), 0);
        assert_eq!(trace.attempts(GatewayKind::Search).len(), 2);
    }

    #[tokio::test]
    async fn test_errors_fall_through_to_empty() {
        let broken = Arc::new(MockSearchProvider::named("broken"));
        broken.queue_error(SearchError::Request {
            provider: "broken".into(),
            message: "503".into(),
        });
        let slow = Arc::new(
            MockSearchProvider::named("slow")
                .with_results(vec![hit("https://a.com", 0.9)])
                .with_delay(Duration::from_secs(2)),
        );
        let (gw, _) = gateway(vec![broken, slow]);

        let set = gw.search("q", 5).await;
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_results_are_dropped_and_truncated() {
        let provider = Arc::new(MockSearchProvider::named("p").with_results(vec![
            hit("https://a.com/1", 0.2),
            hit("mailto:x@y.z", 0.9),
            hit("https://a.com/2", 0.8),
            hit("https://a.com/3", 0.6),
        ]));
        let (gw, _) = gateway(vec![provider]);

        let set = gw.search("q", 2).await;
        let urls: Vec<&str> = set.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, vec!["https://a.com/2", "https://a.com/3"]);
    }

    #[tokio::test]
    async fn test_no_providers_is_empty() {
        let (gw, _) = gateway(vec![]);
        assert!(gw.search("q", 5).await.is_empty());
    }

    #[test]
    fn test_merge_dedupes_across_sub_queries() {
        let a = SearchResultSet::from_results(vec![hit("https://x.com/a", 0.3)], 5);
        let b = SearchResultSet::from_results(
            vec![hit("https://x.com/a/", 0.9), hit("https://x.com/b", 0.5)],
            5,
        );
        let merged = SearchGateway::merge(vec![a, b], 10);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.results()[0].relevance, 0.9);
    }
}
