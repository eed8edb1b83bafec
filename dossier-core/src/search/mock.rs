//! Scripted search provider for tests and offline runs.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::SearchProvider;
use crate::error::SearchError;
use crate::types::SearchResult;

/// Returns queued replies first, then the fallback results (empty unless
/// set with [`MockSearchProvider::with_results`]). Replies are returned
/// untruncated so the gateway's filtering can be observed.
pub struct MockSearchProvider {
    name: String,
    queue: Mutex<VecDeque<Result<Vec<SearchResult>, SearchError>>>,
    fallback: Vec<SearchResult>,
    delay: Option<Duration>,
    queries: Mutex<Vec<String>>,
}

impl MockSearchProvider {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: Mutex::new(VecDeque::new()),
            fallback: Vec::new(),
            delay: None,
            queries: Mutex::new(Vec::new()),
        }
    }

    /// A provider that never finds anything.
    pub fn empty(name: impl Into<String>) -> Self {
        Self::named(name)
    }

    pub fn with_results(mut self, results: Vec<SearchResult>) -> Self {
        self.fallback = results;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn queue_results(&self, results: Vec<SearchResult>) {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Ok(results));
    }

    pub fn queue_error(&self, error: SearchError) {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Err(error));
    }

    /// Queries received so far, in order.
    pub fn queries(&self) -> Vec<String> {
        self.queries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.queries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl SearchProvider for MockSearchProvider {
    async fn search(
        &self,
        query: &str,
        _max_results: usize,
    ) -> Result<Vec<SearchResult>, SearchError> {
        self.queries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(query.to_string());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let queued = self
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match queued {
            Some(reply) => reply,
            None => Ok(self.fallback.clone()),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
