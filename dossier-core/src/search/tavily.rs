//! Tavily search API provider.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use super::SearchProvider;
use crate::error::SearchError;
use crate::types::SearchResult;

const DEFAULT_ENDPOINT: &str = "https://api.tavily.com/search";

pub struct TavilySearch {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
}

impl TavilySearch {
    pub fn new(client: reqwest::Client, api_key: String, endpoint: Option<String>) -> Self {
        Self {
            client,
            api_key,
            endpoint: endpoint.unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
        }
    }

    /// Convert a Tavily payload into search results.
    ///
    /// Rows without a URL are skipped. A missing `score` falls back to a
    /// rank-based relevance.
    fn parse_results(payload: &Value) -> Result<Vec<SearchResult>, SearchError> {
        let rows = payload
            .get("results")
            .and_then(|v| v.as_array())
            .ok_or_else(|| SearchError::Parse {
                provider: "tavily".to_string(),
                message: "missing results array".to_string(),
            })?;

        let mut results = Vec::with_capacity(rows.len());
        for (rank, row) in rows.iter().enumerate() {
            let url = row
                .get("url")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .trim();
            if url.is_empty() {
                continue;
            }
            let relevance = row
                .get("score")
                .and_then(|v| v.as_f64())
                .unwrap_or_else(|| rank_relevance(rank));
            results.push(SearchResult {
                url: url.to_string(),
                title: row
                    .get("title")
                    .and_then(|v| v.as_str())
                    .unwrap_or(url)
                    .to_string(),
                snippet: row
                    .get("content")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                relevance,
                provider: Some("tavily".to_string()),
            });
        }
        Ok(results)
    }
}

/// Relevance assigned by position when a provider gives no score.
pub(crate) fn rank_relevance(rank: usize) -> f64 {
    (1.0 - rank as f64 * 0.1).max(0.1)
}

#[async_trait]
impl SearchProvider for TavilySearch {
    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let body = json!({
            "query": query,
            "search_depth": "basic",
            "max_results": max_results,
            "include_answer": false,
            "include_raw_content": false,
        });
        debug!(query, max_results, "Querying Tavily");

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| SearchError::Request {
                provider: "tavily".to_string(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SearchError::Request {
                provider: "tavily".to_string(),
                message: format!("status {status}: {body}"),
            });
        }

        let payload: Value = response.json().await.map_err(|e| SearchError::Parse {
            provider: "tavily".to_string(),
            message: e.to_string(),
        })?;
        Self::parse_results(&payload)
    }

    fn name(&self) -> &str {
        "tavily"
    }
}
