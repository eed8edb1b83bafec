//! DuckDuckGo instant-answer provider. Needs no API key.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::SearchProvider;
use super::tavily::rank_relevance;
use crate::error::SearchError;
use crate::types::SearchResult;

const DEFAULT_ENDPOINT: &str = "https://api.duckduckgo.com/";

pub struct DuckDuckGoSearch {
    client: reqwest::Client,
    endpoint: String,
}

impl DuckDuckGoSearch {
    pub fn new(client: reqwest::Client, endpoint: Option<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
        }
    }

    /// Collect the abstract, `Results` and `RelatedTopics` entries (topic
    /// groups are flattened) in that order.
    fn parse_results(body: &Value, max_results: usize) -> Vec<SearchResult> {
        let mut results = Vec::new();

        if let Some(abstract_text) = body.get("AbstractText").and_then(|v| v.as_str())
            && !abstract_text.is_empty()
            && let Some(url) = body.get("AbstractURL").and_then(|v| v.as_str())
        {
            let title = body
                .get("Heading")
                .and_then(|v| v.as_str())
                .filter(|h| !h.is_empty())
                .or_else(|| body.get("AbstractSource").and_then(|v| v.as_str()))
                .unwrap_or(url);
            results.push((url.to_string(), title.to_string(), abstract_text.to_string()));
        }

        let mut topics: Vec<&Value> = Vec::new();
        for key in ["Results", "RelatedTopics"] {
            if let Some(items) = body.get(key).and_then(|v| v.as_array()) {
                for item in items {
                    match item.get("Topics").and_then(|v| v.as_array()) {
                        Some(nested) => topics.extend(nested.iter()),
                        None => topics.push(item),
                    }
                }
            }
        }
        for topic in topics {
            let (Some(text), Some(url)) = (
                topic.get("Text").and_then(|v| v.as_str()),
                topic.get("FirstURL").and_then(|v| v.as_str()),
            ) else {
                continue;
            };
            let title = text.split(" - ").next().unwrap_or(text);
            results.push((url.to_string(), title.to_string(), text.to_string()));
        }

        results
            .into_iter()
            .take(max_results)
            .enumerate()
            .map(|(rank, (url, title, snippet))| SearchResult {
                url,
                title,
                snippet,
                relevance: rank_relevance(rank),
                provider: Some("duckduckgo".to_string()),
            })
            .collect()
    }
}

#[async_trait]
impl SearchProvider for DuckDuckGoSearch {
    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let url = format!(
            "{}?q={}&format=json&no_html=1&skip_disambig=1",
            self.endpoint,
            urlencoding::encode(query)
        );
        debug!(query, "Querying DuckDuckGo");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SearchError::Request {
                provider: "duckduckgo".to_string(),
                message: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(SearchError::Request {
                provider: "duckduckgo".to_string(),
                message: format!("status {}", response.status()),
            });
        }

        let body: Value = response.json().await.map_err(|e| SearchError::Parse {
            provider: "duckduckgo".to_string(),
            message: e.to_string(),
        })?;
        Ok(Self::parse_results(&body, max_results))
    }

    fn name(&self) -> &str {
        "duckduckgo"
    }
}
