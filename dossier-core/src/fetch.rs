//! Page content fetching for the Fetch stage.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::config::FetchConfig;
use crate::error::FetchError;
use crate::types::truncate_chars;

/// Retrieves readable text for a source URL.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, FetchError>;
}

/// Fetches over HTTP and reduces HTML to plain text.
pub struct HttpContentFetcher {
    client: reqwest::Client,
    timeout_secs: u64,
    max_content_chars: usize,
}

impl HttpContentFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| FetchError::Request {
                url: String::new(),
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            timeout_secs: config.timeout_secs,
            max_content_chars: config.max_content_chars,
        })
    }
}

#[async_trait]
impl ContentFetcher for HttpContentFetcher {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let parsed = url::Url::parse(url).map_err(|_| FetchError::InvalidUrl {
            url: url.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FetchError::InvalidUrl {
                url: url.to_string(),
            });
        }

        debug!(url, "Fetching source");
        let response = self.client.get(parsed).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout {
                    url: url.to_string(),
                    timeout_secs: self.timeout_secs,
                }
            } else {
                FetchError::Request {
                    url: url.to_string(),
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let is_html = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("html"));

        let body = response.text().await.map_err(|e| FetchError::Request {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        let text = if is_html {
            extract_text_from_html(&body)
        } else {
            body
        };
        Ok(truncate_chars(text.trim(), self.max_content_chars))
    }
}

/// Canned pages keyed by URL.
#[derive(Default)]
pub struct StaticContentFetcher {
    pages: HashMap<String, Result<String, u16>>,
    default_page: Option<String>,
}

impl StaticContentFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: impl Into<String>, content: impl Into<String>) -> Self {
        self.pages.insert(url.into(), Ok(content.into()));
        self
    }

    /// Make `url` answer with the given HTTP status.
    pub fn with_failure(mut self, url: impl Into<String>, status: u16) -> Self {
        self.pages.insert(url.into(), Err(status));
        self
    }

    /// Content served for any URL without an explicit entry.
    pub fn with_default(mut self, content: impl Into<String>) -> Self {
        self.default_page = Some(content.into());
        self
    }
}

#[async_trait]
impl ContentFetcher for StaticContentFetcher {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        match self.pages.get(url) {
            Some(Ok(content)) => Ok(content.clone()),
            Some(Err(status)) => Err(FetchError::Status {
                url: url.to_string(),
                status: *status,
            }),
            None => self.default_page.clone().ok_or_else(|| FetchError::Status {
                url: url.to_string(),
                status: 404,
            }),
        }
    }
}

const BLOCK_TAGS: &[&str] = &[
    "p", "br", "div", "h1", "h2", "h3", "h4", "h5", "h6", "li", "tr", "section", "article",
];

/// Strip tags, scripts and styles, decode common entities and collapse
/// blank lines.
pub fn extract_text_from_html(html: &str) -> String {
    let mut text = String::with_capacity(html.len() / 2);
    let mut in_tag = false;
    let mut building_tag = false;
    let mut skipping: Option<&'static str> = None;
    let mut tag_name = String::new();

    for ch in html.chars() {
        match ch {
            '<' => {
                in_tag = true;
                building_tag = true;
                tag_name.clear();
            }
            '>' if in_tag => {
                in_tag = false;
                building_tag = false;
                let tag = tag_name.to_ascii_lowercase();
                match tag.as_str() {
                    "script" => skipping = Some("/script"),
                    "style" => skipping = Some("/style"),
                    "noscript" => skipping = Some("/noscript"),
                    t if Some(t) == skipping => skipping = None,
                    _ => {}
                }
                let bare = tag.trim_start_matches('/');
                if BLOCK_TAGS.contains(&bare) {
                    text.push('\n');
                }
            }
            _ if in_tag => {
                if building_tag && (ch.is_ascii_alphanumeric() || ch == '/') {
                    tag_name.push(ch);
                } else {
                    building_tag = false;
                }
            }
            _ if skipping.is_some() => {}
            _ => text.push(ch),
        }
    }

    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");

    text.lines()
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
