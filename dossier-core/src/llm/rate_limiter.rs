//! Client-side requests-per-minute limiter for LLM providers.
//!
//! Throttles calls before they are sent instead of relying on 429
//! backpressure. Each provider gets its own limiter behind the gateway's
//! mutex, so waits are serialized per provider.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Sliding one-minute window over request timestamps.
#[derive(Debug)]
pub struct RequestLimiter {
    /// Requests per minute (0 = unlimited).
    rpm: usize,
    requests_window: VecDeque<Instant>,
    window: Duration,
}

impl RequestLimiter {
    pub fn new(rpm: usize) -> Self {
        Self {
            rpm,
            requests_window: VecDeque::new(),
            window: Duration::from_secs(60),
        }
    }

    /// `None` if a request may go out now, otherwise how long to wait.
    pub fn check(&mut self) -> Option<Duration> {
        if self.rpm == 0 {
            return None;
        }
        let now = Instant::now();
        self.prune(now);

        if self.requests_window.len() >= self.rpm
            && let Some(&oldest) = self.requests_window.front()
        {
            let wait = self.window.saturating_sub(now.duration_since(oldest));
            if !wait.is_zero() {
                return Some(wait);
            }
        }
        None
    }

    /// Record that a request was sent.
    pub fn record(&mut self) {
        self.requests_window.push_back(Instant::now());
    }

    pub fn has_limit(&self) -> bool {
        self.rpm > 0
    }

    /// Requests counted in the current window.
    pub fn current_usage(&mut self) -> usize {
        self.prune(Instant::now());
        self.requests_window.len()
    }

    fn prune(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.window) else {
            return;
        };
        while self.requests_window.front().is_some_and(|t| *t < cutoff) {
            self.requests_window.pop_front();
        }
    }
}

/// Parse a `Retry-After` header given in seconds.
pub fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    let value = headers
        .get("retry-after")
        .or_else(|| headers.get("x-ratelimit-reset-requests"))
        .and_then(|v| v.to_str().ok())?;

    if let Ok(secs) = value.parse::<u64>() {
        return Some(secs);
    }
    if let Some(stripped) = value.strip_suffix('s')
        && let Ok(secs) = stripped.parse::<f64>()
    {
        return Some(secs.ceil() as u64);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited() {
        let mut limiter = RequestLimiter::new(0);
        for _ in 0..100 {
            assert!(limiter.check().is_none());
            limiter.record();
        }
        assert!(!limiter.has_limit());
    }

    #[test]
    fn test_rpm_delays_third_request() {
        let mut limiter = RequestLimiter::new(2);
        assert!(limiter.check().is_none());
        limiter.record();
        assert!(limiter.check().is_none());
        limiter.record();

        let delay = limiter.check();
        assert!(delay.is_some_and(|d| d.as_secs() > 0));
        assert_eq!(limiter.current_usage(), 2);
    }

    #[test]
    fn test_parse_retry_after() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("retry-after", "7".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(7));

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("x-ratelimit-reset-requests", "1.5s".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(2));

        assert_eq!(parse_retry_after(&reqwest::header::HeaderMap::new()), None);
    }
}
