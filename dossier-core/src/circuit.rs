//! Per-provider circuit breaker shared by the LLM and search gateways.
//!
//! Consecutive failures open the circuit until a cool-down deadline. Past
//! the deadline calls are let through on trial; a successful trial closes the
//! circuit and a failed one re-opens it with twice the previous cool-down,
//! up to [`MAX_COOLDOWN_FACTOR`] times the configured one.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Cap on cool-down growth across repeated failed trials.
pub const MAX_COOLDOWN_FACTOR: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CircuitState {
    Closed,
    /// Calls are refused until the deadline.
    Open { until: Instant },
    /// Cool-down over; the next outcome decides.
    HalfOpen,
}

/// Answer to "may I call this provider now?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The circuit is half-open and this call tests the provider.
    Trial,
    Rejected { retry_in: Duration },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    provider: String,
    state: CircuitState,
    consecutive_failures: usize,
    failure_threshold: usize,
    base_cooldown: Duration,
    /// Times the circuit opened since it was last closed by a success.
    trips: u32,
}

impl CircuitBreaker {
    pub fn new(provider: impl Into<String>, failure_threshold: usize, cooldown: Duration) -> Self {
        Self {
            provider: provider.into(),
            state: CircuitState::Closed,
            consecutive_failures: 0,
            failure_threshold: failure_threshold.max(1),
            base_cooldown: cooldown,
            trips: 0,
        }
    }

    pub fn admit(&mut self) -> Admission {
        match self.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::HalfOpen => Admission::Trial,
            CircuitState::Open { until } => {
                let now = Instant::now();
                if now >= until {
                    debug!(provider = %self.provider, "Cool-down over, admitting trial call");
                    self.state = CircuitState::HalfOpen;
                    Admission::Trial
                } else {
                    Admission::Rejected {
                        retry_in: until - now,
                    }
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        if self.state != CircuitState::Closed {
            debug!(provider = %self.provider, trips = self.trips, "Provider recovered, closing circuit");
        }
        self.consecutive_failures = 0;
        self.trips = 0;
        self.state = CircuitState::Closed;
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        let trip = match self.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => self.consecutive_failures >= self.failure_threshold,
            CircuitState::Open { .. } => false,
        };
        if trip {
            self.trips += 1;
            let cooldown = self.cooldown();
            warn!(
                provider = %self.provider,
                failures = self.consecutive_failures,
                cooldown_ms = cooldown.as_millis() as u64,
                "Opening circuit"
            );
            self.state = CircuitState::Open {
                until: Instant::now() + cooldown,
            };
        }
    }

    /// Cool-down for the current trip count.
    pub fn cooldown(&self) -> Duration {
        let factor = 1u32 << self.trips.saturating_sub(1).min(MAX_COOLDOWN_FACTOR.ilog2());
        self.base_cooldown.saturating_mul(factor)
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_after_threshold() {
        let mut cb = CircuitBreaker::new("p", 3, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.admit(), Admission::Allowed);
        cb.record_failure();
        assert!(matches!(cb.state(), CircuitState::Open { .. }));
        match cb.admit() {
            Admission::Rejected { retry_in } => assert!(retry_in <= Duration::from_secs(60)),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_success_resets_count() {
        let mut cb = CircuitBreaker::new("p", 2, Duration::from_secs(60));
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_trial_after_cooldown_closes_on_success() {
        let mut cb = CircuitBreaker::new("p", 1, Duration::ZERO);
        cb.record_failure();
        assert_eq!(cb.admit(), Admission::Trial);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.admit(), Admission::Allowed);
    }

    #[test]
    fn test_failed_trial_reopens() {
        let mut cb = CircuitBreaker::new("p", 5, Duration::ZERO);
        for _ in 0..5 {
            cb.record_failure();
        }
        assert_eq!(cb.admit(), Admission::Trial);
        cb.record_failure();
        assert!(matches!(cb.state(), CircuitState::Open { .. }));
    }

    #[test]
    fn test_cooldown_doubles_per_trip_and_caps() {
        let base = Duration::from_secs(10);
        let mut cb = CircuitBreaker::new("p", 1, base);
        assert_eq!(cb.cooldown(), base);

        let mut seen = Vec::new();
        for _ in 0..6 {
            cb.record_failure();
            seen.push(cb.cooldown());
            // pretend the cool-down passed so the next failure is a trial
            cb.state = CircuitState::HalfOpen;
        }
        assert_eq!(
            seen,
            vec![base, base * 2, base * 4, base * 8, base * 8, base * 8]
        );

        cb.record_success();
        assert_eq!(cb.cooldown(), base);
    }
}
