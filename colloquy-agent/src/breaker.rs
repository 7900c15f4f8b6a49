//! Per-agent circuit breaker over provider calls.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation.
    Closed,
    /// Fail fast; no calls until the cooldown elapses.
    Open,
    /// One probe call decides: success closes, failure reopens.
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    provider: String,
    failure_threshold: u32,
    cooldown: Duration,
    failure_count: u32,
    state: BreakerState,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(provider: impl Into<String>, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            provider: provider.into(),
            failure_threshold: failure_threshold.max(1),
            cooldown,
            failure_count: 0,
            state: BreakerState::Closed,
            opened_at: None,
        }
    }

    /// True only while OPEN. Checking an expired cooldown flips the gate
    /// to HALF_OPEN as a side effect.
    pub fn is_open(&mut self) -> bool {
        if self.state == BreakerState::Open {
            let elapsed = self.opened_at.map(|at| at.elapsed()).unwrap_or(Duration::ZERO);
            if elapsed >= self.cooldown {
                self.state = BreakerState::HalfOpen;
                tracing::info!(provider = %self.provider, "circuit_breaker_half_open");
                return false;
            }
            return true;
        }
        false
    }

    pub fn record_success(&mut self) {
        if self.state == BreakerState::HalfOpen {
            self.state = BreakerState::Closed;
            tracing::info!(provider = %self.provider, "circuit_breaker_closed");
        }
        self.failure_count = 0;
    }

    pub fn record_failure(&mut self) {
        self.failure_count += 1;

        let opens = match self.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => self.failure_count >= self.failure_threshold,
            BreakerState::Open => false,
        };
        if opens {
            self.state = BreakerState::Open;
            self.opened_at = Some(Instant::now());
            tracing::warn!(
                provider = %self.provider,
                failures = self.failure_count,
                cooldown_secs = self.cooldown.as_secs(),
                "circuit_breaker_opened"
            );
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown: Duration) -> CircuitBreaker {
        CircuitBreaker::new("claude", threshold, cooldown)
    }

    #[test]
    fn opens_on_the_threshold_consecutive_failure() {
        let mut b = breaker(5, Duration::from_secs(60));
        for _ in 0..4 {
            b.record_failure();
            assert_eq!(b.state(), BreakerState::Closed);
        }
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(b.is_open());
    }

    #[test]
    fn success_resets_the_consecutive_count() {
        let mut b = breaker(3, Duration::from_secs(60));
        b.record_failure();
        b.record_failure();
        b.record_success();
        assert_eq!(b.failure_count(), 0);

        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[test]
    fn expired_cooldown_flips_to_half_open_on_check() {
        let mut b = breaker(1, Duration::ZERO);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);

        // Zero cooldown: the very next check probes.
        assert!(!b.is_open());
        assert_eq!(b.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn half_open_success_closes_and_failure_reopens() {
        let mut b = breaker(1, Duration::ZERO);
        b.record_failure();
        assert!(!b.is_open());
        assert_eq!(b.state(), BreakerState::HalfOpen);

        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.failure_count(), 0);

        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.is_open());
        assert_eq!(b.state(), BreakerState::HalfOpen);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[test]
    fn open_stays_open_until_cooldown() {
        let mut b = breaker(1, Duration::from_secs(3600));
        b.record_failure();
        assert!(b.is_open());
        assert!(b.is_open(), "still open well before the cooldown");
        assert_eq!(b.state(), BreakerState::Open);
    }
}
