//! Jittered exponential backoff for provider and store retries, plus the
//! cooperative yield sleep used while waiting for a turn.

use std::time::Duration;

use colloquy_core::config::ConversationConfig;
use rand::Rng;

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    initial: Duration,
    multiplier: f64,
    max: Duration,
    jitter: f64,
}

impl BackoffPolicy {
    pub fn new(initial: Duration, multiplier: f64, max: Duration, jitter: f64) -> Self {
        Self {
            initial,
            multiplier: multiplier.max(1.0),
            max,
            jitter: jitter.clamp(0.0, 0.99),
        }
    }

    pub fn from_config(config: &ConversationConfig) -> Self {
        Self::new(
            config.initial_backoff,
            config.backoff_multiplier,
            config.max_backoff,
            config.jitter_range,
        )
    }

    /// `min(max, initial × multiplier^attempt)`, attempt counted from 0.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let grown = self.initial.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(grown.min(self.max.as_secs_f64()))
    }

    /// The attempt delay with symmetric jitter applied.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        jittered(self.delay_for_attempt(attempt), self.jitter)
    }
}

/// `value × (1 ± jitter)`, uniformly drawn.
pub fn jittered(value: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return value;
    }
    let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
    Duration::from_secs_f64((value.as_secs_f64() * factor).max(0.0))
}

/// Cooperative turn-wait sleep: 200–400 ms, uniformly drawn.
pub fn yield_delay() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(200..=400))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_geometrically_and_caps() {
        let policy = BackoffPolicy::new(Duration::from_secs_f64(2.0), 2.0, Duration::from_secs_f64(120.0), 0.0);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs_f64(2.0));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs_f64(4.0));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs_f64(64.0));
        assert_eq!(policy.delay_for_attempt(7), Duration::from_secs_f64(120.0));
    }

    #[test]
    fn zero_jitter_is_exact() {
        let policy = BackoffPolicy::new(Duration::from_millis(10), 2.0, Duration::from_secs(1), 0.0);
        assert_eq!(policy.jittered_delay(0), Duration::from_millis(10));
        assert_eq!(policy.jittered_delay(1), Duration::from_millis(20));
    }

    #[test]
    fn jitter_stays_within_the_band() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let delayed = jittered(base, 0.2);
            assert!(delayed >= Duration::from_secs_f64(8.0));
            assert!(delayed <= Duration::from_secs_f64(12.0));
        }
    }

    #[test]
    fn yield_delay_stays_in_range() {
        for _ in 0..100 {
            let delay = yield_delay();
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(400));
        }
    }
}
