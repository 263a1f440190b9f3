use std::time::Duration;

use rand::Rng;

use crate::GatewayError;

/// Retry policy with exponential backoff and symmetric jitter.
///
/// Pure decision object: it never sleeps, it only answers whether another
/// attempt is worth making and how long to wait before it.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, jitter: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter,
        }
    }

    /// Maximum number of attempts, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether the error should trigger another attempt. Non-retryable
    /// error classes are never retried regardless of attempts remaining.
    pub fn should_retry(&self, error: &GatewayError, attempt: u32) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        error.is_retryable()
    }

    /// Deterministic backoff for an attempt: `base * 2^(attempt-1)`,
    /// capped at the configured maximum. Non-decreasing in `attempt`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let backoff = self.base_delay.saturating_mul(1u32 << exponent);
        backoff.min(self.max_delay)
    }

    /// Backoff with ± `jitter` fraction applied, floored at zero.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let backoff = self.backoff_for(attempt).as_secs_f64();
        let jitter_amount = backoff * self.jitter;
        let jittered = backoff + rand::thread_rng().gen_range(-jitter_amount..=jitter_amount);
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            jitter: 0.1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout() -> GatewayError {
        GatewayError::Timeout {
            timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn retries_transient_errors_until_attempt_cap() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(&timeout(), 1));
        assert!(policy.should_retry(&GatewayError::Server { code: 502 }, 2));
        assert!(!policy.should_retry(&timeout(), 3));
        assert!(!policy.should_retry(&timeout(), 4));
    }

    #[test]
    fn never_retries_declines() {
        let policy = RetryPolicy::default();
        let declined = GatewayError::Declined {
            reason: "Card expired".to_string(),
        };
        for attempt in 1..10 {
            assert!(!policy.should_retry(&declined, attempt));
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(
            5,
            Duration::from_millis(200),
            Duration::from_secs(2),
            0.0,
        );
        assert_eq!(policy.backoff_for(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(400));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(800));
        assert_eq!(policy.backoff_for(4), Duration::from_millis(1600));
        assert_eq!(policy.backoff_for(5), Duration::from_secs(2));
        assert_eq!(policy.backoff_for(12), Duration::from_secs(2));
    }

    #[test]
    fn backoff_is_non_decreasing() {
        let policy = RetryPolicy::default();
        let mut previous = Duration::ZERO;
        for attempt in 1..40 {
            let backoff = policy.backoff_for(attempt);
            assert!(backoff >= previous);
            previous = backoff;
        }
    }

    #[test]
    fn jittered_delay_stays_within_bounds() {
        let policy = RetryPolicy::new(
            3,
            Duration::from_millis(200),
            Duration::from_secs(2),
            0.1,
        );
        for attempt in 1..=3 {
            let backoff = policy.backoff_for(attempt).as_secs_f64();
            for _ in 0..200 {
                let delay = policy.delay_for(attempt).as_secs_f64();
                assert!(delay >= backoff * 0.9 - 1e-9);
                assert!(delay <= backoff * 1.1 + 1e-9);
            }
        }
    }
}
