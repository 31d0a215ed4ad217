//! Retry policy for delivery operations.
//!
//! Both delivery paths retry temporary failures with exponential backoff:
//! the wait after attempt `n` is `base * 2^(n-1)`, capped at `max_delay`.
//! With the defaults (base 2s, 3 attempts) a recipient is tried, then tried
//! again after 2s, then after 4s, and is reported failed if the third attempt
//! also fails.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry policy configuration for delivery operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of delivery attempts before giving up.
    ///
    /// Default: 3 attempts
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,

    /// Base delay for exponential backoff, in milliseconds.
    ///
    /// Default: 2000 (2 seconds)
    #[serde(default = "defaults::base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum delay between attempts, in milliseconds.
    ///
    /// Default: 60000 (1 minute)
    #[serde(default = "defaults::max_delay_ms")]
    pub max_delay_ms: u64,

    /// Randomise each delay within ±`jitter_factor`. Zero keeps the schedule
    /// exact.
    ///
    /// Default: 0.0
    #[serde(default)]
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::max_attempts(),
            base_delay_ms: defaults::base_delay_ms(),
            max_delay_ms: defaults::max_delay_ms(),
            jitter_factor: 0.0,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy with the given attempt budget and base delay, no jitter.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn with_base_delay(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: base_delay.as_millis() as u64,
            max_delay_ms: defaults::max_delay_ms(),
            jitter_factor: 0.0,
        }
    }

    /// Returns `true` if another attempt may follow attempt number
    /// `attempts_made` (1-based).
    #[must_use]
    pub const fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// The wait after failed attempt number `attempt` (1-based), before
    /// jitter: `base * 2^(attempt-1)`, capped at `max_delay_ms`.
    #[must_use]
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30);
        let delay = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// The wait after failed attempt number `attempt`, with jitter applied.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        if self.jitter_factor <= 0.0 || delay.is_zero() {
            return delay;
        }

        let jitter = rand::rng().random_range(-self.jitter_factor..=self.jitter_factor);
        delay.mul_f64((1.0 + jitter).max(0.0))
    }
}

mod defaults {
    pub const fn max_attempts() -> u32 {
        3
    }

    pub const fn base_delay_ms() -> u64 {
        2_000
    }

    pub const fn max_delay_ms() -> u64 {
        60_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay_ms, 2_000);
        assert!(policy.jitter_factor.abs() < f64::EPSILON);
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_capped() {
        let policy = RetryPolicy {
            max_delay_ms: 5_000,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(3), Duration::from_secs(5));
        assert_eq!(policy.delay_for(100), Duration::from_secs(5));
    }

    #[test]
    fn test_attempt_budget() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(5));
    }

    #[test]
    fn test_jitter_within_bounds() {
        let policy = RetryPolicy {
            jitter_factor: 0.1,
            ..RetryPolicy::default()
        };

        for _ in 0..100 {
            let delay = policy.delay_for(2);
            assert!(delay >= Duration::from_millis(3_599));
            assert!(delay <= Duration::from_millis(4_401));
        }
    }
}
