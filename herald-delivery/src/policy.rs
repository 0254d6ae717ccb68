//! Retry policy for delivery attempts.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// When to give up on a message and how long to wait between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failed attempts after which a message is dead-lettered.
    ///
    /// Default: 5
    #[serde(default = "defaults::retry_threshold")]
    pub retry_threshold: u32,

    /// Base delay for exponential backoff (in seconds).
    ///
    /// The delay after the n-th failure is `base * 2^(n - 1)`.
    ///
    /// Default: 60 seconds
    #[serde(default = "defaults::base_retry_delay_secs")]
    pub base_retry_delay_secs: u64,

    /// Upper bound on the backoff delay (in seconds).
    ///
    /// Default: 3600 seconds (1 hour)
    #[serde(default = "defaults::max_retry_delay_secs")]
    pub max_retry_delay_secs: u64,

    /// Delays are randomized within ±`retry_jitter_factor`.
    ///
    /// Default: 0.1 (±10%)
    #[serde(default = "defaults::retry_jitter_factor")]
    pub retry_jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_threshold: defaults::retry_threshold(),
            base_retry_delay_secs: defaults::base_retry_delay_secs(),
            max_retry_delay_secs: defaults::max_retry_delay_secs(),
            retry_jitter_factor: defaults::retry_jitter_factor(),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_threshold(mut self, retry_threshold: u32) -> Self {
        self.retry_threshold = retry_threshold;
        self
    }

    /// A policy that retries immediately, for tests and manual flushes.
    #[must_use]
    pub const fn without_backoff(mut self) -> Self {
        self.base_retry_delay_secs = 0;
        self.max_retry_delay_secs = 0;
        self.retry_jitter_factor = 0.0;
        self
    }

    /// Another attempt is allowed after `error_count` failures.
    #[must_use]
    pub const fn should_retry(&self, error_count: u32) -> bool {
        error_count < self.retry_threshold
    }

    #[must_use]
    pub const fn is_exhausted(&self, error_count: u32) -> bool {
        !self.should_retry(error_count)
    }

    #[must_use]
    pub const fn remaining_attempts(&self, error_count: u32) -> u32 {
        self.retry_threshold.saturating_sub(error_count)
    }

    /// Backoff after the `error_count`-th failure, before jitter.
    #[must_use]
    pub fn base_delay(&self, error_count: u32) -> Duration {
        let exponent = error_count.saturating_sub(1);
        let delay = if exponent >= 63 {
            self.max_retry_delay_secs
        } else {
            self.base_retry_delay_secs
                .saturating_mul(1u64 << exponent)
                .min(self.max_retry_delay_secs)
        };
        Duration::from_secs(delay)
    }

    /// Earliest time of the next attempt after the `error_count`-th failure.
    #[must_use]
    pub fn next_retry_at(&self, error_count: u32) -> DateTime<Utc> {
        let delay = self.base_delay(error_count).as_secs_f64();

        let jittered = if self.retry_jitter_factor > 0.0 && delay > 0.0 {
            let range = delay * self.retry_jitter_factor;
            (delay + rand::rng().random_range(-range..=range)).max(0.0)
        } else {
            delay
        };

        let now = Utc::now();
        chrono::Duration::from_std(Duration::from_secs_f64(jittered))
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

mod defaults {
    pub const fn retry_threshold() -> u32 {
        5
    }

    pub const fn base_retry_delay_secs() -> u64 {
        60
    }

    pub const fn max_retry_delay_secs() -> u64 {
        3600
    }

    pub const fn retry_jitter_factor() -> f64 {
        0.1
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn threshold_helpers() {
        let policy = RetryPolicy::new().with_threshold(3);
        assert!(policy.should_retry(2));
        assert!(policy.is_exhausted(3));
        assert_eq!(policy.remaining_attempts(1), 2);
        assert_eq!(policy.remaining_attempts(9), 0);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::new();
        assert_eq!(policy.base_delay(1), Duration::from_secs(60));
        assert_eq!(policy.base_delay(2), Duration::from_secs(120));
        assert_eq!(policy.base_delay(3), Duration::from_secs(240));
        assert_eq!(policy.base_delay(20), Duration::from_secs(3600));
        assert_eq!(policy.base_delay(u32::MAX), Duration::from_secs(3600));
    }

    #[test]
    fn jitter_stays_in_range() {
        let policy = RetryPolicy::new();
        for _ in 0..100 {
            let delay = (policy.next_retry_at(2) - Utc::now()).num_seconds();
            assert!((107..=132).contains(&delay), "delay {delay} outside ±10% of 120");
        }
    }

    #[test]
    fn without_backoff_is_immediate() {
        let policy = RetryPolicy::new().without_backoff();
        assert!(policy.next_retry_at(4) <= Utc::now());
    }

    #[test]
    fn partial_ron_uses_defaults() {
        let policy: RetryPolicy = ron::from_str("(retry_threshold: 3)").expect("parse");
        assert_eq!(policy, RetryPolicy::new().with_threshold(3));
    }
}
