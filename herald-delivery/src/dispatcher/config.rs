use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{error::ConfigurationError, policy::RetryPolicy};

/// Dispatcher tuning, read from the `dispatcher` section of the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// How often each worker polls the queue (in seconds)
    #[serde(default = "defaults::poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Messages claimed per cycle
    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,

    /// Provider calls running at once within a cycle
    ///
    /// Default: number of CPUs
    #[serde(default = "defaults::max_concurrent_deliveries")]
    pub max_concurrent_deliveries: usize,

    /// Independent polling loops
    #[serde(default = "defaults::workers")]
    pub workers: usize,

    /// Lifetime of a claim (in seconds). Must exceed twice `send_timeout_secs`,
    /// which bounds the address lookup and the provider call separately.
    #[serde(default = "defaults::claim_ttl_secs")]
    pub claim_ttl_secs: u64,

    /// Upper bound on one address lookup and on one provider call (in seconds)
    #[serde(default = "defaults::send_timeout_secs")]
    pub send_timeout_secs: u64,

    /// How long shutdown waits for in-flight attempts (in seconds)
    #[serde(default = "defaults::shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: defaults::poll_interval_secs(),
            batch_size: defaults::batch_size(),
            max_concurrent_deliveries: defaults::max_concurrent_deliveries(),
            workers: defaults::workers(),
            claim_ttl_secs: defaults::claim_ttl_secs(),
            send_timeout_secs: defaults::send_timeout_secs(),
            shutdown_timeout_secs: defaults::shutdown_timeout_secs(),
            retry: RetryPolicy::default(),
        }
    }
}

impl DispatcherConfig {
    /// # Errors
    /// [`ConfigurationError::Dispatcher`] describing the first invalid value.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |reason: &str| Err(ConfigurationError::Dispatcher(reason.to_string()));

        if self.poll_interval_secs == 0 {
            return invalid("poll_interval_secs must be at least 1");
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be at least 1");
        }
        if self.max_concurrent_deliveries == 0 {
            return invalid("max_concurrent_deliveries must be at least 1");
        }
        if self.workers == 0 {
            return invalid("workers must be at least 1");
        }
        if self.retry.retry_threshold == 0 {
            return invalid("retry.retry_threshold must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.retry.retry_jitter_factor) {
            return invalid("retry.retry_jitter_factor must be between 0.0 and 1.0");
        }
        if self.claim_ttl_secs <= self.send_timeout_secs.saturating_mul(2) {
            return Err(ConfigurationError::Dispatcher(format!(
                "claim_ttl_secs ({}) must be greater than twice send_timeout_secs ({})",
                self.claim_ttl_secs, self.send_timeout_secs
            )));
        }

        Ok(())
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    #[must_use]
    pub const fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.claim_ttl_secs)
    }

    #[must_use]
    pub const fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

mod defaults {
    pub const fn poll_interval_secs() -> u64 {
        10
    }

    pub const fn batch_size() -> usize {
        32
    }

    pub fn max_concurrent_deliveries() -> usize {
        num_cpus::get()
    }

    pub const fn workers() -> usize {
        1
    }

    pub const fn claim_ttl_secs() -> u64 {
        300
    }

    pub const fn send_timeout_secs() -> u64 {
        30
    }

    pub const fn shutdown_timeout_secs() -> u64 {
        30
    }
}
