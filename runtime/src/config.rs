//! Runner configuration.
//!
//! Checkpoint batching, drain bounds and poison handling for partition managers.
//!
//! # Example
//!
//! ```rust
//! use lambdas_runtime::config::{PoisonPolicy, RunnerConfig};
//! use std::time::Duration;
//!
//! let config = RunnerConfig::builder()
//!     .checkpoint_batch_size(50)
//!     .checkpoint_interval(Duration::from_millis(500))
//!     .poison_policy(PoisonPolicy::DeadLetter { topic: "deli-dlq".into() })
//!     .build();
//! assert!(config.validate().is_ok());
//! ```

use crate::retry::RetryPolicy;
use std::time::Duration;
use thiserror::Error;

/// Invalid configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A value is outside its allowed range
    #[error("Invalid value for {field}: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },

    /// A required value is missing
    #[error("Missing required configuration: {0}")]
    Missing(&'static str),
}

/// What to do with a message that keeps faulting the lambda.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PoisonPolicy {
    /// Stop the partition and surface it as poisoned until an operator
    /// intervenes or the partition is revoked
    #[default]
    Halt,
    /// Publish the message and its error to `topic`, then move past it
    DeadLetter {
        /// Dead-letter topic
        topic: String,
    },
}

/// Configuration shared by every partition manager of a runner.
///
/// # Default Values
///
/// - `checkpoint_batch_size`: 100 messages
/// - `checkpoint_interval`: 1 second
/// - `poll_window`: 64 messages
/// - `drain_timeout`: 5 seconds
/// - `shutdown_timeout`: 30 seconds
/// - `lag_refresh_interval`: 5 seconds
/// - `poison_threshold`: 3 consecutive faults on one offset
/// - `poison_policy`: [`PoisonPolicy::Halt`]
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerConfig {
    /// Commit after this many handled messages
    pub checkpoint_batch_size: usize,
    /// Commit at least this often while progress is pending
    pub checkpoint_interval: Duration,
    /// Maximum messages buffered between the log and a partition's reader
    pub poll_window: usize,
    /// Time an in-flight message gets to finish once a partition drains
    pub drain_timeout: Duration,
    /// Upper bound for a graceful stop of the whole runner
    pub shutdown_timeout: Duration,
    /// How often partition lag is refreshed from the log
    pub lag_refresh_interval: Duration,
    /// Retries for checkpoint loads
    pub load_retry: RetryPolicy,
    /// Retries for downstream produces
    pub produce_retry: RetryPolicy,
    /// Backoff between fault and reload, by consecutive fault count
    pub fault_backoff: RetryPolicy,
    /// Consecutive non-transient faults on one offset before it is poison
    pub poison_threshold: u32,
    /// What to do with poison messages
    pub poison_policy: PoisonPolicy,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RunnerConfig {
    /// Create a new config builder.
    #[must_use]
    pub const fn builder() -> RunnerConfigBuilder {
        RunnerConfigBuilder {
            checkpoint_batch_size: None,
            checkpoint_interval: None,
            poll_window: None,
            drain_timeout: None,
            shutdown_timeout: None,
            lag_refresh_interval: None,
            load_retry: None,
            produce_retry: None,
            fault_backoff: None,
            poison_threshold: None,
            poison_policy: None,
        }
    }

    /// How long a revocation waits for its managers before acknowledging.
    ///
    /// The drain timeout plus [`FINAL_FLUSH_MARGIN`] for the last checkpoint
    /// save, capped at the shutdown timeout. The log's own revoke timeout must
    /// be longer, or the partition can move before the flush lands.
    #[must_use]
    pub fn revoke_deadline(&self) -> Duration {
        (self.drain_timeout + FINAL_FLUSH_MARGIN).min(self.shutdown_timeout)
    }

    /// Check that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.checkpoint_batch_size == 0 {
            return Err(invalid("checkpoint_batch_size", "must be at least 1"));
        }
        if self.checkpoint_interval.is_zero() {
            return Err(invalid("checkpoint_interval", "must be non-zero"));
        }
        if self.poll_window == 0 {
            return Err(invalid("poll_window", "must be at least 1"));
        }
        if self.lag_refresh_interval.is_zero() {
            return Err(invalid("lag_refresh_interval", "must be non-zero"));
        }
        if self.poison_threshold == 0 {
            return Err(invalid("poison_threshold", "must be at least 1"));
        }
        if self.shutdown_timeout < self.drain_timeout {
            return Err(invalid(
                "shutdown_timeout",
                "must be at least as long as drain_timeout",
            ));
        }
        if let PoisonPolicy::DeadLetter { topic } = &self.poison_policy {
            if topic.trim().is_empty() {
                return Err(invalid("poison_policy", "dead-letter topic must not be empty"));
            }
        }
        Ok(())
    }
}

/// Time allowed for the final checkpoint save after a drain.
pub const FINAL_FLUSH_MARGIN: Duration = Duration::from_secs(5);

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

/// Builder for [`RunnerConfig`].
#[derive(Debug, Clone)]
pub struct RunnerConfigBuilder {
    checkpoint_batch_size: Option<usize>,
    checkpoint_interval: Option<Duration>,
    poll_window: Option<usize>,
    drain_timeout: Option<Duration>,
    shutdown_timeout: Option<Duration>,
    lag_refresh_interval: Option<Duration>,
    load_retry: Option<RetryPolicy>,
    produce_retry: Option<RetryPolicy>,
    fault_backoff: Option<RetryPolicy>,
    poison_threshold: Option<u32>,
    poison_policy: Option<PoisonPolicy>,
}

impl RunnerConfigBuilder {
    /// Commit after this many handled messages.
    #[must_use]
    pub const fn checkpoint_batch_size(mut self, size: usize) -> Self {
        self.checkpoint_batch_size = Some(size);
        self
    }

    /// Commit at least this often while progress is pending.
    #[must_use]
    pub const fn checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = Some(interval);
        self
    }

    /// Maximum messages buffered per partition.
    #[must_use]
    pub const fn poll_window(mut self, window: usize) -> Self {
        self.poll_window = Some(window);
        self
    }

    /// Time an in-flight message gets to finish on drain.
    #[must_use]
    pub const fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = Some(timeout);
        self
    }

    /// Upper bound for a graceful stop.
    #[must_use]
    pub const fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }

    /// How often lag is refreshed.
    #[must_use]
    pub const fn lag_refresh_interval(mut self, interval: Duration) -> Self {
        self.lag_refresh_interval = Some(interval);
        self
    }

    /// Retries for checkpoint loads.
    #[must_use]
    pub fn load_retry(mut self, policy: RetryPolicy) -> Self {
        self.load_retry = Some(policy);
        self
    }

    /// Retries for downstream produces.
    #[must_use]
    pub fn produce_retry(mut self, policy: RetryPolicy) -> Self {
        self.produce_retry = Some(policy);
        self
    }

    /// Backoff between fault and reload.
    #[must_use]
    pub fn fault_backoff(mut self, policy: RetryPolicy) -> Self {
        self.fault_backoff = Some(policy);
        self
    }

    /// Consecutive faults on one offset before it is poison.
    #[must_use]
    pub const fn poison_threshold(mut self, threshold: u32) -> Self {
        self.poison_threshold = Some(threshold);
        self
    }

    /// What to do with poison messages.
    #[must_use]
    pub fn poison_policy(mut self, policy: PoisonPolicy) -> Self {
        self.poison_policy = Some(policy);
        self
    }

    /// Build the [`RunnerConfig`].
    #[must_use]
    pub fn build(self) -> RunnerConfig {
        RunnerConfig {
            checkpoint_batch_size: self.checkpoint_batch_size.unwrap_or(100),
            checkpoint_interval: self.checkpoint_interval.unwrap_or(Duration::from_secs(1)),
            poll_window: self.poll_window.unwrap_or(64),
            drain_timeout: self.drain_timeout.unwrap_or(Duration::from_secs(5)),
            shutdown_timeout: self.shutdown_timeout.unwrap_or(Duration::from_secs(30)),
            lag_refresh_interval: self.lag_refresh_interval.unwrap_or(Duration::from_secs(5)),
            load_retry: self.load_retry.unwrap_or_default(),
            produce_retry: self.produce_retry.unwrap_or_default(),
            fault_backoff: self.fault_backoff.unwrap_or_else(|| {
                RetryPolicy::builder()
                    .initial_delay(Duration::from_millis(250))
                    .max_delay(Duration::from_secs(30))
                    .jitter(0.2)
                    .build()
            }),
            poison_threshold: self.poison_threshold.unwrap_or(3),
            poison_policy: self.poison_policy.unwrap_or_default(),
        }
    }
}
