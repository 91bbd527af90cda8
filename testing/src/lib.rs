//! # Lambdas Testing
//!
//! Testing utilities for lambda stages and the runtime that hosts them.
//!
//! This crate provides:
//! - [`InMemoryLog`]: partitioned log with test-driven rebalances and fault injection
//! - [`InMemoryCheckpointStore`]: monotonic checkpoint store with failure hooks
//! - [`InMemorySnapshotStorage`]: content store for summary snapshots
//! - [`RecordingLambda`]: scripted lambda recording every call
//! - [`helpers`]: polling assertions for asynchronous outcomes
//!
//! ## Example
//!
//! ```ignore
//! use lambdas_testing::{InMemoryCheckpointStore, InMemoryLog, RecordingLambda, helpers};
//! use lambdas_runtime::{LambdaRunner, RunnerConfig};
//!
//! #[tokio::test]
//! async fn forwards_every_message() {
//!     let log = InMemoryLog::new();
//!     let lambda = RecordingLambda::new().emitting_to("out");
//!     let runner = LambdaRunner::new(
//!         "forward",
//!         vec!["in".into()],
//!         lambda.clone(),
//!         Arc::new(log.clone()),
//!         Arc::new(InMemoryCheckpointStore::new()),
//!         RunnerConfig::default(),
//!     )?;
//!     runner.start().await?;
//!
//!     log.append(&TopicPartition::new("in", 0), "doc", b"hello".to_vec());
//!     helpers::eventually(|| lambda.observed_offsets() == vec![0]).await;
//! }
//! ```

/// In-memory checkpoint store
pub mod checkpoint;

/// Scripted lambdas
pub mod lambdas;

/// In-memory partitioned log
pub mod log;

/// In-memory snapshot storage
pub mod storage;

/// Test helpers and utilities.
pub mod helpers {
    #![allow(clippy::panic)] // Failed expectations end the test

    use std::future::Future;
    use std::time::Duration;

    /// Default time [`eventually`] waits.
    pub const EVENTUALLY_TIMEOUT: Duration = Duration::from_secs(5);

    /// Poll `condition` every few milliseconds until it holds.
    ///
    /// # Panics
    ///
    /// Panics if `condition` does not hold within [`EVENTUALLY_TIMEOUT`].
    pub async fn eventually<F>(condition: F)
    where
        F: FnMut() -> bool,
    {
        eventually_within(EVENTUALLY_TIMEOUT, condition).await;
    }

    /// Poll `condition` until it holds or `limit` elapses.
    ///
    /// # Panics
    ///
    /// Panics if `condition` does not hold within `limit`.
    pub async fn eventually_within<F>(limit: Duration, mut condition: F)
    where
        F: FnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + limit;
        while !condition() {
            if tokio::time::Instant::now() >= deadline {
                panic!("condition not met within {limit:?}");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Poll an asynchronous `condition` until it holds.
    ///
    /// # Panics
    ///
    /// Panics if `condition` does not hold within [`EVENTUALLY_TIMEOUT`].
    pub async fn eventually_async<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + EVENTUALLY_TIMEOUT;
        while !condition().await {
            if tokio::time::Instant::now() >= deadline {
                panic!("condition not met within {EVENTUALLY_TIMEOUT:?}");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

pub use checkpoint::InMemoryCheckpointStore;
pub use lambdas::{Gate, Observation, RecordingLambda, RecordingState};
pub use log::{InMemoryLog, InMemoryLogBuilder, MemberId, partition_for_key};
pub use storage::InMemorySnapshotStorage;
