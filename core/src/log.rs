//! Partitioned log abstraction with consumer-group semantics.
//!
//! This module provides the [`LogClient`] trait used by the runtime to join a
//! consumer group, read assigned partitions in offset order, record consumed
//! offsets and append messages for downstream stages.
//!
//! # Rebalances Are Messages
//!
//! Consumer-group rebalances are not delivered as callbacks. Subscribing
//! returns a [`RebalanceStream`] of [`RebalanceEvent`]s that the runner feeds
//! into each partition manager's state machine:
//!
//! ```text
//! subscribe ──▶ Assigned([p0, p1]) ──▶ spawn managers
//!           ──▶ Revoked([p1], ack) ──▶ drain manager p1, then ack
//!           ──▶ Lost(error)        ──▶ runner terminates
//! ```
//!
//! # Delivery Semantics
//!
//! - **Ordered**: a partition stream yields non-decreasing offsets
//! - **At-least-once**: messages may be redelivered after a crash
//! - **Resumable**: [`PartitionConsumer::poll`] starts at an explicit offset,
//!   which is how checkpointed work is never handed to a lambda twice
//! - **Keyed**: messages produced with the same key land in the same
//!   partition, giving a total order per document
//!
//! # Implementations
//!
//! - `InMemoryLog` in `lambdas-testing` - for tests (deterministic, fault injection)
//! - `RedpandaLogClient` in `lambdas-redpanda` - for production (Kafka-compatible)

use crate::message::{LogMessage, Offset, ProduceAck, TopicPartition};
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::mpsc::SyncSender;
use thiserror::Error;

/// Errors that can occur during log operations.
#[derive(Error, Debug, Clone)]
pub enum LogError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Append failed after exhausting retries; the message must be assumed lost
    #[error("Produce failed for topic '{topic}': {reason}")]
    ProduceFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to join the consumer group
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// The partition is not (or no longer) assigned to this consumer
    #[error("Partition {0} is not assigned to this consumer")]
    NotAssigned(TopicPartition),

    /// Failed to commit a consumed offset
    #[error("Commit failed for {partition} at offset {offset}: {reason}")]
    CommitFailed {
        /// The partition being committed
        partition: TopicPartition,
        /// The offset being committed
        offset: Offset,
        /// The reason for failure
        reason: String,
    },

    /// Network or transport error (retryable)
    #[error("Transport error: {0}")]
    TransportError(String),

    /// The consumer was closed
    #[error("Consumer closed")]
    Closed,
}

impl LogError {
    /// Whether retrying the operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_) | Self::TransportError(_) | Self::CommitFailed { .. }
        )
    }
}

/// Ordered stream of messages for one partition.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<LogMessage, LogError>> + Send>>;

/// Stream of consumer-group membership changes.
pub type RebalanceStream = Pin<Box<dyn Stream<Item = RebalanceEvent> + Send>>;

/// Acknowledgement handle for a revocation.
///
/// The log waits (bounded) for this acknowledgement before letting the group
/// move the partitions to another member, so drained checkpoints are durable
/// before the next owner loads them. Dropping the handle without calling
/// [`RevokeAck::acknowledge`] counts as an acknowledgement.
#[derive(Debug)]
pub struct RevokeAck {
    tx: SyncSender<()>,
}

impl RevokeAck {
    /// Create an acknowledgement handle backed by `tx`.
    #[must_use]
    pub const fn new(tx: SyncSender<()>) -> Self {
        Self { tx }
    }

    /// Signal that every revoked partition has been drained.
    pub fn acknowledge(self) {
        // The waiter may have timed out already
        let _ = self.tx.try_send(());
    }
}

/// A consumer-group membership change.
#[derive(Debug)]
pub enum RebalanceEvent {
    /// Partitions newly assigned to this member
    Assigned(Vec<TopicPartition>),
    /// Partitions taken away from this member
    Revoked(Vec<TopicPartition>, RevokeAck),
    /// The consumer lost connectivity beyond its retry budget
    Lost(LogError),
}

/// Per-partition operations of a joined consumer group.
///
/// # Thread Safety
///
/// Shared by every partition manager of a process, so implementations must be
/// `Send + Sync`.
pub trait PartitionConsumer: Send + Sync {
    /// Read `partition` in offset order starting at `from_offset`.
    ///
    /// At most `window` messages are buffered ahead of the reader; a reader
    /// that stops pulling stalls the partition instead of growing memory.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::NotAssigned`] if the partition is not assigned to
    /// this member.
    fn poll(
        &self,
        partition: &TopicPartition,
        from_offset: Offset,
        window: usize,
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, LogError>> + Send + '_>>;

    /// Record `offset` as the last processed offset of `partition` for the group.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::CommitFailed`] if the broker rejects the commit.
    fn commit_offset(
        &self,
        partition: &TopicPartition,
        offset: Offset,
    ) -> Pin<Box<dyn Future<Output = Result<(), LogError>> + Send + '_>>;

    /// Highest offset currently stored in `partition`, `None` when empty.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::TransportError`] if the broker cannot be reached.
    fn high_watermark(
        &self,
        partition: &TopicPartition,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Offset>, LogError>> + Send + '_>>;

    /// Whether `partition` is currently assigned to this member.
    ///
    /// A stale checkpoint rejection on a partition that is still assigned
    /// comes from a previous owner's late flush, not from a new owner.
    fn is_assigned(&self, partition: &TopicPartition) -> bool;

    /// Leave the consumer group.
    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// A joined consumer group.
pub struct Subscription {
    /// Membership changes, in the order the group produced them
    pub rebalances: RebalanceStream,
    /// Per-partition reading and committing
    pub consumer: Arc<dyn PartitionConsumer>,
}

/// Trait for partitioned log implementations.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// so the runtime can hold it as `Arc<dyn LogClient>` and share one connection
/// across all partitions of a process.
pub trait LogClient: Send + Sync {
    /// Join `consumer_group` and subscribe to `topics`.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::SubscriptionFailed`] if the group cannot be joined.
    fn subscribe(
        &self,
        topics: &[String],
        consumer_group: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Subscription, LogError>> + Send + '_>>;

    /// Append `payload` to `topic`, routed by `partition_key`.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::ProduceFailed`] once the client's own retries are
    /// exhausted. The caller must not assume the append succeeded.
    fn produce(
        &self,
        topic: &str,
        partition_key: &str,
        payload: &[u8],
    ) -> Pin<Box<dyn Future<Output = Result<ProduceAck, LogError>> + Send + '_>>;
}
