//! # Lambdas Core
//!
//! Core traits and types for hosting partition-bound processing stages
//! ("lambdas") on top of a partitioned, append-only log.
//!
//! A stage consumes one partition of a topic in strict offset order, emits
//! zero or more downstream messages per input and periodically checkpoints
//! its progress. This crate defines the seams between the pieces:
//!
//! - [`log`]: the partitioned log (consumer group, per-partition polling,
//!   offset commits, producer)
//! - [`checkpoint`]: durable, monotonic resume points
//! - [`lambda`]: stage business logic and its per-partition context
//! - [`storage`]: snapshot storage capability used by persistence stages
//! - [`message`]: messages, partitions and assignments
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   poll    ┌───────────────────┐  handle  ┌──────────┐
//! │  Log Client  │──────────▶│ Partition Manager │─────────▶│  Lambda  │
//! └──────▲───────┘           └─────────┬─────────┘          └────┬─────┘
//!        │ produce (emit)              │ save                    │ side effects
//!        └─────────────────────────────┤                         ▼
//!                            ┌─────────▼─────────┐     ┌──────────────────┐
//!                            │ Checkpoint Store  │     │ Snapshot Storage │
//!                            └───────────────────┘     └──────────────────┘
//! ```
//!
//! The runtime that drives these traits lives in `lambdas-runtime`.

pub mod checkpoint;
pub mod lambda;
pub mod log;
pub mod message;
pub mod storage;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use smallvec::{SmallVec, smallvec};

pub use checkpoint::{Checkpoint, CheckpointError, CheckpointKey, CheckpointStore};
pub use lambda::{Lambda, LambdaContext, LambdaError, LambdaOutput};
pub use log::{
    LogClient, LogError, MessageStream, PartitionConsumer, RebalanceEvent, RebalanceStream,
    RevokeAck, Subscription,
};
pub use message::{
    LogMessage, Offset, OutboundMessage, PartitionAssignment, PartitionId, ProduceAck,
    TopicPartition,
};
pub use storage::{CommitInfo, SnapshotStorage, StorageError, TreeEntry};
