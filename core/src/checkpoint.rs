//! Durable, monotonic resume points for stages.
//!
//! A [`Checkpoint`] records the last offset a stage has fully processed for a
//! partition (plus the stage's own resume state). Partition managers load it
//! on assignment and save it in batches while running.
//!
//! # Monotonicity
//!
//! Saving is last-write-wins **by offset**: a save whose offset is lower than
//! the stored one is rejected with [`CheckpointError::Stale`]. This protects
//! against a superseded partition manager that keeps running for a moment
//! after a rebalance and would otherwise roll the checkpoint back. Saving the
//! same offset again is accepted (idempotent replay).
//!
//! # Example
//!
//! ```ignore
//! let key = CheckpointKey::for_assignment(&assignment);
//! if let Some(checkpoint) = store.load(&key).await? {
//!     println!("Resuming after offset {}", checkpoint.offset);
//! }
//! store.save(&Checkpoint::new(&assignment, 42, serde_json::Value::Null)).await?;
//! ```

use crate::message::{Offset, PartitionAssignment, PartitionId};
use crate::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Document scope prefix reserved for partition-wide checkpoints.
pub const PARTITION_SCOPE_PREFIX: &str = "@partition:";

/// Error type for checkpoint operations.
#[derive(Debug, Clone, Error)]
pub enum CheckpointError {
    /// A newer checkpoint is already stored; the writer has lost ownership
    #[error("Stale checkpoint for {key}: stored offset {stored}, attempted {attempted}")]
    Stale {
        /// Checkpoint key
        key: CheckpointKey,
        /// Offset currently stored
        stored: Offset,
        /// Offset the caller tried to save
        attempted: Offset,
    },

    /// Storage backend error (retryable)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Stored stage state could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CheckpointError {
    /// Whether retrying the operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

/// Identity of a checkpoint record.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointKey {
    /// Stage name
    pub stage: String,
    /// Document identifier, or a partition scope (see [`CheckpointKey::partition_scope`])
    pub document_id: String,
    /// Partition number
    pub partition: PartitionId,
}

impl CheckpointKey {
    /// Create a key for a document-scoped checkpoint.
    #[must_use]
    pub fn new(stage: impl Into<String>, document_id: impl Into<String>, partition: PartitionId) -> Self {
        Self {
            stage: stage.into(),
            document_id: document_id.into(),
            partition,
        }
    }

    /// Key of the partition-wide checkpoint a partition manager commits.
    #[must_use]
    pub fn for_assignment(assignment: &PartitionAssignment) -> Self {
        Self::new(
            assignment.stage.clone(),
            Self::partition_scope(&assignment.topic),
            assignment.partition,
        )
    }

    /// Document scope used for partition-wide records of `topic`.
    #[must_use]
    pub fn partition_scope(topic: &str) -> String {
        format!("{PARTITION_SCOPE_PREFIX}{topic}")
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.stage, self.document_id, self.partition)
    }
}

/// A durable resume point.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Stage name
    pub stage: String,
    /// Document identifier or partition scope
    pub document_id: String,
    /// Topic the offset refers to
    pub topic: String,
    /// Partition number
    pub partition: PartitionId,
    /// Last offset whose side effects are all durable
    pub offset: Offset,
    /// Stage-specific resume state
    pub stage_state: serde_json::Value,
    /// When the checkpoint was written
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Create a partition-wide checkpoint for `assignment`.
    #[must_use]
    pub fn new(assignment: &PartitionAssignment, offset: Offset, stage_state: serde_json::Value) -> Self {
        Self {
            stage: assignment.stage.clone(),
            document_id: CheckpointKey::partition_scope(&assignment.topic),
            topic: assignment.topic.clone(),
            partition: assignment.partition,
            offset,
            stage_state,
            updated_at: Utc::now(),
        }
    }

    /// The key this checkpoint is stored under.
    #[must_use]
    pub fn key(&self) -> CheckpointKey {
        CheckpointKey::new(self.stage.clone(), self.document_id.clone(), self.partition)
    }
}

/// Durable storage for checkpoints.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// to enable trait object usage (`Arc<dyn CheckpointStore>`): one store handle is
/// shared by every partition manager of a process.
pub trait CheckpointStore: Send + Sync {
    /// Load the checkpoint stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Storage`] if the backend cannot be read.
    fn load(
        &self,
        key: &CheckpointKey,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Checkpoint>, CheckpointError>> + Send + '_>>;

    /// Durably save `checkpoint`. Must not return before the write is durable.
    ///
    /// # Errors
    ///
    /// - [`CheckpointError::Stale`] if a higher offset is already stored
    /// - [`CheckpointError::Storage`] if the backend write fails
    fn save(
        &self,
        checkpoint: &Checkpoint,
    ) -> Pin<Box<dyn Future<Output = Result<(), CheckpointError>> + Send + '_>>;

    /// Remove the checkpoint stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Storage`] if the backend write fails.
    fn clear(
        &self,
        key: &CheckpointKey,
    ) -> Pin<Box<dyn Future<Output = Result<(), CheckpointError>> + Send + '_>>;
}
