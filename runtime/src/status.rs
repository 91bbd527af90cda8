//! Partition status and runner health.

use lambdas_core::{DateTime, Offset, PartitionAssignment, TopicPartition, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Lifecycle state of a partition manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionState {
    /// Not yet started
    Unassigned,
    /// Loading the checkpoint and rebuilding the context
    LoadingCheckpoint,
    /// Dispatching messages to the lambda
    Running,
    /// Stopped advancing after an error; waiting to reload or for an operator
    Faulted,
    /// Finishing in-flight work and flushing the last checkpoint
    Draining,
    /// Terminal
    Revoked,
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unassigned => "unassigned",
            Self::LoadingCheckpoint => "loading_checkpoint",
            Self::Running => "running",
            Self::Faulted => "faulted",
            Self::Draining => "draining",
            Self::Revoked => "revoked",
        };
        f.write_str(name)
    }
}

/// Snapshot of one partition manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionStatus {
    /// The partition
    pub assignment: PartitionAssignment,
    /// Current state
    pub state: PartitionState,
    /// Last offset handed to the lambda and completed
    pub handled_offset: Option<Offset>,
    /// Last durably checkpointed offset
    pub checkpoint_offset: Option<Offset>,
    /// Highest offset in the partition at the last refresh
    pub high_watermark: Option<Offset>,
    /// Total faults since assignment
    pub fault_count: u64,
    /// Offset halted as poison, if any
    pub poisoned_offset: Option<Offset>,
    /// Most recent error
    pub last_error: Option<String>,
    /// When this status last changed
    pub updated_at: DateTime<Utc>,
}

impl PartitionStatus {
    /// Initial status of a freshly assigned partition.
    #[must_use]
    pub fn new(assignment: PartitionAssignment) -> Self {
        Self {
            assignment,
            state: PartitionState::Unassigned,
            handled_offset: None,
            checkpoint_offset: None,
            high_watermark: None,
            fault_count: 0,
            poisoned_offset: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    /// Messages in the partition not yet covered by the checkpoint.
    #[must_use]
    pub fn lag(&self) -> u64 {
        match (self.high_watermark, self.checkpoint_offset) {
            (None, _) => 0,
            (Some(high), None) => high + 1,
            (Some(high), Some(checkpoint)) => high.saturating_sub(checkpoint),
        }
    }
}

/// Aggregated health of a runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerHealth {
    /// Stage name
    pub stage: String,
    /// Whether the control loop is running
    pub running: bool,
    /// Per-partition status, ordered by topic and partition
    pub partitions: Vec<PartitionStatus>,
    /// Sum of partition lag
    pub total_lag: u64,
    /// Sum of partition faults
    pub total_faults: u64,
}

impl RunnerHealth {
    /// Running with every hosted partition able to make progress.
    ///
    /// A partition still on the board in `Revoked` has a manager that stopped
    /// without its revocation being processed, so it counts against health
    /// like a faulted one.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.running
            && self.partitions.iter().all(|status| {
                !matches!(status.state, PartitionState::Faulted | PartitionState::Revoked)
            })
    }

    /// Partitions halted on a poison message.
    pub fn poisoned(&self) -> impl Iterator<Item = &PartitionStatus> {
        self.partitions
            .iter()
            .filter(|status| status.poisoned_offset.is_some())
    }
}

/// Shared table of partition statuses.
///
/// Each partition manager writes only its own entry; the runner reads them
/// all to build [`RunnerHealth`].
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    inner: Arc<RwLock<HashMap<TopicPartition, PartitionStatus>>>,
}

impl StatusBoard {
    /// Create an empty board.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `update` to the entry of `partition`, creating it from `assignment`.
    pub async fn update<F>(&self, assignment: &PartitionAssignment, update: F)
    where
        F: FnOnce(&mut PartitionStatus),
    {
        let mut table = self.inner.write().await;
        let status = table
            .entry(assignment.topic_partition())
            .or_insert_with(|| PartitionStatus::new(assignment.clone()));
        update(status);
        status.updated_at = Utc::now();
    }

    /// Status of one partition.
    pub async fn get(&self, partition: &TopicPartition) -> Option<PartitionStatus> {
        self.inner.read().await.get(partition).cloned()
    }

    /// Drop the entry of `partition`.
    pub async fn remove(&self, partition: &TopicPartition) {
        self.inner.write().await.remove(partition);
    }

    /// All statuses ordered by topic and partition.
    pub async fn snapshot(&self) -> Vec<PartitionStatus> {
        let table = self.inner.read().await;
        let mut statuses: Vec<_> = table.values().cloned().collect();
        statuses.sort_by(|a, b| a.assignment.topic_partition().cmp(&b.assignment.topic_partition()));
        statuses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment(partition: i32) -> PartitionAssignment {
        PartitionAssignment::new("deli", &TopicPartition::new("rawdeltas", partition))
    }

    #[test]
    fn lag_without_checkpoint_counts_every_message() {
        let mut status = PartitionStatus::new(assignment(0));
        assert_eq!(status.lag(), 0);
        status.high_watermark = Some(9);
        assert_eq!(status.lag(), 10);
        status.checkpoint_offset = Some(4);
        assert_eq!(status.lag(), 5);
    }

    fn health(states: &[PartitionState]) -> RunnerHealth {
        let partitions = states
            .iter()
            .zip(0..)
            .map(|(state, partition)| {
                let mut status = PartitionStatus::new(assignment(partition));
                status.state = *state;
                status
            })
            .collect();
        RunnerHealth {
            stage: "deli".into(),
            running: true,
            partitions,
            total_lag: 0,
            total_faults: 0,
        }
    }

    #[test]
    fn stopped_manager_on_the_board_is_unhealthy() {
        assert!(health(&[PartitionState::Running, PartitionState::Draining]).is_healthy());
        assert!(!health(&[PartitionState::Running, PartitionState::Faulted]).is_healthy());
        assert!(!health(&[PartitionState::Revoked, PartitionState::Running]).is_healthy());
    }

    #[tokio::test]
    async fn board_snapshot_is_ordered() {
        let board = StatusBoard::new();
        board.update(&assignment(2), |s| s.state = PartitionState::Running).await;
        board.update(&assignment(0), |s| s.state = PartitionState::Faulted).await;

        let snapshot = board.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].assignment.partition, 0);
        assert_eq!(snapshot[1].state, PartitionState::Running);

        board.remove(&TopicPartition::new("rawdeltas", 0)).await;
        assert!(board.get(&TopicPartition::new("rawdeltas", 0)).await.is_none());
    }
}
