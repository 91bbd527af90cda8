//! In-memory checkpoint store.

#![allow(clippy::unwrap_used)] // Test infrastructure, panics are acceptable
#![allow(clippy::missing_panics_doc)] // Test infrastructure

use lambdas_core::{Checkpoint, CheckpointError, CheckpointKey, CheckpointStore, Offset};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

#[derive(Default)]
struct Faults {
    failing_loads: usize,
    failing_saves: usize,
    failing_saves_at: HashMap<Offset, usize>,
    save_latency: HashMap<CheckpointKey, Duration>,
}

/// In-memory [`CheckpointStore`] with the same monotonic guard as the
/// Postgres store: a save below the stored offset is rejected as stale.
///
/// Every successful save is kept in [`history`](Self::history).
///
/// # Example
///
/// ```
/// use lambdas_testing::InMemoryCheckpointStore;
/// use lambdas_core::{Checkpoint, CheckpointStore, PartitionAssignment, TopicPartition};
///
/// # tokio_test::block_on(async {
/// let store = InMemoryCheckpointStore::new();
/// let assignment = PartitionAssignment::new("deli", &TopicPartition::new("rawdeltas", 0));
///
/// store.save(&Checkpoint::new(&assignment, 10, serde_json::json!({}))).await.unwrap();
/// assert!(store.save(&Checkpoint::new(&assignment, 9, serde_json::json!({}))).await.is_err());
/// # });
/// ```
#[derive(Clone, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: Arc<RwLock<HashMap<CheckpointKey, Checkpoint>>>,
    history: Arc<RwLock<Vec<Checkpoint>>>,
    faults: Arc<RwLock<Faults>>,
}

impl InMemoryCheckpointStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `checkpoint` without the monotonic check, as a previous owner would have.
    pub fn insert(&self, checkpoint: Checkpoint) {
        self.checkpoints
            .write()
            .unwrap()
            .insert(checkpoint.key(), checkpoint);
    }

    /// Current checkpoint under `key`.
    #[must_use]
    pub fn get(&self, key: &CheckpointKey) -> Option<Checkpoint> {
        self.checkpoints.read().unwrap().get(key).cloned()
    }

    /// Offset of the current checkpoint under `key`.
    #[must_use]
    pub fn offset(&self, key: &CheckpointKey) -> Option<Offset> {
        self.get(key).map(|checkpoint| checkpoint.offset)
    }

    /// Every successful save, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<Checkpoint> {
        self.history.read().unwrap().clone()
    }

    /// Number of stored checkpoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.checkpoints.read().unwrap().len()
    }

    /// Whether nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fail the next `count` loads with a transient storage error.
    pub fn fail_next_loads(&self, count: usize) {
        self.faults.write().unwrap().failing_loads = count;
    }

    /// Fail the next `count` saves with a transient storage error.
    pub fn fail_next_saves(&self, count: usize) {
        self.faults.write().unwrap().failing_saves = count;
    }

    /// Fail the next `count` saves of `offset`.
    pub fn fail_saves_at(&self, offset: Offset, count: usize) {
        self.faults.write().unwrap().failing_saves_at.insert(offset, count);
    }

    /// Delay every save under `key` by `latency`; `None` removes the delay.
    pub fn set_save_latency(&self, key: &CheckpointKey, latency: Option<Duration>) {
        let mut faults = self.faults.write().unwrap();
        match latency {
            Some(latency) => faults.save_latency.insert(key.clone(), latency),
            None => faults.save_latency.remove(key),
        };
    }

    fn take_load_failure(&self) -> bool {
        let mut faults = self.faults.write().unwrap();
        take(&mut faults.failing_loads)
    }

    fn take_save_failure(&self, offset: Offset) -> bool {
        let mut faults = self.faults.write().unwrap();
        if take(&mut faults.failing_saves) {
            return true;
        }
        faults.failing_saves_at.get_mut(&offset).is_some_and(take)
    }
}

fn take(remaining: &mut usize) -> bool {
    if *remaining == 0 {
        return false;
    }
    *remaining -= 1;
    true
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn load(
        &self,
        key: &CheckpointKey,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Checkpoint>, CheckpointError>> + Send + '_>> {
        let key = key.clone();
        Box::pin(async move {
            if self.take_load_failure() {
                return Err(CheckpointError::Storage("injected load failure".to_string()));
            }
            Ok(self.get(&key))
        })
    }

    fn save(
        &self,
        checkpoint: &Checkpoint,
    ) -> Pin<Box<dyn Future<Output = Result<(), CheckpointError>> + Send + '_>> {
        let checkpoint = checkpoint.clone();
        Box::pin(async move {
            let key = checkpoint.key();
            let latency = self.faults.read().unwrap().save_latency.get(&key).copied();
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            if self.take_save_failure(checkpoint.offset) {
                return Err(CheckpointError::Storage("injected save failure".to_string()));
            }

            let mut checkpoints = self.checkpoints.write().unwrap();
            if let Some(stored) = checkpoints.get(&key) {
                if stored.offset > checkpoint.offset {
                    return Err(CheckpointError::Stale {
                        key,
                        stored: stored.offset,
                        attempted: checkpoint.offset,
                    });
                }
            }
            checkpoints.insert(key, checkpoint.clone());
            drop(checkpoints);

            self.history.write().unwrap().push(checkpoint);
            Ok(())
        })
    }

    fn clear(
        &self,
        key: &CheckpointKey,
    ) -> Pin<Box<dyn Future<Output = Result<(), CheckpointError>> + Send + '_>> {
        let key = key.clone();
        Box::pin(async move {
            self.checkpoints.write().unwrap().remove(&key);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lambdas_core::{PartitionAssignment, TopicPartition};
    use serde_json::json;

    fn assignment() -> PartitionAssignment {
        PartitionAssignment::new("deli", &TopicPartition::new("rawdeltas", 0))
    }

    #[tokio::test]
    async fn save_is_monotonic() {
        let store = InMemoryCheckpointStore::new();
        store.save(&Checkpoint::new(&assignment(), 10, json!(1))).await.unwrap();
        store.save(&Checkpoint::new(&assignment(), 10, json!(2))).await.unwrap();

        let stale = store.save(&Checkpoint::new(&assignment(), 9, json!(3))).await;
        assert!(matches!(
            stale,
            Err(CheckpointError::Stale { stored: 10, attempted: 9, .. })
        ));

        let key = CheckpointKey::for_assignment(&assignment());
        let stored = store.load(&key).await.unwrap().unwrap();
        assert_eq!(stored.offset, 10);
        assert_eq!(stored.stage_state, json!(2));
        assert_eq!(store.history().len(), 2);
    }

    #[tokio::test]
    async fn injected_failures_are_transient_and_counted() {
        let store = InMemoryCheckpointStore::new();
        store.fail_saves_at(11, 1);

        store.save(&Checkpoint::new(&assignment(), 10, json!(null))).await.unwrap();
        let failed = store.save(&Checkpoint::new(&assignment(), 11, json!(null))).await;
        assert!(failed.unwrap_err().is_transient());
        store.save(&Checkpoint::new(&assignment(), 11, json!(null))).await.unwrap();

        store.fail_next_loads(1);
        let key = CheckpointKey::for_assignment(&assignment());
        assert!(store.load(&key).await.is_err());
        assert_eq!(store.load(&key).await.unwrap().unwrap().offset, 11);
    }

    #[tokio::test]
    async fn clear_removes_checkpoint() {
        let store = InMemoryCheckpointStore::new();
        store.insert(Checkpoint::new(&assignment(), 3, json!(null)));
        let key = CheckpointKey::for_assignment(&assignment());
        store.clear(&key).await.unwrap();
        assert!(store.is_empty());
    }
}
