//! Persistence stage.
//!
//! Scriptorium buffers sequenced operations and writes them to snapshot
//! storage in batches, one commit per document:
//!
//! ```text
//! ops ──▶ blob ──▶ tree ──▶ commit(parent = documents/<id>) ──▶ ref documents/<id>
//! ```
//!
//! Buffered operations are part of the stage state but the checkpoint only
//! advances on the message that triggers a flush. Until then a restarted
//! owner replays the buffered messages from the log and rebuilds the buffer.
//!
//! A flush that fails half way leaves some documents committed. The replayed
//! batch skips them: each commit message records the last sequence number it
//! contains, and operations at or below it are not written again.

use crate::operation::{SequencedOperation, decode};
use lambdas_core::{
    CommitInfo, Lambda, LambdaContext, LambdaError, LambdaOutput, LogMessage, SnapshotStorage,
    StorageError, TreeEntry,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

const COMMIT_PREFIX: &str = "Operations ";

/// Buffered and persisted operations of a partition.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptoriumState {
    /// Operations waiting for the next flush, per document
    pub pending: BTreeMap<String, Vec<SequencedOperation>>,
    /// Highest sequence number durably written, per document
    pub persisted: BTreeMap<String, u64>,
}

impl ScriptoriumState {
    fn buffered(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Highest sequence number already accepted for `document_id`.
    fn accepted(&self, document_id: &str) -> u64 {
        let persisted = self.persisted.get(document_id).copied().unwrap_or(0);
        let buffered = self
            .pending
            .get(document_id)
            .and_then(|operations| operations.last())
            .map_or(0, |operation| operation.sequence_number);
        persisted.max(buffered)
    }
}

/// Batching persistence lambda.
#[derive(Clone)]
pub struct ScriptoriumLambda {
    storage: Arc<dyn SnapshotStorage>,
    batch_size: usize,
}

impl ScriptoriumLambda {
    /// Create a scriptorium flushing every `batch_size` operations.
    #[must_use]
    pub fn new(storage: Arc<dyn SnapshotStorage>, batch_size: usize) -> Self {
        Self {
            storage,
            batch_size: batch_size.max(1),
        }
    }

    /// Name of the ref tracking `document_id`.
    #[must_use]
    pub fn ref_name(document_id: &str) -> String {
        format!("documents/{document_id}")
    }

    async fn flush(&self, state: &mut ScriptoriumState) -> Result<(), StorageError> {
        let documents: Vec<String> = state.pending.keys().cloned().collect();
        for document_id in documents {
            let Some(operations) = state.pending.get(&document_id) else {
                continue;
            };
            if let Some(last) = self.write(&document_id, operations).await? {
                state.persisted.insert(document_id.clone(), last);
            }
            state.pending.remove(&document_id);
        }
        Ok(())
    }

    /// Commit `operations` on top of the document's ref.
    ///
    /// Returns the highest sequence number now persisted, `None` when nothing
    /// was left to write.
    async fn write(
        &self,
        document_id: &str,
        operations: &[SequencedOperation],
    ) -> Result<Option<u64>, StorageError> {
        let name = Self::ref_name(document_id);
        let latest = self.storage.get_latest_version(&name).await?;
        let stored = latest.as_ref().and_then(persisted_through).unwrap_or(0);

        let fresh: Vec<&SequencedOperation> = operations
            .iter()
            .filter(|operation| operation.sequence_number > stored)
            .collect();
        let (Some(first), Some(last)) = (fresh.first(), fresh.last()) else {
            tracing::debug!(document_id, stored, "Batch already persisted");
            return Ok((stored > 0).then_some(stored));
        };
        let (first, last) = (first.sequence_number, last.sequence_number);

        let content = serde_json::to_vec(&fresh)
            .map_err(|e| StorageError::Backend(format!("Unencodable batch: {e}")))?;
        let blob = self.storage.create_blob(&content).await?;
        let tree = self
            .storage
            .create_tree(&[TreeEntry {
                path: format!("ops/{first:020}-{last:020}.json"),
                sha: blob,
            }])
            .await?;

        let parents: Vec<String> = latest.iter().map(|commit| commit.sha.clone()).collect();
        let commit = self
            .storage
            .create_commit(&tree, &parents, &format!("{COMMIT_PREFIX}{first}..={last}"))
            .await?;

        if latest.is_some() {
            self.storage.update_ref(&name, &commit).await?;
        } else {
            self.storage.create_ref(&name, &commit).await?;
        }

        tracing::info!(document_id, first, last, commit = %commit, "Operations persisted");
        metrics::counter!("lambdas.scriptorium.operations_persisted").increment(fresh.len() as u64);
        Ok(Some(last))
    }
}

impl Lambda for ScriptoriumLambda {
    type State = ScriptoriumState;

    async fn handle(
        &self,
        message: &LogMessage,
        context: &mut LambdaContext<ScriptoriumState>,
    ) -> Result<LambdaOutput, LambdaError> {
        let operation: SequencedOperation = decode(message)?;
        let state = &mut context.state;

        if operation.sequence_number <= state.accepted(&operation.document_id) {
            tracing::debug!(
                document_id = %operation.document_id,
                sequence_number = operation.sequence_number,
                "Skipping persisted operation"
            );
        } else {
            state
                .pending
                .entry(operation.document_id.clone())
                .or_default()
                .push(operation);
        }

        if state.buffered() < self.batch_size {
            return Ok(LambdaOutput::hold());
        }

        self.flush(state)
            .await
            .map_err(|e| LambdaError::SideEffect(format!("Snapshot write failed: {e}")))?;
        metrics::counter!("lambdas.scriptorium.flushes").increment(1);
        Ok(LambdaOutput::advance())
    }
}

/// Last sequence number recorded by a scriptorium commit.
fn persisted_through(commit: &CommitInfo) -> Option<u64> {
    commit
        .message
        .strip_prefix(COMMIT_PREFIX)?
        .split_once("..=")?
        .1
        .parse()
        .ok()
}
