//! In-memory snapshot storage.

#![allow(clippy::unwrap_used)] // Test infrastructure, panics are acceptable
#![allow(clippy::missing_panics_doc)] // Test infrastructure

use lambdas_core::{CommitInfo, SnapshotStorage, StorageError, TreeEntry};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

#[derive(Default)]
struct Objects {
    next_id: u64,
    blobs: HashMap<String, Vec<u8>>,
    trees: HashMap<String, Vec<TreeEntry>>,
    commits: HashMap<String, CommitInfo>,
    refs: HashMap<String, String>,
    failing_writes: usize,
}

impl Objects {
    fn next_sha(&mut self) -> String {
        self.next_id += 1;
        format!("{:040x}", self.next_id)
    }

    fn check_write(&mut self) -> Result<(), StorageError> {
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(StorageError::Backend("injected write failure".to_string()));
        }
        Ok(())
    }
}

/// In-memory [`SnapshotStorage`] with sequential object ids.
#[derive(Clone, Default)]
pub struct InMemorySnapshotStorage {
    objects: Arc<RwLock<Objects>>,
}

impl InMemorySnapshotStorage {
    /// Create an empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` object or ref writes.
    pub fn fail_next_writes(&self, count: usize) {
        self.objects.write().unwrap().failing_writes = count;
    }

    /// Content of blob `sha`.
    #[must_use]
    pub fn blob(&self, sha: &str) -> Option<Vec<u8>> {
        self.objects.read().unwrap().blobs.get(sha).cloned()
    }

    /// Entries of tree `sha`.
    #[must_use]
    pub fn tree(&self, sha: &str) -> Option<Vec<TreeEntry>> {
        self.objects.read().unwrap().trees.get(sha).cloned()
    }

    /// Commit `sha`.
    #[must_use]
    pub fn commit(&self, sha: &str) -> Option<CommitInfo> {
        self.objects.read().unwrap().commits.get(sha).cloned()
    }

    /// Number of commits written.
    #[must_use]
    pub fn commit_count(&self) -> usize {
        self.objects.read().unwrap().commits.len()
    }

    /// Commits reachable from ref `name` through first parents, newest first.
    #[must_use]
    pub fn history(&self, name: &str) -> Vec<CommitInfo> {
        let objects = self.objects.read().unwrap();
        let mut history = Vec::new();
        let mut next = objects.refs.get(name).cloned();
        while let Some(sha) = next {
            let Some(commit) = objects.commits.get(&sha) else {
                break;
            };
            next = commit.parents.first().cloned();
            history.push(commit.clone());
        }
        history
    }
}

impl SnapshotStorage for InMemorySnapshotStorage {
    fn create_blob(
        &self,
        content: &[u8],
    ) -> Pin<Box<dyn Future<Output = Result<String, StorageError>> + Send + '_>> {
        let content = content.to_vec();
        Box::pin(async move {
            let mut objects = self.objects.write().unwrap();
            objects.check_write()?;
            let sha = objects.next_sha();
            objects.blobs.insert(sha.clone(), content);
            Ok(sha)
        })
    }

    fn create_tree(
        &self,
        entries: &[TreeEntry],
    ) -> Pin<Box<dyn Future<Output = Result<String, StorageError>> + Send + '_>> {
        let entries = entries.to_vec();
        Box::pin(async move {
            let mut objects = self.objects.write().unwrap();
            objects.check_write()?;
            if let Some(missing) = entries
                .iter()
                .find(|entry| !objects.blobs.contains_key(&entry.sha) && !objects.trees.contains_key(&entry.sha))
            {
                return Err(StorageError::NotFound(missing.sha.clone()));
            }
            let sha = objects.next_sha();
            objects.trees.insert(sha.clone(), entries);
            Ok(sha)
        })
    }

    fn create_commit(
        &self,
        tree: &str,
        parents: &[String],
        message: &str,
    ) -> Pin<Box<dyn Future<Output = Result<String, StorageError>> + Send + '_>> {
        let tree = tree.to_string();
        let parents = parents.to_vec();
        let message = message.to_string();
        Box::pin(async move {
            let mut objects = self.objects.write().unwrap();
            objects.check_write()?;
            if !objects.trees.contains_key(&tree) {
                return Err(StorageError::NotFound(tree));
            }
            let sha = objects.next_sha();
            objects.commits.insert(
                sha.clone(),
                CommitInfo {
                    sha: sha.clone(),
                    tree,
                    parents,
                    message,
                },
            );
            Ok(sha)
        })
    }

    fn get_ref(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>, StorageError>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move { Ok(self.objects.read().unwrap().refs.get(&name).cloned()) })
    }

    fn create_ref(
        &self,
        name: &str,
        sha: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>> {
        let name = name.to_string();
        let sha = sha.to_string();
        Box::pin(async move {
            let mut objects = self.objects.write().unwrap();
            objects.check_write()?;
            if objects.refs.contains_key(&name) {
                return Err(StorageError::RefExists(name));
            }
            objects.refs.insert(name, sha);
            Ok(())
        })
    }

    fn update_ref(
        &self,
        name: &str,
        sha: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>> {
        let name = name.to_string();
        let sha = sha.to_string();
        Box::pin(async move {
            let mut objects = self.objects.write().unwrap();
            objects.check_write()?;
            let Some(target) = objects.refs.get_mut(&name) else {
                return Err(StorageError::NotFound(name));
            };
            *target = sha;
            Ok(())
        })
    }

    fn get_latest_version(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<CommitInfo>, StorageError>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let objects = self.objects.read().unwrap();
            Ok(objects
                .refs
                .get(&name)
                .and_then(|sha| objects.commits.get(sha))
                .cloned())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn commit_chain_is_walkable() {
        let storage = InMemorySnapshotStorage::new();
        let blob = storage.create_blob(b"summary").await.unwrap();
        let tree = storage
            .create_tree(&[TreeEntry {
                path: ".protocol".to_string(),
                sha: blob.clone(),
            }])
            .await
            .unwrap();

        let first = storage.create_commit(&tree, &[], "first").await.unwrap();
        storage.create_ref("doc-1", &first).await.unwrap();
        let second = storage.create_commit(&tree, &[first.clone()], "second").await.unwrap();
        storage.update_ref("doc-1", &second).await.unwrap();

        let latest = storage.get_latest_version("doc-1").await.unwrap().unwrap();
        assert_eq!(latest.sha, second);
        assert_eq!(latest.parents, vec![first]);
        assert_eq!(storage.history("doc-1").len(), 2);
        assert_eq!(storage.blob(&blob).unwrap(), b"summary".to_vec());
    }

    #[tokio::test]
    async fn refs_must_be_created_once() {
        let storage = InMemorySnapshotStorage::new();
        let tree = storage.create_tree(&[]).await.unwrap();
        let commit = storage.create_commit(&tree, &[], "init").await.unwrap();

        assert!(storage.update_ref("doc-1", &commit).await.is_err());
        storage.create_ref("doc-1", &commit).await.unwrap();
        assert_eq!(
            storage.create_ref("doc-1", &commit).await,
            Err(StorageError::RefExists("doc-1".to_string()))
        );
    }

    #[tokio::test]
    async fn commits_require_an_existing_tree() {
        let storage = InMemorySnapshotStorage::new();
        let result = storage.create_commit("missing", &[], "orphan").await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }
}
