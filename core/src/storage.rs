//! Snapshot storage capability.
//!
//! Persistence stages write document snapshots as git-like objects: blobs are
//! grouped into a tree, a commit points at the tree and a named ref points at
//! the latest commit. The REST backend itself lives outside this workspace;
//! stages only see this trait.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors returned by snapshot storage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The named object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// A ref with this name already exists
    #[error("Ref already exists: {0}")]
    RefExists(String),

    /// Backend unavailable or request failed
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Entry of a tree object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    /// Path within the tree
    pub path: String,
    /// Blob or tree sha
    pub sha: String,
}

/// A commit as reported by [`SnapshotStorage::get_latest_version`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    /// Commit sha
    pub sha: String,
    /// Tree the commit points at
    pub tree: String,
    /// Parent commits
    pub parents: Vec<String>,
    /// Commit message
    pub message: String,
}

/// Git-like snapshot storage.
///
/// Every call may fail; callers treat failures as transient side-effect
/// errors and retry by reprocessing.
pub trait SnapshotStorage: Send + Sync {
    /// Store `content` and return its sha.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] on request failure.
    fn create_blob(
        &self,
        content: &[u8],
    ) -> Pin<Box<dyn Future<Output = Result<String, StorageError>> + Send + '_>>;

    /// Store a tree of `entries` and return its sha.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] on request failure.
    fn create_tree(
        &self,
        entries: &[TreeEntry],
    ) -> Pin<Box<dyn Future<Output = Result<String, StorageError>> + Send + '_>>;

    /// Create a commit of `tree` with `parents` and return its sha.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the tree is unknown.
    fn create_commit(
        &self,
        tree: &str,
        parents: &[String],
        message: &str,
    ) -> Pin<Box<dyn Future<Output = Result<String, StorageError>> + Send + '_>>;

    /// Resolve ref `name` to a commit sha.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] on request failure.
    fn get_ref(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>, StorageError>> + Send + '_>>;

    /// Create ref `name` pointing at `sha`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::RefExists`] if the ref already exists.
    fn create_ref(
        &self,
        name: &str,
        sha: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>>;

    /// Move ref `name` to `sha`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the ref does not exist.
    fn update_ref(
        &self,
        name: &str,
        sha: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>>;

    /// The commit ref `name` currently points at.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] on request failure.
    fn get_latest_version(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<CommitInfo>, StorageError>> + Send + '_>>;
}
