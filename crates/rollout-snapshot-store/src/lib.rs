//! Rollout Snapshot Store
//!
//! Blob storage for encoded workspace snapshots and the snapshot registry
//! that records, per workspace, which blob is the latest and which log
//! offset it covers. The [`SnapshotStorage`] trait abstracts the blob store;
//! [`SnapshotRegistry`] abstracts the registry table, whose updates are
//! conditional so a late writer can never move a workspace's offset
//! backwards.

use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;

pub mod file;
pub mod memory;
pub mod registry;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use file::FileSnapshotStorage;
pub use memory::InMemorySnapshotStorage;
pub use registry::{InMemorySnapshotRegistry, SnapshotRecord, SnapshotRegistry, StorageSnapshotRegistry};

/// Errors raised by snapshot storage and the registry
#[derive(Error, Debug)]
pub enum SnapshotStoreError {
    /// Underlying I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No blob at the given path
    #[error("Snapshot not found: {0}")]
    NotFound(String),

    /// A registry row could not be encoded or decoded
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// The storage URL names a scheme this build cannot serve
    #[error("Unsupported snapshot storage: {0}")]
    Unsupported(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Registry backend error
    #[error("Registry error: {0}")]
    RegistryError(String),
}

impl SnapshotStoreError {
    /// Whether retrying the operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, SnapshotStoreError::Io(_) | SnapshotStoreError::RegistryError(_))
    }
}

/// Result type for snapshot store operations
pub type SnapshotStoreResult<T> = Result<T, SnapshotStoreError>;

/// Blob store for encoded snapshots
#[async_trait]
pub trait SnapshotStorage: Send + Sync + Debug {
    /// Write a blob, replacing any existing one at `path`
    async fn put(&self, path: &str, bytes: &[u8]) -> SnapshotStoreResult<()>;

    /// Read a blob
    async fn get(&self, path: &str) -> SnapshotStoreResult<Vec<u8>>;

    /// Whether a blob exists
    async fn exists(&self, path: &str) -> SnapshotStoreResult<bool>;

    /// Remove a blob; removing a missing blob is not an error
    async fn delete(&self, path: &str) -> SnapshotStoreResult<()>;

    /// Paths starting with `prefix`, sorted
    async fn list(&self, prefix: &str) -> SnapshotStoreResult<Vec<String>>;
}

/// Blob path of a workspace snapshot taken at `offset`.
///
/// Offsets are zero padded so lexical order matches offset order.
pub fn snapshot_path(workspace_id: &str, offset: i64) -> String {
    format!("{}/{:020}.snapshot", workspace_id, offset.max(0))
}

/// Build the storage named by a `SNAPSHOT_STORAGE_URL`.
///
/// `file://<dir>` and `memory://` are supported; `gs://` and `s3://` are
/// recognised and rejected.
pub fn storage_from_url(url: &str) -> SnapshotStoreResult<Arc<dyn SnapshotStorage>> {
    if let Some(dir) = url.strip_prefix("file://") {
        if dir.is_empty() {
            return Err(SnapshotStoreError::ConfigurationError("file:// URL has no directory".to_string()));
        }
        return Ok(Arc::new(FileSnapshotStorage::new(dir)));
    }
    if url.starts_with("memory://") {
        return Ok(Arc::new(InMemorySnapshotStorage::new()));
    }
    if url.starts_with("gs://") || url.starts_with("s3://") {
        return Err(SnapshotStoreError::Unsupported(format!("{} (object storage backends are not built in)", url)));
    }
    Err(SnapshotStoreError::ConfigurationError(format!("Unrecognised snapshot storage URL: {}", url)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_paths_sort_by_offset() {
        let mut paths = vec![snapshot_path("ws", 100), snapshot_path("ws", 9), snapshot_path("ws", 12)];
        paths.sort();
        assert_eq!(paths, vec![snapshot_path("ws", 9), snapshot_path("ws", 12), snapshot_path("ws", 100)]);
        assert_eq!(snapshot_path("ws", 7), "ws/00000000000000000007.snapshot");
    }

    #[test]
    fn test_storage_from_url() {
        assert!(storage_from_url("memory://").is_ok());
        assert!(storage_from_url("file:///tmp/snapshots").is_ok());
        assert!(matches!(storage_from_url("s3://bucket/prefix"), Err(SnapshotStoreError::Unsupported(_))));
        assert!(matches!(storage_from_url("gs://bucket"), Err(SnapshotStoreError::Unsupported(_))));
        assert!(matches!(storage_from_url("ftp://x"), Err(SnapshotStoreError::ConfigurationError(_))));
    }
}
