//! In-memory snapshot storage

use crate::{SnapshotStorage, SnapshotStoreError, SnapshotStoreResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Snapshot blobs held in process memory
#[derive(Debug, Clone, Default)]
pub struct InMemorySnapshotStorage {
    blobs: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl InMemorySnapshotStorage {
    /// Empty storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs
    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    /// Whether nothing is stored
    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl SnapshotStorage for InMemorySnapshotStorage {
    async fn put(&self, path: &str, bytes: &[u8]) -> SnapshotStoreResult<()> {
        self.blobs.write().await.insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, path: &str) -> SnapshotStoreResult<Vec<u8>> {
        self.blobs
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| SnapshotStoreError::NotFound(path.to_string()))
    }

    async fn exists(&self, path: &str) -> SnapshotStoreResult<bool> {
        Ok(self.blobs.read().await.contains_key(path))
    }

    async fn delete(&self, path: &str) -> SnapshotStoreResult<()> {
        self.blobs.write().await.remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> SnapshotStoreResult<Vec<String>> {
        Ok(self
            .blobs
            .read()
            .await
            .keys()
            .filter(|path| path.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let storage = InMemorySnapshotStorage::new();
        storage.put("ws/1.snapshot", b"one").await.unwrap();
        storage.put("ws/2.snapshot", b"two").await.unwrap();
        storage.put("other/1.snapshot", b"x").await.unwrap();

        assert_eq!(storage.get("ws/1.snapshot").await.unwrap(), b"one".to_vec());
        assert_eq!(storage.list("ws/").await.unwrap(), vec!["ws/1.snapshot", "ws/2.snapshot"]);

        storage.delete("ws/1.snapshot").await.unwrap();
        storage.delete("ws/1.snapshot").await.unwrap();
        assert!(matches!(storage.get("ws/1.snapshot").await, Err(SnapshotStoreError::NotFound(_))));
        assert_eq!(storage.len().await, 2);
    }
}
