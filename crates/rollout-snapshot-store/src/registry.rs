//! Snapshot registry.
//!
//! One row per workspace naming its latest snapshot blob and the log
//! position it covers. [`SnapshotRegistry::record`] is a conditional
//! update: a row whose offset is lower than the stored one is refused.

use crate::{SnapshotStorage, SnapshotStoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Registry row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    /// Workspace the snapshot belongs to
    pub workspace_id: String,
    /// Blob path in snapshot storage
    pub path: String,
    /// Log partition the workspace is sharded to
    pub partition: i32,
    /// Last offset applied to the snapshotted state
    pub offset: i64,
    /// When the snapshot was taken
    pub timestamp: DateTime<Utc>,
    /// Partition count at the time of the snapshot
    pub num_partitions: i32,
}

/// Latest snapshot per workspace
#[async_trait]
pub trait SnapshotRegistry: Send + Sync + Debug {
    /// Record a snapshot; returns false when a newer row already exists
    async fn record(&self, record: SnapshotRecord) -> SnapshotStoreResult<bool>;

    /// Latest snapshot of a workspace
    async fn latest(&self, workspace_id: &str) -> SnapshotStoreResult<Option<SnapshotRecord>>;

    /// Every recorded workspace, sorted by id
    async fn all(&self) -> SnapshotStoreResult<Vec<SnapshotRecord>>;
}

fn supersedes(new: &SnapshotRecord, current: Option<&SnapshotRecord>) -> bool {
    current.map_or(true, |current| new.offset >= current.offset)
}

/// Registry held in memory
#[derive(Debug, Clone, Default)]
pub struct InMemorySnapshotRegistry {
    rows: Arc<RwLock<HashMap<String, SnapshotRecord>>>,
}

impl InMemorySnapshotRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotRegistry for InMemorySnapshotRegistry {
    async fn record(&self, record: SnapshotRecord) -> SnapshotStoreResult<bool> {
        let mut rows = self.rows.write().await;
        if !supersedes(&record, rows.get(&record.workspace_id)) {
            warn!(workspace_id = %record.workspace_id, offset = record.offset, "Refused snapshot row behind recorded offset");
            return Ok(false);
        }
        rows.insert(record.workspace_id.clone(), record);
        Ok(true)
    }

    async fn latest(&self, workspace_id: &str) -> SnapshotStoreResult<Option<SnapshotRecord>> {
        Ok(self.rows.read().await.get(workspace_id).cloned())
    }

    async fn all(&self) -> SnapshotStoreResult<Vec<SnapshotRecord>> {
        let mut rows: Vec<SnapshotRecord> = self.rows.read().await.values().cloned().collect();
        rows.sort_by(|a, b| a.workspace_id.cmp(&b.workspace_id));
        Ok(rows)
    }
}

const REGISTRY_FILE: &str = "registry.json";

/// Registry kept as a JSON row next to each workspace's blobs.
///
/// Used when no database is configured, so a `file://` deployment survives a
/// restart. Rows live at `{workspace}/registry.json`; writes are serialised
/// by an in-process lock.
#[derive(Debug, Clone)]
pub struct StorageSnapshotRegistry {
    storage: Arc<dyn SnapshotStorage>,
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl StorageSnapshotRegistry {
    /// Registry backed by `storage`
    pub fn new(storage: Arc<dyn SnapshotStorage>) -> Self {
        Self { storage, write_lock: Arc::new(tokio::sync::Mutex::new(())) }
    }

    fn row_path(workspace_id: &str) -> String {
        format!("{}/{}", workspace_id, REGISTRY_FILE)
    }

    async fn read_row(&self, path: &str) -> SnapshotStoreResult<Option<SnapshotRecord>> {
        if !self.storage.exists(path).await? {
            return Ok(None);
        }
        let bytes = self.storage.get(path).await?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

#[async_trait]
impl SnapshotRegistry for StorageSnapshotRegistry {
    async fn record(&self, record: SnapshotRecord) -> SnapshotStoreResult<bool> {
        let _guard = self.write_lock.lock().await;
        let path = Self::row_path(&record.workspace_id);
        let current = self.read_row(&path).await?;
        if !supersedes(&record, current.as_ref()) {
            warn!(workspace_id = %record.workspace_id, offset = record.offset, "Refused snapshot row behind recorded offset");
            return Ok(false);
        }
        self.storage.put(&path, &serde_json::to_vec(&record)?).await?;
        debug!(workspace_id = %record.workspace_id, offset = record.offset, "Recorded snapshot");
        Ok(true)
    }

    async fn latest(&self, workspace_id: &str) -> SnapshotStoreResult<Option<SnapshotRecord>> {
        self.read_row(&Self::row_path(workspace_id)).await
    }

    async fn all(&self) -> SnapshotStoreResult<Vec<SnapshotRecord>> {
        let mut rows = Vec::new();
        for path in self.storage.list("").await? {
            if path.ends_with(&format!("/{}", REGISTRY_FILE)) {
                if let Some(row) = self.read_row(&path).await? {
                    rows.push(row);
                }
            }
        }
        rows.sort_by(|a, b| a.workspace_id.cmp(&b.workspace_id));
        Ok(rows)
    }
}
