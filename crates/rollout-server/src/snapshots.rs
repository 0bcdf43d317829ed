//! Snapshot writing and loading.
//!
//! Writing captures the encoded workspace under its read lock, releases the
//! lock, then uploads the blob and records the registry row. Loading reads
//! the registry row, fetches the blob and decodes it; the registry offset is
//! authoritative for where replay ends.

use crate::error::{ServerError, ServerResult};
use crate::retry::{with_retry, RetryPolicy};
use chrono::Utc;
use rollout_engine::{snapshot, Clock, EngineConfig, Workspace, WorkspaceHandle};
use rollout_monitoring::EngineMetrics;
use rollout_snapshot_store::{snapshot_path, SnapshotRecord, SnapshotRegistry, SnapshotStorage};
use std::sync::Arc;
use tracing::{info, warn};

/// Snapshot storage plus registry
#[derive(Debug, Clone)]
pub struct SnapshotManager {
    storage: Arc<dyn SnapshotStorage>,
    registry: Arc<dyn SnapshotRegistry>,
    num_partitions: i32,
    retry: RetryPolicy,
}

impl SnapshotManager {
    /// Manager over `storage` and `registry`
    pub fn new(
        storage: Arc<dyn SnapshotStorage>,
        registry: Arc<dyn SnapshotRegistry>,
        num_partitions: i32,
        retry: RetryPolicy,
    ) -> Self {
        Self { storage, registry, num_partitions, retry }
    }

    /// Snapshot registry
    pub fn registry(&self) -> &Arc<dyn SnapshotRegistry> {
        &self.registry
    }

    /// Snapshot a workspace sharded to `partition`.
    ///
    /// Returns the row written, or `None` when the registry already holds a
    /// newer snapshot.
    pub async fn save(&self, handle: &WorkspaceHandle, partition: i32) -> ServerResult<Option<SnapshotRecord>> {
        let (workspace_id, offset, bytes) = {
            let ws = handle.read().await;
            (ws.id().to_string(), ws.last_processed_offset(), snapshot::encode(&ws)?)
        };

        let path = snapshot_path(&workspace_id, offset);
        with_retry(self.retry, "write snapshot", || async {
            self.storage.put(&path, &bytes).await.map_err(ServerError::from)
        })
        .await?;

        let record = SnapshotRecord {
            workspace_id: workspace_id.clone(),
            path,
            partition,
            offset,
            timestamp: Utc::now(),
            num_partitions: self.num_partitions,
        };
        let accepted = with_retry(self.retry, "record snapshot", || async {
            self.registry.record(record.clone()).await.map_err(ServerError::from)
        })
        .await?;

        if !accepted {
            warn!(workspace_id = %workspace_id, offset, "Snapshot is behind the registry; row not updated");
            return Ok(None);
        }
        EngineMetrics::record_snapshot_written(partition);
        info!(workspace_id = %workspace_id, partition, offset, bytes = bytes.len(), "Wrote snapshot");
        Ok(Some(record))
    }

    /// Registry rows of workspaces on `partition` whose snapshot was taken
    /// with the current partition count
    pub async fn records_for_partition(&self, partition: i32) -> ServerResult<Vec<SnapshotRecord>> {
        let rows = with_retry(self.retry, "list snapshots", || async {
            self.registry.all().await.map_err(ServerError::from)
        }).await?;
        Ok(rows
            .into_iter()
            .filter(|row| crate::partition::partition_of(&row.workspace_id, self.num_partitions) == partition)
            .filter(|row| {
                let usable = row.num_partitions == self.num_partitions && row.partition == partition;
                if !usable {
                    warn!(
                        workspace_id = %row.workspace_id,
                        recorded_partitions = row.num_partitions,
                        partitions = self.num_partitions,
                        "Ignoring snapshot taken under a different partitioning"
                    );
                }
                usable
            })
            .collect())
    }

    /// Fetch and decode the snapshot a row points to
    pub async fn load(&self, record: &SnapshotRecord, config: EngineConfig, clock: Arc<dyn Clock>) -> ServerResult<Workspace> {
        let bytes = with_retry(self.retry, "read snapshot", || async {
            self.storage.get(&record.path).await.map_err(ServerError::from)
        }).await?;
        let mut ws = snapshot::decode(&bytes, config, clock)?;
        ws.set_snapshot_offset(record.offset);
        ws.set_last_processed_offset(record.offset);
        Ok(ws)
    }
}
