//! Partition consumer.
//!
//! One consumer owns one partition. On start it loads the snapshot of every
//! workspace sharded to the partition (or bootstraps it from the database),
//! seeks to the lowest snapshot offset + 1 and then applies records in
//! order. A record at or below its workspace's snapshot offset is applied in
//! replay mode: state is rebuilt, nothing is published. Later records are
//! live and their side effects go through the [`Outbox`].

use crate::bootstrap::{stores_from_rows, InitialStateLoader};
use crate::dispatch::Outbox;
use crate::error::ServerResult;
use crate::log::{LogRecord, PartitionReader};
use crate::partition::partition_of;
use crate::retry::{with_retry, RetryPolicy};
use crate::snapshots::SnapshotManager;
use dashmap::DashMap;
use rollout_core::EventEnvelope;
use rollout_engine::{ApplyMode, Workspace, WorkspaceRegistry};
use rollout_monitoring::{EngineMetrics, LogExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Per-workspace event counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkspaceStats {
    /// Events applied live
    pub live: u64,
    /// Events applied in replay mode
    pub replayed: u64,
    /// Events skipped (rejected or quarantined)
    pub skipped: u64,
}

/// Event counts for every workspace seen by this process
#[derive(Debug, Default)]
pub struct ConsumerStats {
    workspaces: DashMap<String, WorkspaceStats>,
}

impl ConsumerStats {
    /// Empty statistics
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, workspace_id: &str, f: impl FnOnce(&mut WorkspaceStats)) {
        f(&mut self.workspaces.entry(workspace_id.to_string()).or_default());
    }

    /// Counts for one workspace
    pub fn get(&self, workspace_id: &str) -> WorkspaceStats {
        self.workspaces.get(workspace_id).map(|entry| *entry.value()).unwrap_or_default()
    }

    /// Counts for every workspace, ordered by id
    pub fn all(&self) -> BTreeMap<String, WorkspaceStats> {
        self.workspaces.iter().map(|entry| (entry.key().clone(), *entry.value())).collect()
    }
}

/// Shared collaborators of every partition consumer
#[derive(Debug, Clone)]
pub struct ConsumerContext {
    /// Loaded workspaces
    pub workspaces: Arc<WorkspaceRegistry>,
    /// Snapshot storage and registry
    pub snapshots: Arc<SnapshotManager>,
    /// Cold-start bootstrap
    pub loader: Arc<dyn InitialStateLoader>,
    /// Live side effects
    pub outbox: Arc<Outbox>,
    /// Event counts
    pub stats: Arc<ConsumerStats>,
    /// Partition count
    pub num_partitions: i32,
    /// Backoff for transient I/O
    pub retry: RetryPolicy,
}

/// Consumer of a single partition
#[derive(Debug)]
pub struct PartitionConsumer {
    partition: i32,
    reader: Box<dyn PartitionReader>,
    ctx: ConsumerContext,
    poll_wait: Duration,
}

impl PartitionConsumer {
    /// Consumer reading through `reader`
    pub fn new(reader: Box<dyn PartitionReader>, ctx: ConsumerContext) -> Self {
        Self { partition: reader.partition(), reader, ctx, poll_wait: Duration::from_millis(200) }
    }

    /// Partition consumed
    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Load the workspaces of this partition and seek to the first offset
    /// any of them still needs. Returns that offset.
    pub async fn cold_start(&mut self) -> ServerResult<i64> {
        let partition = self.partition;
        let mut offsets = Vec::new();

        for record in self.ctx.snapshots.records_for_partition(partition).await? {
            let loaded = self
                .ctx
                .snapshots
                .load(&record, self.ctx.workspaces.config().clone(), self.ctx.workspaces.clock())
                .await;
            match loaded {
                Ok(ws) => {
                    info!(workspace_id = %record.workspace_id, partition, offset = record.offset, "Loaded workspace snapshot");
                    offsets.push(ws.snapshot_offset());
                    self.ctx.workspaces.register(ws);
                }
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    warn!(workspace_id = %record.workspace_id, error = %e, "Unreadable snapshot, bootstrapping from database");
                    offsets.push(self.bootstrap(&record.workspace_id).await?);
                }
            }
        }

        let ids = with_retry(self.ctx.retry, "list bootstrap workspaces", || self.ctx.loader.workspace_ids()).await?;
        for workspace_id in ids {
            if partition_of(&workspace_id, self.ctx.num_partitions) != partition || self.ctx.workspaces.get(&workspace_id).is_some() {
                continue;
            }
            offsets.push(self.bootstrap(&workspace_id).await?);
        }

        let seek = offsets.iter().min().map_or(0, |offset| offset + 1).max(0);
        self.reader.seek(seek).await?;
        info!(partition, workspaces = offsets.len(), seek, "Partition cold start complete");
        Ok(seek)
    }

    async fn bootstrap(&self, workspace_id: &str) -> ServerResult<i64> {
        let rows = with_retry(self.ctx.retry, "load initial state", || self.ctx.loader.load(workspace_id)).await?;
        let clock = self.ctx.workspaces.clock();
        let ws = match stores_from_rows(rows, clock.now()) {
            Ok(stores) => Workspace::from_stores(workspace_id, stores, self.ctx.workspaces.config().clone(), clock),
            Err(e) => {
                error!(workspace_id, error = %e, "Initial state rejected, starting empty");
                Workspace::new(workspace_id, self.ctx.workspaces.config().clone(), clock)
            }
        };
        info!(workspace_id, partition = self.partition, "Bootstrapped workspace");
        self.ctx.workspaces.register(ws);
        Ok(-1)
    }

    /// Apply one record
    pub async fn process(&mut self, record: LogRecord) -> ServerResult<()> {
        let partition = self.partition;
        let offset = record.offset;

        let envelope = match EventEnvelope::decode(&record.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(partition, offset, error = %e, "Skipping undecodable record");
                EngineMetrics::record_event_skipped("decode");
                return self.reader.commit(offset).await;
            }
        };
        let workspace_id = envelope.workspace_id.clone();
        if partition_of(&workspace_id, self.ctx.num_partitions) != partition {
            warn!(workspace_id = %workspace_id, partition, offset, "Record for a workspace sharded elsewhere");
        }

        let handle = self.ctx.workspaces.get_or_create(&workspace_id);
        let (result, mode, newly_quarantined) = {
            let mut ws = handle.write().await;
            let mode = if offset <= ws.snapshot_offset() { ApplyMode::Replay } else { ApplyMode::Live };
            let was_quarantined = ws.is_quarantined();
            let result = ws.apply(&envelope, mode);
            ws.set_last_processed_offset(offset);
            (result, mode, !was_quarantined && ws.is_quarantined())
        };

        match result {
            Ok(outcome) => {
                let replay = mode == ApplyMode::Replay;
                self.ctx.stats.update(&workspace_id, |stats| {
                    if replay {
                        stats.replayed += 1;
                    } else {
                        stats.live += 1;
                    }
                });
                EngineMetrics::record_event_applied(&envelope.event_type, replay);
                debug!(
                    workspace_id = %workspace_id,
                    event_type = %envelope.event_type,
                    partition,
                    offset,
                    replay,
                    outbound = outcome.outbound.len(),
                    "Applied event"
                );

                if !replay {
                    self.ctx.outbox.publish(&workspace_id, outcome.outbound).await?;
                    if outcome.save_requested {
                        self.ctx
                            .snapshots
                            .save(&handle, partition)
                            .await
                            .log_err("Failed to write snapshot")?;
                    }
                }
            }
            Err(e) => {
                self.ctx.stats.update(&workspace_id, |stats| stats.skipped += 1);
                if newly_quarantined {
                    EngineMetrics::record_workspace_quarantined();
                    error!(workspace_id = %workspace_id, partition, offset, error = %e, "Workspace quarantined");
                } else if e.is_decode() {
                    EngineMetrics::record_event_skipped("invalid");
                    warn!(workspace_id = %workspace_id, event_type = %envelope.event_type, offset, error = %e, "Skipping invalid event");
                } else {
                    EngineMetrics::record_event_skipped("rejected");
                    error!(workspace_id = %workspace_id, event_type = %envelope.event_type, offset, error = %e, "Event rejected");
                }
            }
        }

        self.reader.commit(offset).await
    }

    /// Read and apply at most one record; returns whether one was read
    pub async fn poll_once(&mut self) -> ServerResult<bool> {
        match self.reader.poll(self.poll_wait).await? {
            Some(record) => {
                self.process(record).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Apply every record currently in the partition
    pub async fn drain(&mut self) -> ServerResult<usize> {
        let mut applied = 0;
        while self.poll_once().await? {
            applied += 1;
        }
        Ok(applied)
    }

    /// Cold start, then consume until `shutdown` turns true.
    ///
    /// Transient read errors are retried with backoff; when they persist, or
    /// when applying a record fails after its own retries, the error is
    /// returned and the worker stops.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> ServerResult<()> {
        self.cold_start().await?;
        let mut failures = 0;
        loop {
            let stop = *shutdown.borrow_and_update();
            if stop {
                break;
            }
            match self.reader.poll(self.poll_wait).await {
                Ok(Some(record)) => {
                    failures = 0;
                    self.process(record).await.log_err("Partition consumer halted")?;
                }
                Ok(None) => failures = 0,
                Err(e) if e.is_transient() && failures + 1 < self.ctx.retry.attempts => {
                    failures += 1;
                    let delay = self.ctx.retry.delay_after(failures);
                    warn!(partition = self.partition, failures, error = %e, "Partition read failed, backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(partition = self.partition, error = %e, "Partition consumer halted");
                    return Err(e);
                }
            }
        }
        info!(partition = self.partition, "Partition consumer stopped");
        Ok(())
    }

    /// Evict every workspace sharded to `partition`; their snapshots stay
    /// authoritative
    pub fn revoke(workspaces: &WorkspaceRegistry, partition: i32, num_partitions: i32) -> Vec<String> {
        let evicted = workspaces.evict_where(|id| partition_of(id, num_partitions) == partition);
        info!(partition, evicted = evicted.len(), "Partition revoked");
        evicted
    }
}
