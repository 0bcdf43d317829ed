//! Scheduler ticker.
//!
//! Periodically looks for workspaces whose earliest deferred deadline has
//! passed and appends a `workspace.tick` event for them to the log, so the
//! re-plan goes through the normal ordered event path. It never holds a
//! workspace lock while doing I/O. The same loop retries queued job
//! dispatches.

use crate::dispatch::Outbox;
use crate::error::ServerResult;
use crate::partition::partition_of;
use chrono::{DateTime, Utc};
use rollout_core::{EventEnvelope, EventType};
use rollout_engine::WorkspaceRegistry;
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Emits `workspace.tick` events for due workspaces
#[derive(Debug)]
pub struct Ticker {
    workspaces: Arc<WorkspaceRegistry>,
    outbox: Arc<Outbox>,
    partitions: BTreeSet<i32>,
    num_partitions: i32,
    interval: Duration,
    ticked: HashMap<String, DateTime<Utc>>,
}

impl Ticker {
    /// Ticker for workspaces on `partitions`
    pub fn new(
        workspaces: Arc<WorkspaceRegistry>,
        outbox: Arc<Outbox>,
        partitions: impl IntoIterator<Item = i32>,
        num_partitions: i32,
        interval: Duration,
    ) -> Self {
        Self {
            workspaces,
            outbox,
            partitions: partitions.into_iter().collect(),
            num_partitions,
            interval,
            ticked: HashMap::new(),
        }
    }

    /// One pass: returns the workspaces a tick was appended for
    pub async fn tick_once(&mut self) -> ServerResult<Vec<String>> {
        let now = self.workspaces.clock().now();
        let mut ticked = Vec::new();

        for workspace_id in self.workspaces.ids() {
            if !self.partitions.contains(&partition_of(&workspace_id, self.num_partitions)) {
                continue;
            }
            let Some(handle) = self.workspaces.get(&workspace_id) else { continue };
            let deadline = {
                let mut ws = handle.write().await;
                if ws.is_quarantined() {
                    continue;
                }
                ws.next_deadline()
            };
            let Some(deadline) = deadline.filter(|deadline| *deadline <= now) else {
                self.ticked.remove(&workspace_id);
                continue;
            };
            // One tick per deadline
            if self.ticked.get(&workspace_id) == Some(&deadline) {
                continue;
            }

            let timestamp = now.timestamp_nanos_opt().unwrap_or_default();
            let envelope = EventEnvelope::new(EventType::WorkspaceTick, &workspace_id, json!({ "timestamp": timestamp })).at(now);
            self.outbox.append(&envelope).await?;
            debug!(workspace_id = %workspace_id, deadline = %deadline, "Appended tick");
            self.ticked.insert(workspace_id.clone(), deadline);
            ticked.push(workspace_id);
        }

        self.ticked.retain(|id, _| self.workspaces.get(id).is_some());
        Ok(ticked)
    }

    /// Tick until `shutdown` turns true
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> ServerResult<()> {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_ms = self.interval.as_millis() as u64, "Scheduler ticker started");
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            self.tick_once().await?;
            match self.outbox.retry_due().await {
                Ok(0) => {}
                Ok(retried) => debug!(retried, "Retried job dispatches"),
                Err(e) => warn!(error = %e, "Dispatch retry failed"),
            }
        }
        info!("Scheduler ticker stopped");
        Ok(())
    }
}
