//! Engine counters recorded through the `metrics` facade.

use metrics::counter;

/// Applied in replay mode
pub const MODE_REPLAY: &str = "replay";
/// Applied in live mode
pub const MODE_LIVE: &str = "live";

/// Counter names and recording helpers
pub struct EngineMetrics;

impl EngineMetrics {
    /// Events applied to a workspace
    pub const EVENTS_APPLIED: &'static str = "rollout_events_applied_total";
    /// Events skipped (decode errors, quarantined workspaces, handler errors)
    pub const EVENTS_SKIPPED: &'static str = "rollout_events_skipped_total";
    /// Jobs created by the reconciler
    pub const JOBS_CREATED: &'static str = "rollout_jobs_created_total";
    /// Jobs handed to the dispatcher that it rejected
    pub const DISPATCH_FAILURES: &'static str = "rollout_dispatch_failures_total";
    /// Snapshots written
    pub const SNAPSHOTS_WRITTEN: &'static str = "rollout_snapshots_written_total";
    /// Workspaces quarantined
    pub const WORKSPACES_QUARANTINED: &'static str = "rollout_workspaces_quarantined_total";

    /// Record an applied event
    pub fn record_event_applied(event_type: &str, replay: bool) {
        let mode = if replay { MODE_REPLAY } else { MODE_LIVE };
        counter!(Self::EVENTS_APPLIED, 1, "event_type" => event_type.to_string(), "mode" => mode);
    }

    /// Record a skipped event
    pub fn record_event_skipped(reason: &'static str) {
        counter!(Self::EVENTS_SKIPPED, 1, "reason" => reason);
    }

    /// Record created jobs
    pub fn record_jobs_created(count: usize) {
        if count > 0 {
            counter!(Self::JOBS_CREATED, count as u64);
        }
    }

    /// Record a rejected dispatch
    pub fn record_dispatch_failure(retryable: bool) {
        counter!(Self::DISPATCH_FAILURES, 1, "retryable" => if retryable { "true" } else { "false" });
    }

    /// Record a written snapshot
    pub fn record_snapshot_written(partition: i32) {
        counter!(Self::SNAPSHOTS_WRITTEN, 1, "partition" => partition.to_string());
    }

    /// Record a quarantined workspace
    pub fn record_workspace_quarantined() {
        counter!(Self::WORKSPACES_QUARANTINED, 1);
    }
}
