//! Reconciler.
//!
//! Runs at the end of every event under the workspace write lock. Each pass
//! re-plans the dirty targets, stores any newly desired release, queues
//! deferred targets on the scheduler and, in live mode, creates a job when
//! the target's latest job does not already cover the desired release. A
//! target that produced a job is re-queued so the next pass can confirm the
//! fixed point. Passes stop when nothing is dirty or the budget runs out.

use crate::planner::{self, evaluators};
use crate::workspace::{ApplyMode, Workspace};
use rollout_core::{ids, Job, JobStatus, OutboundEvent, Release, ReleaseTarget, ROLLBACK_METADATA_KEY};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// What a reconciliation run did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Passes executed
    pub passes: usize,
    /// Targets planned
    pub planned: usize,
    /// Releases stored
    pub releases_created: usize,
    /// Jobs created
    pub jobs_created: usize,
    /// Whether the budget ran out before a fixed point
    pub budget_exhausted: bool,
}

/// Reconcile a workspace.
///
/// In replay mode targets are planned (releases and scheduler entries are
/// state) but no jobs are created and the targets stay queued, so the first
/// live event reconciles them.
pub fn run(ws: &mut Workspace) -> ReconcileReport {
    let mut report = ReconcileReport::default();

    if ws.mode == ApplyMode::Replay {
        let keys: Vec<String> = ws.dirty.iter().cloned().collect();
        for key in keys {
            plan_target(ws, &key, &mut report);
        }
        report.passes = 1;
        return report;
    }

    report.jobs_created += process_rollbacks(ws);

    while !ws.dirty.is_empty() {
        if report.passes >= ws.config.reconcile_budget {
            report.budget_exhausted = true;
            warn!(
                workspace_id = %ws.id(),
                remaining = ws.dirty.len(),
                budget = ws.config.reconcile_budget,
                "Reconcile budget exhausted before reaching a fixed point"
            );
            break;
        }
        report.passes += 1;

        let batch = std::mem::take(&mut ws.dirty);
        for key in batch {
            let Some(target) = plan_target(ws, &key, &mut report) else {
                continue;
            };
            if let Some(job) = next_job(ws, &target) {
                if create_job(ws, job) {
                    report.jobs_created += 1;
                    ws.mark_dirty(&key);
                }
            }
        }
    }

    report
}

/// Plan one target, store its desired release and schedule a deferral.
/// Returns `None` if the target no longer exists.
fn plan_target(ws: &mut Workspace, key: &str, report: &mut ReconcileReport) -> Option<ReleaseTarget> {
    let Some(target) = ws.release_targets.get(key).cloned() else {
        ws.plans.remove(key);
        return None;
    };

    let mut outcome = planner::plan(&ws.view(), &target);
    report.planned += 1;

    if let Some(until) = outcome.deferred_until {
        let reason = outcome.defer_reason.clone().unwrap_or_default();
        if ws.scheduler.schedule(key, until, reason) {
            debug!(workspace_id = %ws.id(), target = %target, until = %until, "Target deferred");
        }
    }

    if let Some(release) = outcome.desired.take() {
        let stored = match ws.stores.releases.get(&release.id) {
            Some(existing) => existing.clone(),
            None => store_release(ws, release, report),
        };
        outcome.desired = Some(stored);
    }

    ws.plans.insert(key.to_string(), outcome);
    Some(target)
}

fn store_release(ws: &mut Workspace, release: Release, report: &mut ReconcileReport) -> Release {
    let fallback = release.clone();
    match ws.write(release).and_then(|change| change.new) {
        Some(stored) => {
            info!(
                workspace_id = %ws.id(),
                release_id = %stored.id,
                target = %stored.release_target,
                version = %stored.version.tag,
                "Release created"
            );
            ws.job_index.add_release(&stored);
            report.releases_created += 1;
            stored
        }
        None => fallback,
    }
}

/// Job the target needs next, if any
fn next_job(ws: &Workspace, target: &ReleaseTarget) -> Option<Job> {
    let key = target.key();
    let desired = ws.plans.get(&key)?.desired.as_ref()?;

    if let Some(latest) = ws.job_index.latest_job(&ws.stores, &key) {
        if latest.release_id == desired.id && !latest.status.is_unsuccessful() {
            return None;
        }
    }

    let world = ws.view();
    let policies = world.policies_for(target);
    let retry = evaluators::retry::evaluate(&world, &policies, desired);
    if !retry.is_allow() {
        debug!(workspace_id = %ws.id(), target = %target, decision = ?retry, "Retry limit reached");
        return None;
    }

    let ordinal = ws
        .job_index
        .jobs_for_release(&ws.stores, &desired.id)
        .iter()
        .filter(|job| !job.is_rollback())
        .count();
    let id = ids::job_id(&desired.id, ordinal, "deploy");
    build_job(ws, desired, id, BTreeMap::new())
}

/// A pending job for `release`, or an `invalidJobAgent` one when the
/// deployment's agent is missing. `None` when the deployment has no agent.
fn build_job(ws: &Workspace, release: &Release, id: String, metadata: BTreeMap<String, String>) -> Option<Job> {
    if ws.stores.jobs.contains(&id) {
        return None;
    }
    let deployment = ws.stores.deployments.get(&release.release_target.deployment_id)?;
    let Some(agent_id) = deployment.job_agent_id.clone() else {
        debug!(
            workspace_id = %ws.id(),
            deployment_id = %deployment.id,
            "Deployment has no job agent; not creating a job"
        );
        return None;
    };

    let (status, message, mut config) = match ws.stores.job_agents.get(&agent_id) {
        Some(agent) => (JobStatus::Pending, None, agent.config.clone()),
        None => (
            JobStatus::InvalidJobAgent,
            Some(format!("Job agent {} not found", agent_id)),
            Value::Object(Default::default()),
        ),
    };
    deep_merge(&mut config, &deployment.job_agent_config);
    deep_merge(&mut config, &release.version.job_agent_config);

    Some(Job {
        id,
        release_id: release.id.clone(),
        job_agent_id: agent_id,
        job_agent_config: config,
        status,
        external_id: None,
        message,
        metadata,
        created_at: None,
        updated_at: None,
        started_at: None,
        completed_at: None,
    })
}

fn create_job(ws: &mut Workspace, job: Job) -> bool {
    let Some(stored) = ws.write(job).and_then(|change| change.new) else {
        return false;
    };
    ws.job_index.add_job(&stored);
    info!(
        workspace_id = %ws.id(),
        job_id = %stored.id,
        release_id = %stored.release_id,
        status = ?stored.status,
        rollback = stored.is_rollback(),
        "Job created"
    );
    ws.emit(OutboundEvent::JobCreated { job: stored });
    true
}

/// Create the jobs for queued rollbacks. Rollback jobs bypass the retry
/// limiter; their ids derive from the failed job so a repeated trigger is a
/// no-op.
fn process_rollbacks(ws: &mut Workspace) -> usize {
    let requests = std::mem::take(&mut ws.pending_rollbacks);
    let mut created = 0;

    for request in requests {
        if !ws.release_targets.contains(&request.target_key) {
            debug!(workspace_id = %ws.id(), target = %request.target_key, "Dropping rollback for removed target");
            continue;
        }
        let Some(release) = ws.stores.releases.get(&request.release_id).cloned() else {
            warn!(workspace_id = %ws.id(), release_id = %request.release_id, "Rollback release vanished");
            continue;
        };
        let id = ids::job_id(&release.id, 0, &format!("rollback:{}", request.failed_job_id));
        let metadata = BTreeMap::from([(ROLLBACK_METADATA_KEY.to_string(), "true".to_string())]);

        if let Some(job) = build_job(ws, &release, id, metadata) {
            if create_job(ws, job) {
                info!(
                    workspace_id = %ws.id(),
                    target = %request.target_key,
                    version = %release.version.tag,
                    "Rolled back"
                );
                created += 1;
            }
        }
        ws.mark_dirty(&request.target_key);
    }
    created
}

/// Merge `overlay` into `base`: objects merge key by key, anything else is
/// replaced
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deep_merge_later_wins() {
        let mut config = json!({ "image": "api", "env": { "A": "1", "B": "1" }, "replicas": 2 });
        deep_merge(&mut config, &json!({ "env": { "B": "2" }, "replicas": 3 }));
        deep_merge(&mut config, &json!({ "env": { "C": "3" }, "image": { "tag": "v2" } }));

        assert_eq!(
            config,
            json!({ "image": { "tag": "v2" }, "env": { "A": "1", "B": "2", "C": "3" }, "replicas": 3 })
        );
    }
}
