//! Job outcome follow-ups: verification records, verification requests and
//! the rollback trigger.

use crate::planner::evaluators::rollback;
use crate::workspace::{ApplyMode, RollbackRequest, Workspace};
use rollout_core::{
    CoreError, CoreResult, EventEnvelope, Job, JobStatus, JobVerification, OutboundEvent, Release,
    VerificationCompletedPayload, VerificationStartedPayload, VerificationStatus,
};
use tracing::{debug, info, warn};

/// React to a job changing status: re-plan its target and the targets beside
/// it, request verification of successful deploys and roll back failures.
pub(crate) fn on_job_status_change(ws: &mut Workspace, job: &Job) {
    let Some(release) = ws.stores.releases.get(&job.release_id).cloned() else {
        warn!(workspace_id = %ws.id(), job_id = %job.id, "Job references unknown release");
        return;
    };
    let target = release.release_target.clone();
    ws.mark_dirty(&target.key());
    ws.mark_siblings_dirty(&target);

    if job.is_rollback() {
        return;
    }

    let (verify, roll_back) = {
        let world = ws.view();
        let policies = world.policies_for(&target);
        (
            job.status == JobStatus::Successful && rollback::triggers_on_verification(&policies),
            rollback::triggers_on_status(&policies, job.status),
        )
    };

    if verify {
        debug!(workspace_id = %ws.id(), job_id = %job.id, "Requesting verification");
        ws.emit(OutboundEvent::VerificationRequested {
            job_id: job.id.clone(),
            release_id: release.id.clone(),
            release_target: target.clone(),
        });
    }
    if roll_back {
        trigger_rollback(ws, &release, &job.id);
    }
}

/// Queue a job for the previous good release and block the failed release's
/// version on its target. Without a previous release nothing is blocked, so
/// retry rules still apply to the failed release.
pub(crate) fn trigger_rollback(ws: &mut Workspace, failed: &Release, failed_job_id: &str) {
    let target_key = failed.release_target.key();

    let previous = rollback::rollback_release(&ws.view(), &target_key, failed).map(|r| r.id.clone());
    match previous {
        Some(release_id) => {
            ws.rollback_blocks
                .entry(target_key.clone())
                .or_default()
                .insert(failed.version.id.clone());
            info!(
                workspace_id = %ws.id(),
                target = %failed.release_target,
                failed_version = %failed.version.tag,
                release_id = %release_id,
                "Rollback triggered"
            );
            if ws.mode == ApplyMode::Live {
                ws.pending_rollbacks.push(RollbackRequest {
                    target_key: target_key.clone(),
                    release_id,
                    failed_job_id: failed_job_id.to_string(),
                });
            }
        }
        None => info!(
            workspace_id = %ws.id(),
            target = %failed.release_target,
            failed_version = %failed.version.tag,
            "No earlier successful release to roll back to"
        ),
    }
    ws.mark_dirty(&target_key);
}

/// `job-verification.started`
pub(crate) fn started(ws: &mut Workspace, event: &EventEnvelope) -> CoreResult<()> {
    let payload: VerificationStartedPayload = event.payload()?;
    ensure_job(ws, &payload.job_id)?;

    let id = payload.id.unwrap_or_else(|| payload.job_id.clone());
    let existing = ws.stores.job_verifications.get(&id).cloned();
    let record = JobVerification {
        id,
        job_id: payload.job_id,
        status: VerificationStatus::Running,
        message: None,
        created_at: existing.as_ref().and_then(|v| v.created_at),
        updated_at: existing.as_ref().and_then(|v| v.updated_at),
    };
    ws.write(record);
    Ok(())
}

/// `job-verification.completed`
pub(crate) fn completed(ws: &mut Workspace, event: &EventEnvelope) -> CoreResult<()> {
    let payload: VerificationCompletedPayload = event.payload()?;
    let job = ensure_job(ws, &payload.job_id)?;

    let id = payload.id.unwrap_or_else(|| payload.job_id.clone());
    let existing = ws.stores.job_verifications.get(&id).cloned();
    let status = if payload.passed { VerificationStatus::Passed } else { VerificationStatus::Failed };
    let record = JobVerification {
        id,
        job_id: job.id.clone(),
        status,
        message: payload.message,
        created_at: existing.as_ref().and_then(|v| v.created_at),
        updated_at: existing.as_ref().and_then(|v| v.updated_at),
    };
    if ws.write(record).is_none() {
        return Ok(());
    }
    info!(workspace_id = %ws.id(), job_id = %job.id, passed = payload.passed, "Verification completed");

    if payload.passed || job.is_rollback() {
        return Ok(());
    }
    let Some(release) = ws.stores.releases.get(&job.release_id).cloned() else {
        return Ok(());
    };
    let roll_back = {
        let world = ws.view();
        rollback::triggers_on_verification(&world.policies_for(&release.release_target))
    };
    if roll_back {
        trigger_rollback(ws, &release, &job.id);
    }
    Ok(())
}

fn ensure_job(ws: &Workspace, job_id: &str) -> CoreResult<Job> {
    ws.stores
        .jobs
        .get(job_id)
        .cloned()
        .ok_or_else(|| CoreError::EntityNotFound(format!("job {}", job_id)))
}
