use crate::planner::WorldView;
use rollout_core::{JobStatus, Policy, PolicyRule, Release};

/// Whether a job ending in `status` should trigger a rollback
pub fn triggers_on_status(policies: &[&Policy], status: JobStatus) -> bool {
    policies.iter().flat_map(|policy| policy.rules.iter()).any(|rule| match rule {
        PolicyRule::Rollback(rule) => rule
            .roll_back_job_statuses
            .as_ref()
            .map(|statuses| statuses.contains(&status))
            .unwrap_or(false),
        _ => false,
    })
}

/// Whether a failed verification should trigger a rollback
pub fn triggers_on_verification(policies: &[&Policy]) -> bool {
    policies
        .iter()
        .flat_map(|policy| policy.rules.iter())
        .any(PolicyRule::requests_verification)
}

/// Release to roll back to: the most recent successfully deployed release of
/// the target whose version differs from the failed one
pub fn rollback_release<'a>(world: &WorldView<'a>, target_key: &str, failed: &Release) -> Option<&'a Release> {
    world
        .jobs
        .jobs_for_target(world.stores, target_key)
        .into_iter()
        .rev()
        .filter(|job| job.status == JobStatus::Successful)
        .filter_map(|job| world.stores.releases.get(&job.release_id))
        .find(|release| release.version.id != failed.version.id)
}
