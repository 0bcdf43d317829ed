use crate::planner::{Decision, WorldView};
use rollout_core::{AnyApprovalRule, ApprovalStatus, DeploymentVersion, ReleaseTarget};

/// Allow once enough users approved the version in the target's environment
pub fn evaluate(
    world: &WorldView<'_>,
    rule: &AnyApprovalRule,
    target: &ReleaseTarget,
    version: &DeploymentVersion,
) -> Decision {
    let approvals = world
        .stores
        .user_approval_records
        .values()
        .filter(|record| record.version_id == version.id)
        .filter(|record| record.environment_id == target.environment_id)
        .filter(|record| record.status == ApprovalStatus::Approved)
        .count();

    if approvals >= rule.min_approvals as usize {
        Decision::allow_by(format!("{} approvals", approvals))
    } else {
        Decision::deny(format!("{} of {} required approvals", approvals, rule.min_approvals))
    }
}
