use crate::planner::{Decision, WorldView};
use chrono::Duration;
use rollout_core::{DeploymentVersion, JobStatus, ReleaseTarget, VersionCooldownRule};

/// Hold a new version until it is `seconds` old when another version is
/// already deployed or deploying on the target
pub fn evaluate(
    world: &WorldView<'_>,
    rule: &VersionCooldownRule,
    target: &ReleaseTarget,
    version: &DeploymentVersion,
) -> Decision {
    let key = target.key();
    let previous = world
        .jobs
        .releases(world.stores, &key)
        .into_iter()
        .rev()
        .filter(|release| release.version.created_at != version.created_at)
        .find(|release| {
            world
                .jobs
                .jobs_for_release(world.stores, &release.id)
                .iter()
                .any(|job| {
                    matches!(job.status, JobStatus::Successful | JobStatus::InProgress | JobStatus::Pending)
                })
        });

    let Some(previous) = previous else {
        return Decision::allow_by("first deployment");
    };
    if previous.version.id == version.id {
        return Decision::allow_by("already deployed");
    }

    let created = version.created_at.unwrap_or(world.now);
    let ready_at = created + Duration::seconds(rule.seconds.min(i64::MAX as u64) as i64);
    if world.now >= ready_at {
        Decision::allow()
    } else {
        Decision::defer(ready_at, format!("version cooldown of {}s", rule.seconds))
    }
}
