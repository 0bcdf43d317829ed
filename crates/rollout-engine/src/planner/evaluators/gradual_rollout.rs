use crate::planner::{Decision, WorldView};
use chrono::Duration;
use rollout_core::{DeploymentVersion, GradualRolloutRule, ReleaseTarget};
use std::collections::BTreeSet;

/// Release a version to the policy's targets one interval apart.
///
/// Only the policy's targets of the version's deployment take part, ordered
/// by key. The rollout starts when the version is first released to any of
/// them, or at the version's creation before that; target `i` may receive
/// the version at `start + i * interval`.
pub fn evaluate(
    world: &WorldView<'_>,
    policy_id: &str,
    rule: &GradualRolloutRule,
    target: &ReleaseTarget,
    version: &DeploymentVersion,
) -> Decision {
    let key = target.key();
    let targets: BTreeSet<String> = world
        .policy_targets
        .targets_for_policy(policy_id)
        .into_iter()
        .filter(|k| {
            world
                .release_targets
                .get(k)
                .map_or(false, |t| t.deployment_id == version.deployment_id)
        })
        .collect();
    let Some(position) = targets.iter().position(|k| *k == key) else {
        return Decision::allow();
    };

    let releases_of_version: Vec<_> = world
        .stores
        .releases
        .values()
        .filter(|release| release.version.id == version.id)
        .filter(|release| targets.contains(&release.release_target_key()))
        .collect();

    if releases_of_version.iter().any(|release| release.release_target_key() == key) {
        return Decision::allow_by("already released");
    }

    let start = releases_of_version
        .iter()
        .filter_map(|release| release.created_at)
        .min()
        .or(version.created_at)
        .unwrap_or(world.now);
    let offset = i64::try_from(rule.interval_seconds)
        .unwrap_or(i64::MAX)
        .saturating_mul(position as i64);
    let allowed_at = start + Duration::seconds(offset);

    if world.now >= allowed_at {
        Decision::allow_by(format!("rollout position {}", position))
    } else {
        Decision::defer(allowed_at, format!("gradual rollout position {}", position))
    }
}
