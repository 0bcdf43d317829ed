use crate::planner::{Decision, WorldView};
use rollout_core::{DeploymentDependencyRule, ReleaseTarget};

/// Allow only when every dependency deployment has a successful release on
/// the same environment and resource.
///
/// Dependencies are the deployments matched by the selector, excluding the
/// target's own deployment. A dependency without a release target on the
/// same environment and resource does not block.
pub fn evaluate(world: &WorldView<'_>, rule: &DeploymentDependencyRule, target: &ReleaseTarget) -> Decision {
    for deployment in world.stores.deployments.values() {
        if deployment.id == target.deployment_id {
            continue;
        }
        match world.cache.matches(&rule.depends_on_deployment_selector, deployment) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => return Decision::deny(format!("dependency selector failed: {}", e)),
        }

        let dependency = ReleaseTarget::new(&deployment.id, &target.environment_id, &target.resource_id);
        let key = dependency.key();
        if !world.release_targets.contains(&key) {
            continue;
        }
        if !world.jobs.has_successful_release(world.stores, &key) {
            return Decision::deny(format!("waiting for dependency {}", deployment.name));
        }
    }
    Decision::allow()
}
