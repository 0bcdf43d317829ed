use crate::planner::Decision;
use rollout_core::{DeploymentVersion, VersionStatusRule};

/// Allow versions whose status is one of the required statuses
pub fn evaluate(rule: &VersionStatusRule, version: &DeploymentVersion) -> Decision {
    if rule.required_statuses.contains(&version.status) {
        Decision::allow()
    } else {
        Decision::deny(format!("version status {:?} not allowed", version.status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::evaluators::fixtures::{t, World};
    use rollout_core::VersionStatus;

    #[test]
    fn test_status_gate() {
        let mut world = World::new();
        let mut version = world.version("api", "v1", t(0));
        let rule = VersionStatusRule { required_statuses: vec![VersionStatus::Ready] };
        assert!(evaluate(&rule, &version).is_allow());

        version.status = VersionStatus::Building;
        assert!(!evaluate(&rule, &version).is_allow());
    }
}
