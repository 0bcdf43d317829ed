//! Policy rule payloads

use super::id_equals;
use serde_json::{json, Value};

/// `anyApproval` requiring `min_approvals`
pub fn any_approval(min_approvals: u32) -> Value {
    json!({ "type": "anyApproval", "minApprovals": min_approvals })
}

/// `retry` allowing `max_retries` retries after the first attempt
pub fn retry(max_retries: u32) -> Value {
    json!({ "type": "retry", "maxRetries": max_retries })
}

/// `rollback` on the given job statuses
pub fn rollback(statuses: &[&str]) -> Value {
    json!({ "type": "rollback", "rollBackJobStatuses": statuses })
}

/// `rollback` on failed verification
pub fn rollback_on_verification_failure() -> Value {
    json!({ "type": "rollback", "onVerificationFailure": true })
}

/// `deploymentWindow` allow or deny window
pub fn deployment_window(rrule: &str, duration_minutes: u32, allow: bool) -> Value {
    json!({ "type": "deploymentWindow", "rrule": rrule, "durationMinutes": duration_minutes, "allow": allow })
}

/// `versionCooldown` of `seconds`
pub fn version_cooldown(seconds: u64) -> Value {
    json!({ "type": "versionCooldown", "seconds": seconds })
}

/// `gradualRollout` spacing targets by `interval_seconds`
pub fn gradual_rollout(interval_seconds: u64) -> Value {
    json!({ "type": "gradualRollout", "intervalSeconds": interval_seconds })
}

/// `deploymentDependency` on a deployment by id
pub fn depends_on(deployment_id: &str) -> Value {
    json!({
        "type": "deploymentDependency",
        "dependsOnDeploymentSelector": { "json": id_equals(deployment_id) }
    })
}
