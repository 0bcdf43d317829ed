//! Policies and the rule union evaluated by the planner.
//!
//! Rules are an internally tagged union on `type`; an unknown tag fails to
//! decode, which rejects the whole policy event.

use crate::domain::entities::VersionStatus;
use crate::domain::entity::EntityKind;
use crate::domain::job::JobStatus;
use crate::impl_entity;
use crate::selector::Selector;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_required_statuses() -> Vec<VersionStatus> {
    vec![VersionStatus::Ready]
}

/// Selector triple a policy uses to pick release targets.
///
/// A missing component matches everything on that axis.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyTargetSelector {
    /// Optional identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Deployment axis
    #[serde(default)]
    pub deployment_selector: Option<Selector>,
    /// Environment axis
    #[serde(default)]
    pub environment_selector: Option<Selector>,
    /// Resource axis
    #[serde(default)]
    pub resource_selector: Option<Selector>,
}

/// Require a minimum number of approvals for the version in the environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnyApprovalRule {
    /// Approvals required
    pub min_approvals: u32,
}

/// Roll back to the previous successful release on failure
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackRule {
    /// Job statuses that trigger a rollback
    #[serde(default)]
    pub roll_back_job_statuses: Option<Vec<JobStatus>>,
    /// Whether a failed verification triggers a rollback
    #[serde(default)]
    pub on_verification_failure: Option<bool>,
}

/// Limit the number of attempts per release
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryRule {
    /// Retries allowed after the first attempt
    pub max_retries: u32,
    /// Extra statuses that consume an attempt
    #[serde(default)]
    pub retry_on: Option<Vec<JobStatus>>,
}

/// Allow or deny deployments inside recurring windows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentWindowRule {
    /// RFC 5545 recurrence rule, optionally preceded by a `DTSTART` line
    pub rrule: String,
    /// Length of each occurrence
    pub duration_minutes: u32,
    /// `true` for allow windows, `false` for deny windows
    #[serde(default = "default_true")]
    pub allow: bool,
}

/// Minimum age of a version before it replaces a running one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionCooldownRule {
    /// Cooldown in seconds
    pub seconds: u64,
}

/// Require other deployments to be successfully released first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentDependencyRule {
    /// Deployments this one depends on
    pub depends_on_deployment_selector: Selector,
}

/// Spread a version over matching targets one interval at a time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradualRolloutRule {
    /// Seconds between consecutive target releases
    pub interval_seconds: u64,
}

/// Only deploy versions in one of the given statuses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionStatusRule {
    /// Allowed statuses
    #[serde(default = "default_required_statuses")]
    pub required_statuses: Vec<VersionStatus>,
}

/// A policy rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PolicyRule {
    /// Approval gate
    AnyApproval(AnyApprovalRule),
    /// Rollback trigger
    Rollback(RollbackRule),
    /// Attempt limiter
    Retry(RetryRule),
    /// Recurring window
    DeploymentWindow(DeploymentWindowRule),
    /// Version cooldown
    VersionCooldown(VersionCooldownRule),
    /// Cross-deployment dependency
    DeploymentDependency(DeploymentDependencyRule),
    /// Gradual rollout
    GradualRollout(GradualRolloutRule),
    /// Version status gate
    VersionStatus(VersionStatusRule),
}

impl PolicyRule {
    /// Short name used in logs and decision reasons
    pub fn name(&self) -> &'static str {
        match self {
            PolicyRule::AnyApproval(_) => "anyApproval",
            PolicyRule::Rollback(_) => "rollback",
            PolicyRule::Retry(_) => "retry",
            PolicyRule::DeploymentWindow(_) => "deploymentWindow",
            PolicyRule::VersionCooldown(_) => "versionCooldown",
            PolicyRule::DeploymentDependency(_) => "deploymentDependency",
            PolicyRule::GradualRollout(_) => "gradualRollout",
            PolicyRule::VersionStatus(_) => "versionStatus",
        }
    }

    /// Whether a successful job should be followed by a verification run
    pub fn requests_verification(&self) -> bool {
        matches!(
            self,
            PolicyRule::Rollback(RollbackRule { on_verification_failure: Some(true), .. })
        )
    }
}

/// Aggregate: a policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    /// Unique identifier
    pub id: String,
    /// Owning workspace
    #[serde(default)]
    pub workspace_id: String,
    /// Display name
    pub name: String,
    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Disabled policies never apply
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Higher priorities are evaluated first
    #[serde(default)]
    pub priority: i32,
    /// Target selectors; any matching triple applies the policy
    #[serde(default)]
    pub selectors: Vec<PolicyTargetSelector>,
    /// Rules
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    /// Creation timestamp
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Last update timestamp
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl_entity!(Policy, EntityKind::Policy);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rule_tagging() {
        let policy: Policy = serde_json::from_value(json!({
            "id": "p1",
            "name": "gates",
            "selectors": [{}],
            "rules": [
                { "type": "anyApproval", "minApprovals": 2 },
                { "type": "versionCooldown", "seconds": 3600 },
                { "type": "deploymentWindow", "rrule": "FREQ=DAILY", "durationMinutes": 60 },
                { "type": "versionStatus" },
                { "type": "rollback", "rollBackJobStatuses": ["failure"] }
            ]
        }))
        .unwrap();

        assert!(policy.enabled);
        assert_eq!(policy.rules.len(), 5);
        assert_eq!(policy.rules[0], PolicyRule::AnyApproval(AnyApprovalRule { min_approvals: 2 }));
        match &policy.rules[2] {
            PolicyRule::DeploymentWindow(rule) => assert!(rule.allow),
            other => panic!("unexpected rule {:?}", other),
        }
        match &policy.rules[3] {
            PolicyRule::VersionStatus(rule) => {
                assert_eq!(rule.required_statuses, vec![VersionStatus::Ready])
            }
            other => panic!("unexpected rule {:?}", other),
        }
    }

    #[test]
    fn test_unknown_rule_is_rejected() {
        let result = serde_json::from_value::<Policy>(json!({
            "id": "p1",
            "name": "gates",
            "rules": [{ "type": "teleport", "distance": 3 }]
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_requests_verification() {
        let rule = PolicyRule::Rollback(RollbackRule {
            roll_back_job_statuses: None,
            on_verification_failure: Some(true),
        });
        assert!(rule.requests_verification());
        assert!(!PolicyRule::Retry(RetryRule { max_retries: 1, retry_on: None }).requests_verification());
    }
}
