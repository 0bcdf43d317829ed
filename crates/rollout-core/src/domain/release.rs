use crate::domain::entities::DeploymentVersion;
use crate::domain::entity::EntityKind;
use crate::domain::job::Job;
use crate::impl_entity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// A `(deployment, environment, resource)` triple a version can run on
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseTarget {
    /// Deployment
    pub deployment_id: String,
    /// Environment
    pub environment_id: String,
    /// Resource
    pub resource_id: String,
}

impl ReleaseTarget {
    /// Build a target
    pub fn new(
        deployment_id: impl Into<String>,
        environment_id: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            environment_id: environment_id.into(),
            resource_id: resource_id.into(),
        }
    }

    /// Index key: `deploymentId|environmentId|resourceId`
    pub fn key(&self) -> String {
        format!("{}|{}|{}", self.deployment_id, self.environment_id, self.resource_id)
    }
}

impl fmt::Display for ReleaseTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Immutable decision that a version should run on a release target.
///
/// The version is copied in at creation time so later edits to the version
/// do not rewrite history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    /// Deterministic identifier
    pub id: String,
    /// Target the release was planned for
    pub release_target: ReleaseTarget,
    /// Version snapshot
    pub version: DeploymentVersion,
    /// Resolved resource variables
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    /// Creation timestamp
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Always `None`; releases are never updated
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl_entity!(Release, EntityKind::Release);

impl Release {
    /// Key of the target this release was planned for
    pub fn release_target_key(&self) -> String {
        self.release_target.key()
    }
}

/// Current, desired and latest-job view of a release target
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseTargetState {
    /// Release of the most recent successful job
    pub current_release: Option<Release>,
    /// Planner output
    pub desired_release: Option<Release>,
    /// Most recently created job of any release of the target
    pub latest_job: Option<Job>,
}
