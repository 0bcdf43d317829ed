//! Workspace entities.
//!
//! Foreign keys are plain ids; nothing here holds a reference to another
//! entity, so dangling references (a release whose target is gone, a job whose
//! deployment was deleted) are representable and resolved at lookup time.

use crate::domain::entity::EntityKind;
use crate::impl_entity;
use crate::selector::Selector;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub(crate) fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Organisational grouping that owns deployments and environments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct System {
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
    /// Creation timestamp
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Last update timestamp
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl_entity!(System, EntityKind::System);

/// A unit of software with an associated job agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    /// Unique identifier
    pub id: String,
    /// Owning system
    pub system_id: String,
    /// Display name
    pub name: String,
    /// URL-safe name
    #[serde(default)]
    pub slug: String,
    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Agent jobs are dispatched to; no jobs are created while unset
    #[serde(default)]
    pub job_agent_id: Option<String>,
    /// Deployment-level agent configuration
    #[serde(default = "empty_object")]
    pub job_agent_config: Value,
    /// Resources this deployment may run on; `None` matches everything
    #[serde(default)]
    pub resource_selector: Option<Selector>,
    /// Creation timestamp
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Last update timestamp
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl_entity!(Deployment, EntityKind::Deployment);

/// A deployment target scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    /// Unique identifier
    pub id: String,
    /// Owning system
    pub system_id: String,
    /// Display name
    pub name: String,
    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Resources in this environment; `None` matches everything
    #[serde(default)]
    pub resource_selector: Option<Selector>,
    /// Creation timestamp
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Last update timestamp
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl_entity!(Environment, EntityKind::Environment);

/// A deployable-to piece of infrastructure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    /// Unique identifier
    pub id: String,
    /// Owning workspace
    #[serde(default)]
    pub workspace_id: String,
    /// Owning provider; once set only that provider may mutate the resource
    #[serde(default)]
    pub provider_id: Option<String>,
    /// Unique per workspace
    pub identifier: String,
    /// Display name
    pub name: String,
    /// Resource kind (e.g. `Kubernetes/Cluster`)
    #[serde(default)]
    pub kind: String,
    /// Schema version of the resource
    #[serde(default)]
    pub version: String,
    /// String labels
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Arbitrary configuration
    #[serde(default = "empty_object")]
    pub config: Value,
    /// Creation timestamp
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Last update timestamp
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl_entity!(Resource, EntityKind::Resource);

/// Source of truth for a subset of resources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceProvider {
    /// Unique identifier
    pub id: String,
    /// Owning workspace
    #[serde(default)]
    pub workspace_id: String,
    /// Display name
    pub name: String,
    /// Creation timestamp
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Last update timestamp
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl_entity!(ResourceProvider, EntityKind::ResourceProvider);

/// Build status of a deployment version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    /// Deployable
    #[default]
    Ready,
    /// Still building
    Building,
    /// Build failed
    Failed,
    /// Rejected by a user
    Rejected,
}

/// A built version of a deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentVersion {
    /// Unique identifier
    pub id: String,
    /// Deployment this version belongs to
    pub deployment_id: String,
    /// Version tag (e.g. `v1.2.0`)
    pub tag: String,
    /// Display name, defaults to the tag
    #[serde(default)]
    pub name: String,
    /// Build status
    #[serde(default)]
    pub status: VersionStatus,
    /// Arbitrary version configuration
    #[serde(default = "empty_object")]
    pub config: Value,
    /// Version-level agent configuration, merged last
    #[serde(default = "empty_object")]
    pub job_agent_config: Value,
    /// Optional status message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Creation timestamp; orders candidate versions
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Last update timestamp
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl_entity!(DeploymentVersion, EntityKind::DeploymentVersion);

/// Dispatch target for jobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAgent {
    /// Unique identifier
    pub id: String,
    /// Owning workspace
    #[serde(default)]
    pub workspace_id: String,
    /// Display name
    pub name: String,
    /// Adapter type (e.g. `github-app`, `kubernetes-job`)
    #[serde(rename = "type", default)]
    pub agent_type: String,
    /// Agent-level configuration, merged first
    #[serde(default = "empty_object")]
    pub config: Value,
    /// Creation timestamp
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Last update timestamp
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl_entity!(JobAgent, EntityKind::JobAgent);

/// Outcome of a user approval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    /// Approved
    #[default]
    Approved,
    /// Rejected
    Rejected,
}

/// A user's approval of a version in an environment.
///
/// Records are keyed by `(versionId, environmentId, userId)`; a second record
/// from the same user replaces the first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserApprovalRecord {
    /// Derived key, see [`UserApprovalRecord::key`]
    #[serde(default)]
    pub id: String,
    /// Approved version
    pub version_id: String,
    /// Environment the approval applies to
    pub environment_id: String,
    /// Approving user
    pub user_id: String,
    /// Approval outcome
    #[serde(default)]
    pub status: ApprovalStatus,
    /// Optional reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Creation timestamp
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Last update timestamp
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl_entity!(UserApprovalRecord, EntityKind::UserApprovalRecord);

impl UserApprovalRecord {
    /// Store key for a version, environment and user
    pub fn key(version_id: &str, environment_id: &str, user_id: &str) -> String {
        format!("{}|{}|{}", version_id, environment_id, user_id)
    }

    /// Replace the id with the derived key
    pub fn normalized(mut self) -> Self {
        self.id = Self::key(&self.version_id, &self.environment_id, &self.user_id);
        self
    }
}

/// Value of a resource variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum VariableValue {
    /// A literal value
    Literal {
        /// The value
        value: Value,
        /// Whether the value must be masked in logs
        #[serde(default)]
        sensitive: bool,
    },
    /// A value read from a related entity
    Reference {
        /// Relationship rule reference name
        reference: String,
        /// Property path on the related entity
        #[serde(default)]
        path: Vec<String>,
    },
}

/// Variable attached to a resource, materialised into releases
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceVariable {
    /// Derived key, see [`ResourceVariable::key_for`]
    #[serde(default)]
    pub id: String,
    /// Resource the variable belongs to
    pub resource_id: String,
    /// Variable name
    pub key: String,
    /// Literal or reference value
    pub value: VariableValue,
    /// Creation timestamp
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Last update timestamp
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl_entity!(ResourceVariable, EntityKind::ResourceVariable);

impl ResourceVariable {
    /// Store key for a resource and variable name
    pub fn key_for(resource_id: &str, key: &str) -> String {
        format!("{}|{}", resource_id, key)
    }

    /// Replace the id with the derived key
    pub fn normalized(mut self) -> Self {
        self.id = Self::key_for(&self.resource_id, &self.key);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entity::Entity;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_deployment_defaults() {
        let deployment: Deployment = serde_json::from_value(json!({
            "id": "d1",
            "systemId": "s1",
            "name": "api"
        }))
        .unwrap();

        assert_eq!(deployment.job_agent_id, None);
        assert_eq!(deployment.job_agent_config, json!({}));
        assert!(deployment.resource_selector.is_none());
        assert!(deployment.created_at.is_none());
    }

    #[test]
    fn test_content_eq_ignores_timestamps() {
        let mut a = Resource {
            id: "r1".into(),
            workspace_id: "w".into(),
            provider_id: None,
            identifier: "r1".into(),
            name: "r1".into(),
            kind: "Kubernetes/Cluster".into(),
            version: "v1".into(),
            metadata: BTreeMap::new(),
            config: json!({}),
            created_at: None,
            updated_at: None,
        };
        let mut b = a.clone();
        b.set_timestamps(Some(Utc.timestamp_opt(10, 0).unwrap()), None);
        assert!(a.content_eq(&b));

        a.metadata.insert("env".into(), "prod".into());
        assert!(!a.content_eq(&b));
    }

    #[test]
    fn test_cache_stamp_prefers_updated_at() {
        let created = Utc.timestamp_opt(1, 0).unwrap();
        let updated = Utc.timestamp_opt(2, 5).unwrap();
        let mut system = System {
            id: "s".into(),
            workspace_id: "w".into(),
            name: "s".into(),
            description: None,
            created_at: Some(created),
            updated_at: None,
        };
        assert_eq!(system.cache_stamp(), 1_000_000_000);
        system.updated_at = Some(updated);
        assert_eq!(system.cache_stamp(), 2_000_000_005);
    }

    #[test]
    fn test_variable_value_tagging() {
        let literal: VariableValue =
            serde_json::from_value(json!({"type": "literal", "value": 3})).unwrap();
        assert_eq!(literal, VariableValue::Literal { value: json!(3), sensitive: false });

        let reference: VariableValue = serde_json::from_value(json!({
            "type": "reference",
            "reference": "vpc",
            "path": ["metadata", "region"]
        }))
        .unwrap();
        assert!(matches!(reference, VariableValue::Reference { ref reference, .. } if reference == "vpc"));
    }

    #[test]
    fn test_derived_keys() {
        let record: UserApprovalRecord = serde_json::from_value(json!({
            "versionId": "v1",
            "environmentId": "e1",
            "userId": "u1"
        }))
        .unwrap();
        let record = record.normalized();
        assert_eq!(record.id, "v1|e1|u1");
        assert_eq!(record.status, ApprovalStatus::Approved);
        assert_eq!(ResourceVariable::key_for("r1", "region"), "r1|region");
    }
}
