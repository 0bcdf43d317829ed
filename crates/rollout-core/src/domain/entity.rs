use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind tag for every entity a workspace stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityKind {
    /// Organisational grouping
    System,
    /// Unit of software
    Deployment,
    /// Deployment target scope
    Environment,
    /// Deployable-to infrastructure
    Resource,
    /// Source of truth for a subset of resources
    ResourceProvider,
    /// A built version of a deployment
    DeploymentVersion,
    /// Dispatch target for jobs
    JobAgent,
    /// Policy with target selectors and rules
    Policy,
    /// User approval of a version in an environment
    UserApprovalRecord,
    /// Rule producing relationship edges
    RelationshipRule,
    /// Variable attached to a resource
    ResourceVariable,
    /// Immutable release decision
    Release,
    /// Deployment attempt
    Job,
    /// Post-deploy verification
    JobVerification,
}

impl EntityKind {
    /// Wire name of the kind, as used in event types
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::System => "system",
            EntityKind::Deployment => "deployment",
            EntityKind::Environment => "environment",
            EntityKind::Resource => "resource",
            EntityKind::ResourceProvider => "resource-provider",
            EntityKind::DeploymentVersion => "deployment-version",
            EntityKind::JobAgent => "job-agent",
            EntityKind::Policy => "policy",
            EntityKind::UserApprovalRecord => "user-approval-record",
            EntityKind::RelationshipRule => "relationship-rule",
            EntityKind::ResourceVariable => "resource-variable",
            EntityKind::Release => "release",
            EntityKind::Job => "job",
            EntityKind::JobVerification => "job-verification",
        }
    }

    /// Name the entity is bound under in selector expressions
    pub fn binding_name(&self) -> &'static str {
        match self {
            EntityKind::DeploymentVersion => "version",
            EntityKind::ResourceProvider => "provider",
            EntityKind::JobAgent => "agent",
            EntityKind::UserApprovalRecord => "approval",
            EntityKind::RelationshipRule => "rule",
            EntityKind::ResourceVariable => "variable",
            EntityKind::JobVerification => "verification",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A keyed, timestamped workspace entity.
///
/// Timestamps are owned by the store: `created_at` is set on first insert if the
/// payload did not carry one, `updated_at` is bumped on every content change and
/// left alone on no-op writes. The selector match cache keys on
/// [`Entity::cache_stamp`], so a writer that bypasses the store produces stale
/// matches.
pub trait Entity: Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Kind tag of this entity type
    const KIND: EntityKind;

    /// Stable identifier within the workspace
    fn id(&self) -> &str;

    /// Creation timestamp
    fn created_at(&self) -> Option<DateTime<Utc>>;

    /// Last content change
    fn updated_at(&self) -> Option<DateTime<Utc>>;

    /// Overwrite both timestamps
    fn set_timestamps(&mut self, created_at: Option<DateTime<Utc>>, updated_at: Option<DateTime<Utc>>);

    /// `updated_at ?? created_at` in nanoseconds since the epoch, 0 if unset
    fn cache_stamp(&self) -> i64 {
        self.updated_at()
            .or_else(|| self.created_at())
            .and_then(|ts| ts.timestamp_nanos_opt())
            .unwrap_or(0)
    }

    /// Equality ignoring the store-managed timestamps
    fn content_eq(&self, other: &Self) -> bool {
        let mut left = self.clone();
        let mut right = other.clone();
        left.set_timestamps(None, None);
        right.set_timestamps(None, None);
        left == right
    }
}

/// Implements [`Entity`] for a struct with `id`, `created_at` and `updated_at`
/// fields of the usual shapes.
#[macro_export]
macro_rules! impl_entity {
    ($ty:ty, $kind:expr) => {
        impl $crate::domain::entity::Entity for $ty {
            const KIND: $crate::domain::entity::EntityKind = $kind;

            fn id(&self) -> &str {
                &self.id
            }

            fn created_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
                self.created_at
            }

            fn updated_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
                self.updated_at
            }

            fn set_timestamps(
                &mut self,
                created_at: Option<chrono::DateTime<chrono::Utc>>,
                updated_at: Option<chrono::DateTime<chrono::Utc>>,
            ) {
                self.created_at = created_at;
                self.updated_at = updated_at;
            }
        }
    };
}
