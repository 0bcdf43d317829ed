//!
//! Rollout Core - domain model for the workspace deployment engine
//!
//! This crate defines the entities a workspace holds (systems, deployments,
//! environments, resources, versions, policies, releases and jobs), the event
//! envelope that mutates them, and the selector language used to decide which
//! resources a deployment, environment or policy applies to. It performs no
//! I/O; the engine and server crates build on top of it.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - entities, events and policy rules
pub mod domain;

/// Selector compilation, matching and the match cache
pub mod selector;

/// Recurrence rules used by deployment windows
pub mod recurrence;

/// Deterministic ids for releases and jobs
pub mod ids;

/// Error types
pub mod error;

// Re-export key types
pub use error::{CoreError, CoreResult};

pub use domain::entity::{Entity, EntityKind};
pub use domain::entities::{
    ApprovalStatus, Deployment, DeploymentVersion, Environment, JobAgent, Resource,
    ResourceProvider, ResourceVariable, System, UserApprovalRecord, VariableValue, VersionStatus,
};
pub use domain::events::{
    EntityAction, EntityRef, EventEnvelope, EventType, OutboundEvent, SetResourcesPayload,
    VerificationCompletedPayload, VerificationStartedPayload,
};
pub use domain::job::{
    Job, JobPatch, JobPatchValues, JobStatus, JobUpdateField, JobVerification, VerificationStatus,
    ROLLBACK_METADATA_KEY,
};
pub use domain::policy::{
    AnyApprovalRule, DeploymentDependencyRule, DeploymentWindowRule, GradualRolloutRule, Policy,
    PolicyRule, PolicyTargetSelector, RetryRule, RollbackRule, VersionCooldownRule,
    VersionStatusRule,
};
pub use domain::relationship::{
    EntityHandle, EntityRelation, PropertyMatcher, PropertyOperator, RelatableKind,
    RelationshipMatcher, RelationshipRule,
};
pub use domain::release::{Release, ReleaseTarget, ReleaseTargetState};
pub use recurrence::{Occurrence, RecurrenceRule};
pub use selector::{MatchCache, MatchCacheStats, Matchable, Selector};
