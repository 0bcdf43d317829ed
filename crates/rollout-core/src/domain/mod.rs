/// Entity trait and kind tags
pub mod entity;

/// Workspace entities (systems, deployments, environments, resources...)
pub mod entities;

/// Jobs and job verifications
pub mod job;

/// Policies and the policy rule union
pub mod policy;

/// Relationship rules and derived edges
pub mod relationship;

/// Release targets and releases
pub mod release;

/// Event envelope, inbound event kinds and outbound events
pub mod events;
