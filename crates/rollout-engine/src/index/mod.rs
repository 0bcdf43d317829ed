//! Derived indexes over the entity stores.
//!
//! None of these are persisted; they are rebuilt from the stores after a
//! snapshot restore and maintained incrementally afterwards.

/// `(deployment, environment, resource)` triples
pub mod release_targets;

/// Policies applying to each release target
pub mod policy_targets;

/// Releases per target and jobs per release
pub mod jobs;

pub use jobs::JobIndex;
pub use policy_targets::PolicyTargetIndex;
pub use release_targets::{ReleaseTargetIndex, TargetDiff};
