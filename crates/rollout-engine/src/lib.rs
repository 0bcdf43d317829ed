//!
//! Rollout Engine - per-workspace deployment state engine
//!
//! A [`Workspace`] holds one tenant's entity stores and everything derived
//! from them: release targets, policy matchings, relationships, the plan
//! cache and the deferred-evaluation scheduler. Events are applied with
//! [`Workspace::apply`], which routes them to a handler, reconciles the
//! affected release targets and returns the jobs and other side effects to
//! publish. The engine is synchronous; the server crate wraps workspaces in
//! the [`WorkspaceRegistry`] and drives them from the partitioned log.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Wall-clock abstraction
pub mod clock;

/// Engine settings
pub mod config;

/// Typed entity stores
pub mod store;

/// The set of stores making up a workspace
pub mod state;

/// Derived indexes
pub mod index;

/// Relationship engine
pub mod relationships;

/// Deferred re-evaluation queue
pub mod scheduler;

/// Release planning and policy evaluators
pub mod planner;

/// Reconciliation loop
pub mod reconciler;

/// Workspace state
pub mod workspace;

/// Event routing
pub mod router;

/// Workspace registry
pub mod registry;

/// Snapshot codec
pub mod snapshot;

mod handlers;
mod verification;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use planner::{Decision, PlanOutcome, RuleDecision, VersionEvaluation};
pub use reconciler::ReconcileReport;
pub use registry::{WorkspaceHandle, WorkspaceRegistry};
pub use router::ApplyOutcome;
pub use scheduler::ScheduledEntry;
pub use state::Stores;
pub use store::{Change, ChangeKind, Store};
pub use workspace::{ApplyMode, Workspace};
