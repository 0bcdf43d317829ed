//! Release planner.
//!
//! For a release target the planner walks the target deployment's `Ready`
//! versions newest first and runs every rule of every applicable policy
//! against each candidate:
//!
//! - a *denied* candidate falls through to the next older version;
//! - a *deferred* candidate stops the scan, the target waits and a scheduler
//!   entry is produced for the latest defer time;
//! - the first candidate every rule allows becomes the desired release.
//!
//! The planner only reads state. Materialising the release and queueing the
//! scheduler entry is up to the caller.

use crate::index::{JobIndex, PolicyTargetIndex, ReleaseTargetIndex};
use crate::relationships::RelationshipIndex;
use crate::state::Stores;
use chrono::{DateTime, Utc};
use rollout_core::{DeploymentVersion, MatchCache, Policy, Release, ReleaseTarget};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Policy rule evaluators
pub mod evaluators;

/// Resource variable resolution
pub mod variables;

/// Outcome of one rule for one candidate version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "camelCase")]
pub enum Decision {
    /// Rule is satisfied
    Allow {
        /// What satisfied the rule, if interesting
        #[serde(default, skip_serializing_if = "Option::is_none")]
        satisfied_by: Option<String>,
    },
    /// Rule rejects the candidate
    Deny {
        /// Why
        reason: String,
    },
    /// Rule may allow the candidate later
    Defer {
        /// Re-evaluate at or after this time
        until: DateTime<Utc>,
        /// Why
        reason: String,
    },
}

impl Decision {
    /// Plain allow
    pub fn allow() -> Self {
        Decision::Allow { satisfied_by: None }
    }

    /// Allow with a diagnostic
    pub fn allow_by(satisfied_by: impl Into<String>) -> Self {
        Decision::Allow { satisfied_by: Some(satisfied_by.into()) }
    }

    /// Deny with a reason
    pub fn deny(reason: impl Into<String>) -> Self {
        Decision::Deny { reason: reason.into() }
    }

    /// Defer until a time
    pub fn defer(until: DateTime<Utc>, reason: impl Into<String>) -> Self {
        Decision::Defer { until, reason: reason.into() }
    }

    /// Whether this is an allow
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }
}

/// A rule decision with its source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDecision {
    /// Policy the rule belongs to; empty for engine-internal checks
    pub policy_id: String,
    /// Rule name
    pub rule: String,
    /// Outcome
    pub decision: Decision,
}

/// All decisions for one candidate version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionEvaluation {
    /// Candidate version
    pub version_id: String,
    /// Candidate tag
    pub tag: String,
    /// Decisions in evaluation order
    pub decisions: Vec<RuleDecision>,
}

/// Planner output for one target
#[derive(Debug, Clone, PartialEq)]
pub struct PlanOutcome {
    /// Planned target
    pub target: ReleaseTarget,
    /// Desired release; `None` when nothing is deployable or the target waits.
    /// A new release has no `createdAt` until it is stored.
    pub desired: Option<Release>,
    /// Latest defer time when the target waits
    pub deferred_until: Option<DateTime<Utc>>,
    /// Reason for the wait
    pub defer_reason: Option<String>,
    /// Per-candidate diagnostics
    pub evaluations: Vec<VersionEvaluation>,
}

/// Read-only view of a workspace handed to the planner and evaluators
#[derive(Clone, Copy)]
pub struct WorldView<'a> {
    /// Entity stores
    pub stores: &'a Stores,
    /// Selector match cache
    pub cache: &'a MatchCache,
    /// Release targets
    pub release_targets: &'a ReleaseTargetIndex,
    /// Policy matchings
    pub policy_targets: &'a PolicyTargetIndex,
    /// Releases and jobs per target
    pub jobs: &'a JobIndex,
    /// Relationship edges
    pub relationships: &'a RelationshipIndex,
    /// Versions blocked per target by rollbacks
    pub rollback_blocks: &'a BTreeMap<String, BTreeSet<String>>,
    /// Evaluation time
    pub now: DateTime<Utc>,
}

impl<'a> WorldView<'a> {
    /// Enabled policies applying to a target, highest priority first
    pub fn policies_for(&self, target: &ReleaseTarget) -> Vec<&'a Policy> {
        let mut policies: Vec<&Policy> = self
            .policy_targets
            .policies_for(&target.key())
            .iter()
            .filter_map(|id| self.stores.policies.get(id))
            .filter(|p| p.enabled)
            .collect();
        policies.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        policies
    }

    fn is_blocked(&self, target: &ReleaseTarget, version: &DeploymentVersion) -> bool {
        self.rollback_blocks
            .get(&target.key())
            .map(|blocked| blocked.contains(&version.id))
            .unwrap_or(false)
    }
}

/// Compute the desired release of a target
pub fn plan(world: &WorldView<'_>, target: &ReleaseTarget) -> PlanOutcome {
    let policies = world.policies_for(target);
    let mut outcome = PlanOutcome {
        target: target.clone(),
        desired: None,
        deferred_until: None,
        defer_reason: None,
        evaluations: Vec::new(),
    };

    for version in world.stores.ready_versions(&target.deployment_id) {
        let mut evaluation = VersionEvaluation {
            version_id: version.id.clone(),
            tag: version.tag.clone(),
            decisions: Vec::new(),
        };

        if world.is_blocked(target, version) {
            evaluation.decisions.push(RuleDecision {
                policy_id: String::new(),
                rule: "rollbackBlock".to_string(),
                decision: Decision::deny("rolled back"),
            });
            outcome.evaluations.push(evaluation);
            continue;
        }

        for policy in &policies {
            for rule in &policy.rules {
                if let Some(decision) = evaluators::evaluate(world, policy, rule, target, version) {
                    evaluation.decisions.push(RuleDecision {
                        policy_id: policy.id.clone(),
                        rule: rule.name().to_string(),
                        decision,
                    });
                }
            }
        }

        let denied = evaluation
            .decisions
            .iter()
            .any(|d| matches!(d.decision, Decision::Deny { .. }));
        let deferred = evaluation
            .decisions
            .iter()
            .filter_map(|d| match &d.decision {
                Decision::Defer { until, reason } => Some((*until, reason.clone())),
                _ => None,
            })
            .max_by_key(|(until, _)| *until);

        outcome.evaluations.push(evaluation);

        if denied {
            continue;
        }
        if let Some((until, reason)) = deferred {
            outcome.deferred_until = Some(until);
            outcome.defer_reason = Some(reason);
            break;
        }

        outcome.desired = Some(materialize(world, target, version));
        break;
    }

    outcome
}

/// Build the release of `version` on `target`, reusing the stored one when
/// the version and resolved variables are unchanged
pub fn materialize(world: &WorldView<'_>, target: &ReleaseTarget, version: &DeploymentVersion) -> Release {
    let variables = variables::resolve(world, &target.resource_id);
    let id = rollout_core::ids::release_id(&target.key(), &version.id, &variables);

    if let Some(existing) = world.stores.releases.get(&id) {
        return existing.clone();
    }

    Release {
        id,
        release_target: target.clone(),
        version: version.clone(),
        variables,
        created_at: None,
        updated_at: None,
    }
}
