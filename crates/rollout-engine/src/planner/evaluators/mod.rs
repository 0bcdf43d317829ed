//! Policy rule evaluators.
//!
//! Each gating rule kind has a pure evaluator taking the target, the candidate
//! version, the rule and a [`WorldView`]. Rollback and retry rules do not gate
//! candidates; the reconciler consults them when creating and reacting to
//! jobs.

use super::{Decision, WorldView};
use rollout_core::{DeploymentVersion, Policy, PolicyRule, ReleaseTarget};

pub mod approval;
pub mod cooldown;
pub mod dependency;
pub mod gradual_rollout;
pub mod retry;
pub mod rollback;
pub mod version_status;
pub mod window;

/// Evaluate one rule for a candidate. Returns `None` for rules that do not
/// gate versions.
pub fn evaluate(
    world: &WorldView<'_>,
    policy: &Policy,
    rule: &PolicyRule,
    target: &ReleaseTarget,
    version: &DeploymentVersion,
) -> Option<Decision> {
    match rule {
        PolicyRule::AnyApproval(rule) => Some(approval::evaluate(world, rule, target, version)),
        PolicyRule::VersionStatus(rule) => Some(version_status::evaluate(rule, version)),
        PolicyRule::VersionCooldown(rule) => Some(cooldown::evaluate(world, rule, target, version)),
        PolicyRule::DeploymentWindow(rule) => Some(window::evaluate(world, rule, target)),
        PolicyRule::DeploymentDependency(rule) => Some(dependency::evaluate(world, rule, target)),
        PolicyRule::GradualRollout(rule) => {
            Some(gradual_rollout::evaluate(world, &policy.id, rule, target, version))
        }
        PolicyRule::Rollback(_) | PolicyRule::Retry(_) => None,
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::index::{JobIndex, PolicyTargetIndex, ReleaseTargetIndex};
    use crate::planner::WorldView;
    use crate::relationships::RelationshipIndex;
    use crate::state::Stores;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use rollout_core::{
        Deployment, DeploymentVersion, Environment, Job, JobStatus, MatchCache, Release,
        ReleaseTarget, Resource, System, VersionStatus,
    };
    use serde_json::json;
    use std::collections::{BTreeMap, BTreeSet};

    pub fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs)
    }

    /// Small world: one system, deployments `api` and `db`, environment
    /// `prod`, resources `r1` and `r2`
    pub struct World {
        pub stores: Stores,
        pub cache: MatchCache,
        pub release_targets: ReleaseTargetIndex,
        pub policy_targets: PolicyTargetIndex,
        pub jobs: JobIndex,
        pub relationships: RelationshipIndex,
        pub blocks: BTreeMap<String, BTreeSet<String>>,
    }

    impl World {
        pub fn new() -> Self {
            let mut stores = Stores::default();
            stores.systems.upsert(
                System { id: "sys".into(), workspace_id: "ws".into(), name: "sys".into(), description: None, created_at: None, updated_at: None },
                t(0),
            );
            for id in ["api", "db"] {
                stores.deployments.upsert(
                    Deployment {
                        id: id.into(),
                        system_id: "sys".into(),
                        name: id.into(),
                        slug: id.into(),
                        description: None,
                        job_agent_id: Some("agent".into()),
                        job_agent_config: json!({}),
                        resource_selector: None,
                        created_at: None,
                        updated_at: None,
                    },
                    t(0),
                );
            }
            stores.environments.upsert(
                Environment { id: "prod".into(), system_id: "sys".into(), name: "prod".into(), description: None, resource_selector: None, created_at: None, updated_at: None },
                t(0),
            );
            for id in ["r1", "r2"] {
                stores.resources.upsert(
                    Resource {
                        id: id.into(),
                        workspace_id: "ws".into(),
                        provider_id: None,
                        identifier: id.into(),
                        name: id.into(),
                        kind: "Cluster".into(),
                        version: "v1".into(),
                        metadata: BTreeMap::new(),
                        config: json!({}),
                        created_at: None,
                        updated_at: None,
                    },
                    t(0),
                );
            }
            let cache = MatchCache::new(256);
            let mut release_targets = ReleaseTargetIndex::new();
            release_targets.rebuild(&stores, &cache);
            Self {
                stores,
                cache,
                release_targets,
                policy_targets: PolicyTargetIndex::default(),
                jobs: JobIndex::default(),
                relationships: RelationshipIndex::default(),
                blocks: BTreeMap::new(),
            }
        }

        pub fn version(&mut self, deployment: &str, id: &str, created: DateTime<Utc>) -> DeploymentVersion {
            let version = DeploymentVersion {
                id: id.into(),
                deployment_id: deployment.into(),
                tag: id.into(),
                name: id.into(),
                status: VersionStatus::Ready,
                config: json!({}),
                job_agent_config: json!({}),
                message: None,
                created_at: Some(created),
                updated_at: None,
            };
            self.stores.deployment_versions.upsert(version.clone(), created);
            version
        }

        /// Store a release of `version` on `target` with one job in `status`
        pub fn deployed(&mut self, target: &ReleaseTarget, version: &DeploymentVersion, status: JobStatus, at: DateTime<Utc>) -> Release {
            let release = Release {
                id: format!("{}@{}", target.key(), version.id),
                release_target: target.clone(),
                version: version.clone(),
                variables: BTreeMap::new(),
                created_at: Some(at),
                updated_at: None,
            };
            self.stores.releases.upsert(release.clone(), at);
            let job = Job {
                id: format!("job-{}-{}", release.id, self.stores.jobs.len()),
                release_id: release.id.clone(),
                job_agent_id: "agent".into(),
                job_agent_config: json!({}),
                status,
                external_id: None,
                message: None,
                metadata: BTreeMap::new(),
                created_at: Some(at),
                updated_at: None,
                started_at: None,
                completed_at: None,
            };
            self.stores.jobs.upsert(job, at);
            self.jobs = JobIndex::rebuild(&self.stores);
            release
        }

        pub fn refresh_policies(&mut self) {
            self.policy_targets
                .rebuild(&self.stores, &self.cache, self.release_targets.items().values());
        }

        pub fn view(&self, now: DateTime<Utc>) -> WorldView<'_> {
            WorldView {
                stores: &self.stores,
                cache: &self.cache,
                release_targets: &self.release_targets,
                policy_targets: &self.policy_targets,
                jobs: &self.jobs,
                relationships: &self.relationships,
                rollback_blocks: &self.blocks,
                now,
            }
        }
    }

    pub fn target(deployment: &str, resource: &str) -> ReleaseTarget {
        ReleaseTarget::new(deployment, "prod", resource)
    }
}
