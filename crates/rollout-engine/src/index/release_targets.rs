use crate::state::Stores;
use rollout_core::{Deployment, Environment, MatchCache, ReleaseTarget, Resource, Selector};
use std::collections::BTreeMap;
use tracing::warn;

/// Targets that appeared or disappeared during a refresh
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetDiff {
    /// New targets
    pub added: Vec<ReleaseTarget>,
    /// Targets that no longer exist
    pub removed: Vec<ReleaseTarget>,
}

impl TargetDiff {
    /// Whether nothing changed
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    fn extend(&mut self, other: TargetDiff) {
        self.added.extend(other.added);
        self.removed.extend(other.removed);
    }
}

/// Whether a deployment/environment pair can target a resource.
///
/// The deployment and environment must share a system, and both resource
/// selectors must match (a missing selector matches everything). Selector
/// errors count as no match.
pub fn triple_matches(
    cache: &MatchCache,
    deployment: &Deployment,
    environment: &Environment,
    resource: &Resource,
) -> bool {
    if deployment.system_id != environment.system_id {
        return false;
    }

    let check = |selector: Option<&Selector>, owner: &str| match cache.matches_optional(selector, resource) {
        Ok(matched) => matched,
        Err(e) => {
            warn!(owner = %owner, resource_id = %resource.id, error = %e, "Selector evaluation failed");
            false
        }
    };

    check(deployment.resource_selector.as_ref(), &deployment.id)
        && check(environment.resource_selector.as_ref(), &environment.id)
}

/// Incrementally maintained set of release targets keyed by
/// `deploymentId|environmentId|resourceId`
#[derive(Debug, Clone, Default)]
pub struct ReleaseTargetIndex {
    targets: BTreeMap<String, ReleaseTarget>,
}

impl ReleaseTargetIndex {
    /// Empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Target by key
    pub fn get(&self, key: &str) -> Option<&ReleaseTarget> {
        self.targets.get(key)
    }

    /// Whether a target exists
    pub fn contains(&self, key: &str) -> bool {
        self.targets.contains_key(key)
    }

    /// Every target, ordered by key
    pub fn items(&self) -> &BTreeMap<String, ReleaseTarget> {
        &self.targets
    }

    /// Number of targets
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether there are no targets
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Targets on a resource
    pub fn for_resource(&self, resource_id: &str) -> Vec<ReleaseTarget> {
        self.filtered(|t| t.resource_id == resource_id)
    }

    /// Targets of a deployment
    pub fn for_deployment(&self, deployment_id: &str) -> Vec<ReleaseTarget> {
        self.filtered(|t| t.deployment_id == deployment_id)
    }

    /// Targets in an environment
    pub fn for_environment(&self, environment_id: &str) -> Vec<ReleaseTarget> {
        self.filtered(|t| t.environment_id == environment_id)
    }

    fn filtered(&self, keep: impl Fn(&ReleaseTarget) -> bool) -> Vec<ReleaseTarget> {
        self.targets.values().filter(|t| keep(t)).cloned().collect()
    }

    /// Recompute every target from scratch
    pub fn rebuild(&mut self, stores: &Stores, cache: &MatchCache) -> TargetDiff {
        let mut candidates = Vec::new();
        for deployment in stores.deployments.values() {
            for environment in stores.environments.values() {
                for resource in stores.resources.values() {
                    if triple_matches(cache, deployment, environment, resource) {
                        candidates.push(ReleaseTarget::new(&deployment.id, &environment.id, &resource.id));
                    }
                }
            }
        }
        self.replace_where(candidates, |_| true)
    }

    /// Recompute the targets on one resource (created, updated or deleted)
    pub fn refresh_resource(&mut self, stores: &Stores, cache: &MatchCache, resource_id: &str) -> TargetDiff {
        let mut candidates = Vec::new();
        if let Some(resource) = stores.resources.get(resource_id) {
            for deployment in stores.deployments.values() {
                for environment in stores.environments.values() {
                    if triple_matches(cache, deployment, environment, resource) {
                        candidates.push(ReleaseTarget::new(&deployment.id, &environment.id, &resource.id));
                    }
                }
            }
        }
        self.replace_where(candidates, |t| t.resource_id == resource_id)
    }

    /// Recompute the targets of one deployment
    pub fn refresh_deployment(&mut self, stores: &Stores, cache: &MatchCache, deployment_id: &str) -> TargetDiff {
        let mut candidates = Vec::new();
        if let Some(deployment) = stores.deployments.get(deployment_id) {
            for environment in stores.environments.values() {
                for resource in stores.resources.values() {
                    if triple_matches(cache, deployment, environment, resource) {
                        candidates.push(ReleaseTarget::new(&deployment.id, &environment.id, &resource.id));
                    }
                }
            }
        }
        self.replace_where(candidates, |t| t.deployment_id == deployment_id)
    }

    /// Recompute the targets in one environment
    pub fn refresh_environment(&mut self, stores: &Stores, cache: &MatchCache, environment_id: &str) -> TargetDiff {
        let mut candidates = Vec::new();
        if let Some(environment) = stores.environments.get(environment_id) {
            for deployment in stores.deployments.values() {
                for resource in stores.resources.values() {
                    if triple_matches(cache, deployment, environment, resource) {
                        candidates.push(ReleaseTarget::new(&deployment.id, &environment.id, &resource.id));
                    }
                }
            }
        }
        self.replace_where(candidates, |t| t.environment_id == environment_id)
    }

    /// Recompute the targets of every deployment and environment in a system
    pub fn refresh_system(&mut self, stores: &Stores, cache: &MatchCache, system_id: &str) -> TargetDiff {
        let mut diff = TargetDiff::default();
        let deployments: Vec<String> = stores
            .deployments
            .values()
            .filter(|d| d.system_id == system_id)
            .map(|d| d.id.clone())
            .collect();
        for deployment_id in deployments {
            diff.extend(self.refresh_deployment(stores, cache, &deployment_id));
        }
        diff
    }

    fn replace_where(
        &mut self,
        candidates: Vec<ReleaseTarget>,
        scope: impl Fn(&ReleaseTarget) -> bool,
    ) -> TargetDiff {
        let desired: BTreeMap<String, ReleaseTarget> =
            candidates.into_iter().map(|t| (t.key(), t)).collect();

        let stale: Vec<String> = self
            .targets
            .iter()
            .filter(|(key, target)| scope(target) && !desired.contains_key(*key))
            .map(|(key, _)| key.clone())
            .collect();

        let mut diff = TargetDiff::default();
        for key in stale {
            if let Some(target) = self.targets.remove(&key) {
                diff.removed.push(target);
            }
        }
        for (key, target) in desired {
            if !self.targets.contains_key(&key) {
                diff.added.push(target.clone());
                self.targets.insert(key, target);
            }
        }
        diff
    }
}
