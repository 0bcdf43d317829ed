use crate::state::Stores;
use rollout_core::{MatchCache, Policy, PolicyTargetSelector, ReleaseTarget};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// Whether one selector triple matches a release target.
///
/// Returns `false` when any referenced entity is missing.
fn selector_matches(
    stores: &Stores,
    cache: &MatchCache,
    selector: &PolicyTargetSelector,
    target: &ReleaseTarget,
) -> bool {
    let (Some(deployment), Some(environment), Some(resource)) = (
        stores.deployments.get(&target.deployment_id),
        stores.environments.get(&target.environment_id),
        stores.resources.get(&target.resource_id),
    ) else {
        return false;
    };

    let result = cache
        .matches_optional(selector.deployment_selector.as_ref(), deployment)
        .and_then(|ok| Ok(ok && cache.matches_optional(selector.environment_selector.as_ref(), environment)?))
        .and_then(|ok| Ok(ok && cache.matches_optional(selector.resource_selector.as_ref(), resource)?));

    match result {
        Ok(matched) => matched,
        Err(e) => {
            warn!(target = %target, error = %e, "Policy selector evaluation failed");
            false
        }
    }
}

/// Whether an enabled policy applies to a target (any selector triple matches)
pub fn policy_applies(stores: &Stores, cache: &MatchCache, policy: &Policy, target: &ReleaseTarget) -> bool {
    policy.enabled
        && policy
            .selectors
            .iter()
            .any(|selector| selector_matches(stores, cache, selector, target))
}

/// For each release target key, the ids of the enabled policies that apply
#[derive(Debug, Clone, Default)]
pub struct PolicyTargetIndex {
    by_target: BTreeMap<String, BTreeSet<String>>,
}

impl PolicyTargetIndex {
    /// Empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy ids applying to a target
    pub fn policies_for(&self, target_key: &str) -> Vec<String> {
        self.by_target
            .get(target_key)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Targets a policy currently applies to
    pub fn targets_for_policy(&self, policy_id: &str) -> Vec<String> {
        self.by_target
            .iter()
            .filter(|(_, ids)| ids.contains(policy_id))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Recompute the policies of one target. Returns whether the set changed.
    pub fn refresh_target(&mut self, stores: &Stores, cache: &MatchCache, target: &ReleaseTarget) -> bool {
        let matched: BTreeSet<String> = stores
            .policies
            .values()
            .filter(|p| policy_applies(stores, cache, p, target))
            .map(|p| p.id.clone())
            .collect();

        let key = target.key();
        let previous = self.by_target.insert(key, matched.clone());
        previous.unwrap_or_default() != matched
    }

    /// Drop a removed target
    pub fn remove_target(&mut self, target_key: &str) {
        self.by_target.remove(target_key);
    }

    /// Recompute one policy across the given targets. Returns the keys whose
    /// policy set changed.
    pub fn refresh_policy<'a>(
        &mut self,
        stores: &Stores,
        cache: &MatchCache,
        policy_id: &str,
        targets: impl Iterator<Item = &'a ReleaseTarget>,
    ) -> Vec<String> {
        let policy = stores.policies.get(policy_id);
        let mut changed = Vec::new();

        for target in targets {
            let applies = policy
                .map(|p| policy_applies(stores, cache, p, target))
                .unwrap_or(false);
            let key = target.key();
            let entry = self.by_target.entry(key.clone()).or_default();
            let modified = if applies {
                entry.insert(policy_id.to_string())
            } else {
                entry.remove(policy_id)
            };
            if modified {
                changed.push(key);
            }
        }
        changed
    }

    /// Recompute everything
    pub fn rebuild<'a>(
        &mut self,
        stores: &Stores,
        cache: &MatchCache,
        targets: impl Iterator<Item = &'a ReleaseTarget>,
    ) {
        self.by_target.clear();
        for target in targets {
            self.refresh_target(stores, cache, target);
        }
    }
}
