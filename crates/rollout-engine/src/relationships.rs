//! Relationship engine.
//!
//! Relationship rules connect entities through a from-selector, a
//! to-selector and a matcher. Relations are derived state: they are never
//! persisted and are recomputed for a rule or an entity whenever either
//! changes.

use crate::state::Stores;
use rollout_core::{
    EntityHandle, EntityKind, EntityRelation, MatchCache, Matchable, RelatableKind,
    RelationshipRule,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

fn candidates<'a>(stores: &'a Stores, kind: RelatableKind) -> Vec<(EntityHandle, &'a dyn Matchable)> {
    match kind {
        RelatableKind::Resource => stores
            .resources
            .values()
            .map(|r| (EntityHandle::new(EntityKind::Resource, &r.id), r as &dyn Matchable))
            .collect(),
        RelatableKind::Deployment => stores
            .deployments
            .values()
            .map(|d| (EntityHandle::new(EntityKind::Deployment, &d.id), d as &dyn Matchable))
            .collect(),
        RelatableKind::Environment => stores
            .environments
            .values()
            .map(|e| (EntityHandle::new(EntityKind::Environment, &e.id), e as &dyn Matchable))
            .collect(),
    }
}

/// JSON record of a relatable entity
pub fn entity_record(stores: &Stores, handle: &EntityHandle) -> Option<Value> {
    match handle.kind {
        EntityKind::Resource => stores.resources.get(&handle.id).map(|e| e.selector_record()),
        EntityKind::Deployment => stores.deployments.get(&handle.id).map(|e| e.selector_record()),
        EntityKind::Environment => stores.environments.get(&handle.id).map(|e| e.selector_record()),
        _ => None,
    }
}

fn relatable(kind: EntityKind) -> Option<RelatableKind> {
    match kind {
        EntityKind::Resource => Some(RelatableKind::Resource),
        EntityKind::Deployment => Some(RelatableKind::Deployment),
        EntityKind::Environment => Some(RelatableKind::Environment),
        _ => None,
    }
}

/// Evaluate a rule restricted to pairs accepted by `pair_filter`
fn evaluate_rule(
    stores: &Stores,
    cache: &MatchCache,
    rule: &RelationshipRule,
    pair_filter: impl Fn(&EntityHandle, &EntityHandle) -> bool,
) -> Vec<EntityRelation> {
    let selected = |kind, selector: Option<&rollout_core::Selector>| {
        candidates(stores, kind)
            .into_iter()
            .filter(|(handle, entity)| match cache.matches_optional(selector, *entity) {
                Ok(matched) => matched,
                Err(e) => {
                    warn!(rule_id = %rule.id, entity_id = %handle.id, error = %e, "Relationship selector failed");
                    false
                }
            })
            .collect::<Vec<_>>()
    };

    let froms = selected(rule.from_type, rule.from_selector.as_ref());
    let tos = selected(rule.to_type, rule.to_selector.as_ref());

    let mut relations = Vec::new();
    for (from_handle, from_entity) in &froms {
        let from_record = from_entity.selector_record();
        for (to_handle, to_entity) in &tos {
            if from_handle == to_handle || !pair_filter(from_handle, to_handle) {
                continue;
            }
            match rule.matcher.matches(&from_record, &to_entity.selector_record()) {
                Ok(true) => relations.push(EntityRelation {
                    rule_id: rule.id.clone(),
                    from: from_handle.clone(),
                    to: to_handle.clone(),
                }),
                Ok(false) => {}
                Err(e) => {
                    warn!(rule_id = %rule.id, from = %from_handle.id, to = %to_handle.id, error = %e, "Relationship matcher failed")
                }
            }
        }
    }
    relations
}

/// Relation store indexed by rule, from-entity and to-entity
#[derive(Debug, Clone, Default)]
pub struct RelationshipIndex {
    relations: BTreeSet<EntityRelation>,
    by_from: BTreeMap<EntityHandle, BTreeSet<EntityRelation>>,
    by_to: BTreeMap<EntityHandle, BTreeSet<EntityRelation>>,
}

impl RelationshipIndex {
    /// Empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Recompute every relation
    pub fn rebuild(stores: &Stores, cache: &MatchCache) -> Self {
        let mut index = Self::new();
        for rule in stores.relationship_rules.values() {
            for relation in evaluate_rule(stores, cache, rule, |_, _| true) {
                index.insert(relation);
            }
        }
        index
    }

    /// Every relation, ordered
    pub fn all(&self) -> impl Iterator<Item = &EntityRelation> {
        self.relations.iter()
    }

    /// Relations produced by one rule
    pub fn relations_for_rule(&self, rule_id: &str) -> Vec<EntityRelation> {
        self.relations.iter().filter(|r| r.rule_id == rule_id).cloned().collect()
    }

    /// Relations where `handle` is the source
    pub fn from_entity(&self, handle: &EntityHandle) -> Vec<EntityRelation> {
        self.by_from.get(handle).map(|s| s.iter().cloned().collect()).unwrap_or_default()
    }

    /// Relations where `handle` is the target
    pub fn to_entity(&self, handle: &EntityHandle) -> Vec<EntityRelation> {
        self.by_to.get(handle).map(|s| s.iter().cloned().collect()).unwrap_or_default()
    }

    /// Entities of `kind` related to `handle` in either direction, ordered
    pub fn related_entities(&self, handle: &EntityHandle, kind: EntityKind) -> Vec<EntityHandle> {
        let mut related: BTreeSet<EntityHandle> = BTreeSet::new();
        for relation in self.by_from.get(handle).into_iter().flatten() {
            if relation.to.kind == kind {
                related.insert(relation.to.clone());
            }
        }
        for relation in self.by_to.get(handle).into_iter().flatten() {
            if relation.from.kind == kind {
                related.insert(relation.from.clone());
            }
        }
        related.into_iter().collect()
    }

    fn insert(&mut self, relation: EntityRelation) -> bool {
        if !self.relations.insert(relation.clone()) {
            return false;
        }
        self.by_from.entry(relation.from.clone()).or_default().insert(relation.clone());
        self.by_to.entry(relation.to.clone()).or_default().insert(relation);
        true
    }

    fn remove(&mut self, relation: &EntityRelation) -> bool {
        if !self.relations.remove(relation) {
            return false;
        }
        if let Some(set) = self.by_from.get_mut(&relation.from) {
            set.remove(relation);
            if set.is_empty() {
                self.by_from.remove(&relation.from);
            }
        }
        if let Some(set) = self.by_to.get_mut(&relation.to) {
            set.remove(relation);
            if set.is_empty() {
                self.by_to.remove(&relation.to);
            }
        }
        true
    }

    fn apply(&mut self, stale: Vec<EntityRelation>, fresh: Vec<EntityRelation>) -> BTreeSet<EntityHandle> {
        let fresh_set: BTreeSet<EntityRelation> = fresh.into_iter().collect();
        let mut touched = BTreeSet::new();

        for relation in stale {
            if !fresh_set.contains(&relation) && self.remove(&relation) {
                touched.insert(relation.from.clone());
                touched.insert(relation.to.clone());
            }
        }
        for relation in fresh_set {
            let (from, to) = (relation.from.clone(), relation.to.clone());
            if self.insert(relation) {
                touched.insert(from);
                touched.insert(to);
            }
        }
        touched
    }

    /// Recompute the relations of one rule. Returns the entities whose
    /// relations changed.
    pub fn refresh_rule(&mut self, stores: &Stores, cache: &MatchCache, rule_id: &str) -> BTreeSet<EntityHandle> {
        let stale = self.relations_for_rule(rule_id);
        let fresh = stores
            .relationship_rules
            .get(rule_id)
            .map(|rule| evaluate_rule(stores, cache, rule, |_, _| true))
            .unwrap_or_default();
        self.apply(stale, fresh)
    }

    /// Recompute every relation touching one entity (created, updated or
    /// deleted). Returns the entities whose relations changed.
    pub fn refresh_entity(&mut self, stores: &Stores, cache: &MatchCache, handle: &EntityHandle) -> BTreeSet<EntityHandle> {
        let mut stale = self.from_entity(handle);
        stale.extend(self.to_entity(handle));

        let mut fresh = Vec::new();
        if let (Some(kind), Some(_)) = (relatable(handle.kind), entity_record(stores, handle)) {
            for rule in stores.relationship_rules.values() {
                if rule.from_type == kind || rule.to_type == kind {
                    fresh.extend(evaluate_rule(stores, cache, rule, |from, to| from == handle || to == handle));
                }
            }
        }
        self.apply(stale, fresh)
    }
}
