use super::WorldView;
use crate::relationships::entity_record;
use rollout_core::domain::relationship::lookup_path;
use rollout_core::{EntityHandle, EntityKind, VariableValue};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// Resolve the variables of a resource.
///
/// Literals are copied. A reference follows the relationship rules named by
/// `reference` from the resource to the first related entity (ordered by
/// handle) and reads `path` from its record. Unresolvable references are left
/// out of the release.
pub fn resolve(world: &WorldView<'_>, resource_id: &str) -> BTreeMap<String, Value> {
    let mut resolved = BTreeMap::new();

    for variable in world.stores.variables_for_resource(resource_id) {
        match &variable.value {
            VariableValue::Literal { value, .. } => {
                resolved.insert(variable.key.clone(), value.clone());
            }
            VariableValue::Reference { reference, path } => {
                match resolve_reference(world, resource_id, reference, path) {
                    Some(value) => {
                        resolved.insert(variable.key.clone(), value);
                    }
                    None => debug!(
                        resource_id = %resource_id,
                        key = %variable.key,
                        reference = %reference,
                        "Variable reference did not resolve"
                    ),
                }
            }
        }
    }

    resolved
}

fn resolve_reference(world: &WorldView<'_>, resource_id: &str, reference: &str, path: &[String]) -> Option<Value> {
    let handle = EntityHandle::new(EntityKind::Resource, resource_id);
    let rule_ids: Vec<&str> = world
        .stores
        .relationship_rules
        .values()
        .filter(|rule| rule.reference == reference)
        .map(|rule| rule.id.as_str())
        .collect();

    let mut related: Vec<EntityHandle> = world
        .relationships
        .from_entity(&handle)
        .into_iter()
        .filter(|relation| rule_ids.contains(&relation.rule_id.as_str()))
        .map(|relation| relation.to)
        .collect();
    related.sort();

    let target = related.first()?;
    let record = entity_record(world.stores, target)?;
    match lookup_path(&record, path) {
        Ok(value) => value,
        Err(e) => {
            debug!(resource_id = %resource_id, reference = %reference, error = %e, "Variable path lookup failed");
            None
        }
    }
}
