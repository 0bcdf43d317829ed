//! Selectors decide which entities a deployment, environment, policy or
//! relationship rule applies to.
//!
//! A selector is either a JSON condition tree ([`JsonCondition`]) or an
//! expression evaluated by the JEXL engine with the entity bound under its
//! kind name (`resource`, `deployment`, `environment`, `version`). Both forms
//! evaluate against the entity's camelCase JSON record.

use crate::domain::entity::{Entity, EntityKind};
use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// JSON condition trees
pub mod json;

/// Bounded selector match cache
pub mod cache;

pub use cache::{MatchCache, MatchCacheStats};
pub use json::{
    ColumnCondition, ColumnOperator, ComparisonOperator, DateCondition, DateOperator,
    JsonCondition, MetadataCondition, MetadataOperator,
};

/// A compiled-on-demand entity predicate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Selector {
    /// JSON condition tree
    Json(JsonCondition),
    /// Boolean expression
    Cel(String),
}

impl Selector {
    /// Selector matching every entity
    pub fn match_all() -> Self {
        Selector::Json(JsonCondition::all())
    }

    /// Stable content hash used as the match-cache key
    pub fn fingerprint(&self) -> String {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&encoded))
    }

    /// Check the selector is well formed (regular expressions compile,
    /// expressions are non-empty).
    pub fn validate(&self) -> CoreResult<()> {
        match self {
            Selector::Json(condition) => condition.validate(),
            Selector::Cel(expression) if expression.trim().is_empty() => {
                Err(CoreError::SelectorError("Empty selector expression".to_string()))
            }
            Selector::Cel(_) => Ok(()),
        }
    }

    /// Evaluate the selector against an entity
    pub fn matches<M: Matchable + ?Sized>(&self, entity: &M) -> CoreResult<bool> {
        let record = entity.selector_record();
        match self {
            Selector::Json(condition) => condition.matches(&record),
            Selector::Cel(expression) => {
                let mut context = Map::new();
                context.insert(entity.match_kind().binding_name().to_string(), record);
                eval_expression(expression, Value::Object(context))
            }
        }
    }
}

/// Anything a selector can be evaluated against
pub trait Matchable {
    /// Kind of the entity, selects the expression binding name
    fn match_kind(&self) -> EntityKind;

    /// Entity id
    fn match_id(&self) -> &str;

    /// Timestamp component of the cache key
    fn match_stamp(&self) -> i64;

    /// camelCase JSON view of the entity
    fn selector_record(&self) -> Value;
}

impl<T: Entity> Matchable for T {
    fn match_kind(&self) -> EntityKind {
        T::KIND
    }

    fn match_id(&self) -> &str {
        self.id()
    }

    fn match_stamp(&self) -> i64 {
        self.cache_stamp()
    }

    fn selector_record(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Evaluate a boolean JEXL expression.
///
/// Non-boolean results are truthy unless `null` or `false`.
pub fn eval_expression(expression: &str, context: Value) -> CoreResult<bool> {
    let evaluator = jexl_eval::Evaluator::new();
    match evaluator.eval_in_context(expression, context) {
        Ok(Value::Bool(b)) => Ok(b),
        Ok(result) => Ok(!result.is_null() && result != Value::Bool(false)),
        Err(e) => Err(CoreError::ExpressionError(format!(
            "Failed to evaluate expression {}: {}",
            expression, e
        ))),
    }
}

/// Evaluate an optional selector; `None` matches everything
pub fn matches_optional<M: Matchable + ?Sized>(
    selector: Option<&Selector>,
    entity: &M,
) -> CoreResult<bool> {
    match selector {
        Some(selector) => selector.matches(entity),
        None => Ok(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{Deployment, Resource};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn resource(name: &str, env: &str) -> Resource {
        let mut metadata = BTreeMap::new();
        metadata.insert("env".to_string(), env.to_string());
        Resource {
            id: format!("id-{}", name),
            workspace_id: "ws".into(),
            provider_id: None,
            identifier: name.into(),
            name: name.into(),
            kind: "Kubernetes/Cluster".into(),
            version: "v1".into(),
            metadata,
            config: json!({ "replicas": 3 }),
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn test_expression_selector_binds_kind_name() {
        let selector = Selector::Cel("resource.metadata.env == 'prod'".into());
        assert!(selector.matches(&resource("a", "prod")).unwrap());
        assert!(!selector.matches(&resource("b", "dev")).unwrap());
    }

    #[test]
    fn test_expression_selector_on_nested_config() {
        let selector = Selector::Cel("resource.config.replicas > 2".into());
        assert!(selector.matches(&resource("a", "prod")).unwrap());
    }

    #[test]
    fn test_expression_error_is_reported() {
        let selector = Selector::Cel("resource.name ==".into());
        assert!(matches!(
            selector.matches(&resource("a", "prod")),
            Err(CoreError::ExpressionError(_))
        ));
    }

    #[test]
    fn test_selector_wire_form() {
        let selector: Selector = serde_json::from_value(json!({
            "json": { "type": "name", "operator": "starts-with", "value": "api" }
        }))
        .unwrap();
        let deployment: Deployment = serde_json::from_value(json!({
            "id": "d1", "systemId": "s", "name": "api-server"
        }))
        .unwrap();
        assert!(selector.matches(&deployment).unwrap());

        let cel: Selector = serde_json::from_value(json!({ "cel": "true" })).unwrap();
        assert_eq!(cel, Selector::Cel("true".into()));
    }

    #[test]
    fn test_fingerprint_is_stable_and_distinct() {
        let a = Selector::Cel("resource.kind == 'x'".into());
        let b = Selector::Cel("resource.kind == 'y'".into());
        assert_eq!(a.fingerprint(), a.clone().fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn test_optional_selector_matches_all() {
        assert!(matches_optional(None, &resource("a", "prod")).unwrap());
        assert!(matches_optional(Some(&Selector::match_all()), &resource("a", "prod")).unwrap());
    }
}
