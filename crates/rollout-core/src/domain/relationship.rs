use crate::domain::entity::EntityKind;
use crate::error::{CoreError, CoreResult};
use crate::impl_entity;
use crate::selector::{self, Selector};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Entity kinds a relationship rule can connect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelatableKind {
    /// Resources
    Resource,
    /// Deployments
    Deployment,
    /// Environments
    Environment,
}

impl RelatableKind {
    /// Matching entity kind
    pub fn entity_kind(&self) -> EntityKind {
        match self {
            RelatableKind::Resource => EntityKind::Resource,
            RelatableKind::Deployment => EntityKind::Deployment,
            RelatableKind::Environment => EntityKind::Environment,
        }
    }
}

/// Comparison applied to a pair of property values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PropertyOperator {
    /// Values are equal
    #[default]
    Equals,
    /// Values differ
    NotEquals,
    /// `from` contains `to`
    Contains,
    /// `from` starts with `to`
    StartsWith,
    /// `from` ends with `to`
    EndsWith,
}

/// Compares a property of the `from` entity with a property of the `to` entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyMatcher {
    /// Path on the `from` entity
    pub from_property: Vec<String>,
    /// Path on the `to` entity
    pub to_property: Vec<String>,
    /// Comparison
    #[serde(default)]
    pub operator: PropertyOperator,
}

impl PropertyMatcher {
    /// Evaluate against the JSON records of both entities.
    ///
    /// A missing property on either side never matches.
    pub fn matches(&self, from: &Value, to: &Value) -> CoreResult<bool> {
        let (left, right) = match (lookup_path(from, &self.from_property)?, lookup_path(to, &self.to_property)?) {
            (Some(l), Some(r)) => (l, r),
            _ => return Ok(false),
        };

        let as_text = |v: &Value| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        Ok(match self.operator {
            PropertyOperator::Equals => left == right,
            PropertyOperator::NotEquals => left != right,
            PropertyOperator::Contains => as_text(&left).contains(&as_text(&right)),
            PropertyOperator::StartsWith => as_text(&left).starts_with(&as_text(&right)),
            PropertyOperator::EndsWith => as_text(&left).ends_with(&as_text(&right)),
        })
    }
}

/// Decides whether a `(from, to)` pair is related
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelationshipMatcher {
    /// Every property matcher must hold
    Properties(Vec<PropertyMatcher>),
    /// Boolean expression over `from` and `to`
    Cel(String),
}

impl RelationshipMatcher {
    /// Evaluate the matcher for a candidate pair
    pub fn matches(&self, from: &Value, to: &Value) -> CoreResult<bool> {
        match self {
            RelationshipMatcher::Properties(matchers) => {
                for matcher in matchers {
                    if !matcher.matches(from, to)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            RelationshipMatcher::Cel(expression) => {
                selector::eval_expression(expression, json!({ "from": from, "to": to }))
            }
        }
    }
}

/// Rule producing typed edges between entities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipRule {
    /// Unique identifier
    pub id: String,
    /// Owning workspace
    #[serde(default)]
    pub workspace_id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Name variables use to follow this rule
    pub reference: String,
    /// Kind on the `from` side
    pub from_type: RelatableKind,
    /// Kind on the `to` side
    pub to_type: RelatableKind,
    /// Restricts the `from` side; `None` matches all
    #[serde(default)]
    pub from_selector: Option<Selector>,
    /// Restricts the `to` side; `None` matches all
    #[serde(default)]
    pub to_selector: Option<Selector>,
    /// Pair matcher
    pub matcher: RelationshipMatcher,
    /// Creation timestamp
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Last update timestamp
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl_entity!(RelationshipRule, EntityKind::RelationshipRule);

/// Typed reference to an entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityHandle {
    /// Entity kind
    pub kind: EntityKind,
    /// Entity id
    pub id: String,
}

impl EntityHandle {
    /// Build a handle
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self { kind, id: id.into() }
    }
}

/// A derived relationship edge
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRelation {
    /// Producing rule
    pub rule_id: String,
    /// Source entity
    pub from: EntityHandle,
    /// Target entity
    pub to: EntityHandle,
}

/// Resolve a property path on a JSON record.
///
/// Segments are quoted before being handed to JMESPath so keys containing
/// dots or dashes are addressed literally.
pub fn lookup_path(record: &Value, path: &[String]) -> CoreResult<Option<Value>> {
    if path.is_empty() {
        return Ok(Some(record.clone()));
    }

    let expression = path
        .iter()
        .map(|segment| serde_json::to_string(segment))
        .collect::<Result<Vec<_>, _>>()?
        .join(".");

    let compiled = jmespath::compile(&expression).map_err(|e| {
        CoreError::ExpressionError(format!("Failed to compile property path {}: {}", expression, e))
    })?;
    let found = compiled.search(record).map_err(|e| {
        CoreError::ExpressionError(format!("Failed to evaluate property path {}: {}", expression, e))
    })?;

    let value = serde_json::to_value(&*found)?;
    Ok((!value.is_null()).then_some(value))
}
