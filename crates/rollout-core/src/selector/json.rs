//! JSON condition trees.
//!
//! ```json
//! { "type": "comparison", "operator": "and", "conditions": [
//!     { "type": "kind", "operator": "equals", "value": "Kubernetes/Cluster" },
//!     { "type": "metadata", "key": "env", "operator": "equals", "value": "prod" }
//! ] }
//! ```
//!
//! `and` is conjunctive, `or` disjunctive. An empty `and` matches everything,
//! an empty `or` matches nothing, and `not: true` negates the combined result.

use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Boolean combinator of a comparison node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonOperator {
    /// All conditions hold
    And,
    /// At least one condition holds
    Or,
}

/// String comparison on a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ColumnOperator {
    /// Exact match
    Equals,
    /// Anything but an exact match
    NotEquals,
    /// Substring
    Contains,
    /// Prefix
    StartsWith,
    /// Suffix
    EndsWith,
    /// Regular expression
    Regex,
}

/// Comparison against a metadata entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MetadataOperator {
    /// Exact match
    Equals,
    /// Key missing or value differs
    NotEquals,
    /// Substring
    Contains,
    /// Prefix
    StartsWith,
    /// Suffix
    EndsWith,
    /// Regular expression
    Regex,
    /// Key present
    Exists,
    /// Key absent
    Null,
}

/// Timestamp comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DateOperator {
    /// Strictly before
    Before,
    /// Strictly after
    After,
    /// Before or equal
    BeforeOrOn,
    /// After or equal
    AfterOrOn,
}

/// Atom comparing a top-level string column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnCondition {
    /// Operator
    pub operator: ColumnOperator,
    /// Operand
    pub value: String,
}

/// Atom comparing a metadata entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataCondition {
    /// Metadata key
    pub key: String,
    /// Operator
    pub operator: MetadataOperator,
    /// Operand; unused by `exists` and `null`
    #[serde(default)]
    pub value: Option<String>,
}

/// Atom comparing the creation timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateCondition {
    /// Operator
    pub operator: DateOperator,
    /// Operand
    pub value: DateTime<Utc>,
}

/// A node of the condition tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum JsonCondition {
    /// `and` / `or` over child conditions
    Comparison {
        /// Combinator
        operator: ComparisonOperator,
        /// Negate the combined result
        #[serde(default)]
        not: bool,
        /// Children
        #[serde(default)]
        conditions: Vec<JsonCondition>,
    },
    /// Negation of a single condition
    Not {
        /// Negated condition
        condition: Box<JsonCondition>,
    },
    /// `name`
    Name(ColumnCondition),
    /// `kind`
    Kind(ColumnCondition),
    /// `identifier`
    Identifier(ColumnCondition),
    /// `version`
    Version(ColumnCondition),
    /// `id`
    Id(ColumnCondition),
    /// `tag` (deployment versions)
    Tag(ColumnCondition),
    /// `status` (deployment versions)
    Status(ColumnCondition),
    /// `providerId` (resources)
    Provider(ColumnCondition),
    /// `systemId` (deployments, environments)
    System(ColumnCondition),
    /// `metadata[key]`
    Metadata(MetadataCondition),
    /// `createdAt`
    CreatedAt(DateCondition),
}

impl JsonCondition {
    /// Condition matching every record
    pub fn all() -> Self {
        JsonCondition::Comparison {
            operator: ComparisonOperator::And,
            not: false,
            conditions: Vec::new(),
        }
    }

    /// Check every regular expression in the tree compiles
    pub fn validate(&self) -> CoreResult<()> {
        match self {
            JsonCondition::Comparison { conditions, .. } => {
                conditions.iter().try_for_each(JsonCondition::validate)
            }
            JsonCondition::Not { condition } => condition.validate(),
            JsonCondition::Metadata(MetadataCondition {
                operator: MetadataOperator::Regex,
                value,
                ..
            }) => compile_regex(value.as_deref().unwrap_or_default()).map(|_| ()),
            JsonCondition::Metadata(_) | JsonCondition::CreatedAt(_) => Ok(()),
            column => match column.column() {
                Some((_, ColumnCondition { operator: ColumnOperator::Regex, value })) => {
                    compile_regex(value).map(|_| ())
                }
                _ => Ok(()),
            },
        }
    }

    /// Record field and condition for column atoms
    fn column(&self) -> Option<(&'static str, &ColumnCondition)> {
        match self {
            JsonCondition::Name(c) => Some(("name", c)),
            JsonCondition::Kind(c) => Some(("kind", c)),
            JsonCondition::Identifier(c) => Some(("identifier", c)),
            JsonCondition::Version(c) => Some(("version", c)),
            JsonCondition::Id(c) => Some(("id", c)),
            JsonCondition::Tag(c) => Some(("tag", c)),
            JsonCondition::Status(c) => Some(("status", c)),
            JsonCondition::Provider(c) => Some(("providerId", c)),
            JsonCondition::System(c) => Some(("systemId", c)),
            _ => None,
        }
    }

    /// Evaluate the tree against a camelCase JSON record
    pub fn matches(&self, record: &Value) -> CoreResult<bool> {
        match self {
            JsonCondition::Comparison { operator, not, conditions } => {
                let combined = match operator {
                    ComparisonOperator::And => {
                        let mut all = true;
                        for condition in conditions {
                            if !condition.matches(record)? {
                                all = false;
                                break;
                            }
                        }
                        all
                    }
                    ComparisonOperator::Or => {
                        let mut any = false;
                        for condition in conditions {
                            if condition.matches(record)? {
                                any = true;
                                break;
                            }
                        }
                        any
                    }
                };
                Ok(combined != *not)
            }
            JsonCondition::Not { condition } => Ok(!condition.matches(record)?),
            JsonCondition::Metadata(condition) => {
                let entry = record
                    .get("metadata")
                    .and_then(|m| m.get(&condition.key))
                    .map(value_as_text);
                match_metadata(condition, entry.as_deref())
            }
            JsonCondition::CreatedAt(condition) => {
                let created = record
                    .get("createdAt")
                    .and_then(Value::as_str)
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&Utc));
                Ok(match created {
                    None => false,
                    Some(created) => match condition.operator {
                        DateOperator::Before => created < condition.value,
                        DateOperator::After => created > condition.value,
                        DateOperator::BeforeOrOn => created <= condition.value,
                        DateOperator::AfterOrOn => created >= condition.value,
                    },
                })
            }
            column => match column.column() {
                Some((field, condition)) => {
                    let actual = record.get(field).map(value_as_text).unwrap_or_default();
                    match_column(condition.operator, &actual, &condition.value)
                }
                None => Err(CoreError::SelectorError(format!("Unsupported condition {:?}", column))),
            },
        }
    }
}

fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn compile_regex(pattern: &str) -> CoreResult<Regex> {
    Regex::new(pattern)
        .map_err(|e| CoreError::SelectorError(format!("Invalid regex {}: {}", pattern, e)))
}

fn match_column(operator: ColumnOperator, actual: &str, expected: &str) -> CoreResult<bool> {
    Ok(match operator {
        ColumnOperator::Equals => actual == expected,
        ColumnOperator::NotEquals => actual != expected,
        ColumnOperator::Contains => actual.contains(expected),
        ColumnOperator::StartsWith => actual.starts_with(expected),
        ColumnOperator::EndsWith => actual.ends_with(expected),
        ColumnOperator::Regex => compile_regex(expected)?.is_match(actual),
    })
}

fn match_metadata(condition: &MetadataCondition, entry: Option<&str>) -> CoreResult<bool> {
    let expected = condition.value.as_deref().unwrap_or_default();
    Ok(match (condition.operator, entry) {
        (MetadataOperator::Exists, entry) => entry.is_some(),
        (MetadataOperator::Null, entry) => entry.is_none(),
        (MetadataOperator::NotEquals, None) => true,
        (_, None) => false,
        (MetadataOperator::Equals, Some(v)) => v == expected,
        (MetadataOperator::NotEquals, Some(v)) => v != expected,
        (MetadataOperator::Contains, Some(v)) => v.contains(expected),
        (MetadataOperator::StartsWith, Some(v)) => v.starts_with(expected),
        (MetadataOperator::EndsWith, Some(v)) => v.ends_with(expected),
        (MetadataOperator::Regex, Some(v)) => compile_regex(expected)?.is_match(v),
    })
}
