//! Deterministic identifiers for engine-created entities.
//!
//! Two engines fed the same event history must produce the same releases and
//! jobs, so ids are UUIDv5 values derived from their inputs rather than random.

use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

fn namespace() -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, b"urn:rollout:workspace-engine")
}

/// Id of the release of `version_id` on a target with resolved variables
pub fn release_id(target_key: &str, version_id: &str, variables: &BTreeMap<String, Value>) -> String {
    let variables = serde_json::to_string(variables).unwrap_or_default();
    let name = format!("release|{}|{}|{}", target_key, version_id, variables);
    Uuid::new_v5(&namespace(), name.as_bytes()).to_string()
}

/// Id of the `ordinal`-th job of a release (`kind` distinguishes rollbacks)
pub fn job_id(release_id: &str, ordinal: usize, kind: &str) -> String {
    let name = format!("job|{}|{}|{}", release_id, kind, ordinal);
    Uuid::new_v5(&namespace(), name.as_bytes()).to_string()
}

/// Id of a provider-owned resource that arrived without one
pub fn resource_id(provider_id: &str, identifier: &str) -> String {
    let name = format!("resource|{}|{}", provider_id, identifier);
    Uuid::new_v5(&namespace(), name.as_bytes()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_release_ids_are_deterministic() {
        let mut vars = BTreeMap::new();
        vars.insert("region".to_string(), json!("us-east-1"));

        let a = release_id("d|e|r", "v1", &vars);
        let b = release_id("d|e|r", "v1", &vars);
        assert_eq!(a, b);
        assert_ne!(a, release_id("d|e|r", "v2", &vars));
        assert_ne!(a, release_id("d|e|r", "v1", &BTreeMap::new()));
        assert!(Uuid::parse_str(&a).is_ok());
    }

    #[test]
    fn test_job_ids_depend_on_ordinal_and_kind() {
        assert_eq!(job_id("rel", 0, "deploy"), job_id("rel", 0, "deploy"));
        assert_ne!(job_id("rel", 0, "deploy"), job_id("rel", 1, "deploy"));
        assert_ne!(job_id("rel", 0, "deploy"), job_id("rel", 0, "rollback"));
    }
}
