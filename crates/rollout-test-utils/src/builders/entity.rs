use rollout_core::{EntityAction, EntityKind, EventEnvelope, EventType, ResourceVariable, UserApprovalRecord};
use serde_json::{json, Map, Value};

/// Fluent builder for an entity payload
#[derive(Debug, Clone)]
pub struct EntityBuilder {
    kind: EntityKind,
    data: Map<String, Value>,
}

impl EntityBuilder {
    /// Builder for `kind` with the given id
    pub fn new(kind: EntityKind, id: &str) -> Self {
        let mut data = Map::new();
        data.insert("id".to_string(), Value::from(id));
        Self { kind, data }
    }

    /// Set a top-level field
    pub fn set(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    /// Add a metadata label
    pub fn label(mut self, key: &str, value: &str) -> Self {
        let metadata = self.data.entry("metadata").or_insert_with(|| json!({}));
        if let Some(map) = metadata.as_object_mut() {
            map.insert(key.to_string(), Value::from(value));
        }
        self
    }

    /// Resource selector as a JSON condition tree
    pub fn resource_selector(self, condition: Value) -> Self {
        self.set("resourceSelector", json!({ "json": condition }))
    }

    /// Resource selector as an expression
    pub fn resource_expression(self, expression: &str) -> Self {
        self.set("resourceSelector", json!({ "cel": expression }))
    }

    /// Entity kind
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Entity id
    pub fn id(&self) -> &str {
        self.data.get("id").and_then(Value::as_str).unwrap_or_default()
    }

    /// Payload
    pub fn build(&self) -> Value {
        Value::Object(self.data.clone())
    }

    fn envelope(&self, action: EntityAction, workspace_id: &str) -> EventEnvelope {
        EventEnvelope::new(EventType::Entity(self.kind, action), workspace_id, self.build())
    }

    /// `<kind>.created` envelope
    pub fn created(&self, workspace_id: &str) -> EventEnvelope {
        self.envelope(EntityAction::Created, workspace_id)
    }

    /// `<kind>.updated` envelope
    pub fn updated(&self, workspace_id: &str) -> EventEnvelope {
        self.envelope(EntityAction::Updated, workspace_id)
    }

    /// `<kind>.deleted` envelope
    pub fn deleted(&self, workspace_id: &str) -> EventEnvelope {
        EventEnvelope::new(EventType::Entity(self.kind, EntityAction::Deleted), workspace_id, json!({ "id": self.id() }))
    }
}

/// System
pub fn system(id: &str) -> EntityBuilder {
    EntityBuilder::new(EntityKind::System, id).set("name", id)
}

/// Environment in `system_id`
pub fn environment(id: &str, system_id: &str) -> EntityBuilder {
    EntityBuilder::new(EntityKind::Environment, id).set("name", id).set("systemId", system_id)
}

/// Deployment in `system_id`
pub fn deployment(id: &str, system_id: &str) -> EntityBuilder {
    EntityBuilder::new(EntityKind::Deployment, id).set("name", id).set("slug", id).set("systemId", system_id)
}

/// Deployment in `system_id` dispatched to `agent_id`
pub fn deployment_with_agent(id: &str, system_id: &str, agent_id: &str) -> EntityBuilder {
    deployment(id, system_id).set("jobAgentId", agent_id)
}

/// Resource with a unique identifier derived from its id
pub fn resource(id: &str) -> EntityBuilder {
    EntityBuilder::new(EntityKind::Resource, id)
        .set("name", id)
        .set("identifier", format!("{}-identifier", id))
        .set("kind", "Kubernetes/Cluster")
        .set("version", "v1")
}

/// Job agent
pub fn job_agent(id: &str) -> EntityBuilder {
    EntityBuilder::new(EntityKind::JobAgent, id).set("name", id).set("type", "test").set("config", json!({}))
}

/// Resource provider
pub fn resource_provider(id: &str) -> EntityBuilder {
    EntityBuilder::new(EntityKind::ResourceProvider, id).set("name", id)
}

/// Ready version `tag` of a deployment; its id is `<deployment>-<tag>`
pub fn version(deployment_id: &str, tag: &str) -> EntityBuilder {
    EntityBuilder::new(EntityKind::DeploymentVersion, &format!("{}-{}", deployment_id, tag))
        .set("deploymentId", deployment_id)
        .set("tag", tag)
        .set("status", "ready")
}

/// Enabled policy applying to every target
pub fn policy(id: &str, rules: Vec<Value>) -> EntityBuilder {
    EntityBuilder::new(EntityKind::Policy, id)
        .set("name", id)
        .set("enabled", true)
        .set("selectors", json!([{}]))
        .set("rules", Value::Array(rules))
}

/// Approval of a version in an environment by a user
pub fn approval(version_id: &str, environment_id: &str, user_id: &str) -> EntityBuilder {
    EntityBuilder::new(EntityKind::UserApprovalRecord, &UserApprovalRecord::key(version_id, environment_id, user_id))
        .set("versionId", version_id)
        .set("environmentId", environment_id)
        .set("userId", user_id)
        .set("status", "approved")
}

/// Literal variable on a resource
pub fn resource_variable(resource_id: &str, key: &str, value: Value) -> EntityBuilder {
    EntityBuilder::new(EntityKind::ResourceVariable, &ResourceVariable::key_for(resource_id, key))
        .set("resourceId", resource_id)
        .set("key", key)
        .set("value", json!({ "type": "literal", "value": value }))
}

/// JSON condition matching every entity
pub fn match_all() -> Value {
    json!({ "type": "comparison", "operator": "and", "conditions": [] })
}

/// JSON condition on a metadata label
pub fn metadata_equals(key: &str, value: &str) -> Value {
    json!({ "type": "metadata", "key": key, "operator": "equals", "value": value })
}

/// JSON condition on the entity id
pub fn id_equals(id: &str) -> Value {
    json!({ "type": "id", "operator": "equals", "value": id })
}
