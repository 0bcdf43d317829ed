//! Event envelope, inbound event kinds and outbound events.
//!
//! Every state-mutating operation on a workspace arrives as an
//! [`EventEnvelope`] read from the partitioned log. Entity events follow the
//! `<kind>.<action>` naming (`deployment.created`, `resource.deleted`, ...);
//! the remaining kinds drive jobs, verifications, ticks and snapshots.

use crate::domain::entities::Resource;
use crate::domain::entity::EntityKind;
use crate::domain::job::{Job, JobStatus};
use crate::domain::release::ReleaseTarget;
use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Action carried by an entity event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityAction {
    /// `<kind>.created`
    Created,
    /// `<kind>.updated`
    Updated,
    /// `<kind>.deleted`
    Deleted,
}

impl EntityAction {
    fn as_str(&self) -> &'static str {
        match self {
            EntityAction::Created => "created",
            EntityAction::Updated => "updated",
            EntityAction::Deleted => "deleted",
        }
    }
}

/// Entity kinds that can be mutated directly by events
pub const MUTABLE_KINDS: [EntityKind; 11] = [
    EntityKind::System,
    EntityKind::Deployment,
    EntityKind::Environment,
    EntityKind::Resource,
    EntityKind::ResourceProvider,
    EntityKind::DeploymentVersion,
    EntityKind::JobAgent,
    EntityKind::Policy,
    EntityKind::UserApprovalRecord,
    EntityKind::RelationshipRule,
    EntityKind::ResourceVariable,
];

/// Typed event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventType {
    /// Entity create/update/delete
    Entity(EntityKind, EntityAction),
    /// `resource-provider.set-resources`
    ResourceProviderSetResources,
    /// `job.created` - full job, published by the engine
    JobCreated,
    /// `job.updated` - full job, published by the engine
    JobUpdated,
    /// `job.update` - partial update from an agent
    JobUpdate,
    /// `job-verification.started`
    JobVerificationStarted,
    /// `job-verification.completed`
    JobVerificationCompleted,
    /// `workspace.tick` - scheduler generated
    WorkspaceTick,
    /// `workspace.save` - triggers a snapshot
    WorkspaceSave,
}

impl EventType {
    /// Every known event type
    pub fn all() -> Vec<EventType> {
        let mut all = Vec::new();
        for kind in MUTABLE_KINDS {
            for action in [EntityAction::Created, EntityAction::Updated, EntityAction::Deleted] {
                all.push(EventType::Entity(kind, action));
            }
        }
        all.extend([
            EventType::ResourceProviderSetResources,
            EventType::JobCreated,
            EventType::JobUpdated,
            EventType::JobUpdate,
            EventType::JobVerificationStarted,
            EventType::JobVerificationCompleted,
            EventType::WorkspaceTick,
            EventType::WorkspaceSave,
        ]);
        all
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Entity(kind, action) => write!(f, "{}.{}", kind.as_str(), action.as_str()),
            EventType::ResourceProviderSetResources => f.write_str("resource-provider.set-resources"),
            EventType::JobCreated => f.write_str("job.created"),
            EventType::JobUpdated => f.write_str("job.updated"),
            EventType::JobUpdate => f.write_str("job.update"),
            EventType::JobVerificationStarted => f.write_str("job-verification.started"),
            EventType::JobVerificationCompleted => f.write_str("job-verification.completed"),
            EventType::WorkspaceTick => f.write_str("workspace.tick"),
            EventType::WorkspaceSave => f.write_str("workspace.save"),
        }
    }
}

impl FromStr for EventType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::all()
            .into_iter()
            .find(|t| t.to_string() == s)
            .ok_or_else(|| CoreError::UnknownEventType(s.to_string()))
    }
}

/// Inbound event envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Event type, e.g. `deployment.created`
    pub event_type: String,
    /// Target workspace
    pub workspace_id: String,
    /// Producer timestamp in nanoseconds since the epoch; 0 when unknown
    #[serde(default)]
    pub timestamp: i64,
    /// Event payload
    #[serde(default)]
    pub data: Value,
}

impl EventEnvelope {
    /// Build an envelope for a typed event
    pub fn new(event_type: EventType, workspace_id: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            workspace_id: workspace_id.into(),
            timestamp: 0,
            data,
        }
    }

    /// Set the producer timestamp
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp.timestamp_nanos_opt().unwrap_or(0);
        self
    }

    /// Decode an envelope from its JSON wire form
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        let envelope: EventEnvelope = serde_json::from_slice(bytes)
            .map_err(|e| CoreError::DecodeError(format!("Invalid event envelope: {}", e)))?;
        if envelope.workspace_id.is_empty() {
            return Err(CoreError::DecodeError("Event envelope has no workspaceId".to_string()));
        }
        Ok(envelope)
    }

    /// Encode the envelope to its JSON wire form
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse the event type
    pub fn kind(&self) -> CoreResult<EventType> {
        self.event_type.parse()
    }

    /// Decode the payload into a typed value
    pub fn payload<T: DeserializeOwned>(&self) -> CoreResult<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            CoreError::DecodeError(format!("Invalid {} payload: {}", self.event_type, e))
        })
    }

    /// Producer timestamp, if the envelope carries one
    pub fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
        (self.timestamp > 0).then(|| Utc.timestamp_nanos(self.timestamp))
    }
}

/// Payload of `<kind>.deleted` events; extra fields are ignored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
    /// Entity id
    #[serde(default)]
    pub id: String,
}

/// Payload of `resource-provider.set-resources`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetResourcesPayload {
    /// Provider asserting ownership
    pub provider_id: String,
    /// Full set of resources the provider owns
    #[serde(default)]
    pub resources: Vec<Resource>,
}

/// Payload of `job-verification.started`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationStartedPayload {
    /// Verification id; defaults to the job id
    #[serde(default)]
    pub id: Option<String>,
    /// Verified job
    pub job_id: String,
}

/// Payload of `job-verification.completed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationCompletedPayload {
    /// Verification id; defaults to the job id
    #[serde(default)]
    pub id: Option<String>,
    /// Verified job
    pub job_id: String,
    /// Probe outcome
    pub passed: bool,
    /// Optional message
    #[serde(default)]
    pub message: Option<String>,
}

/// Side effect produced by live event processing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundEvent {
    /// A job was created and must be dispatched
    JobCreated {
        /// The new job
        job: Job,
    },
    /// The engine changed a job (e.g. cancelled it)
    JobUpdated {
        /// The job after the change
        job: Job,
        /// Status before the change
        previous_status: JobStatus,
    },
    /// A successful job should be verified
    VerificationRequested {
        /// Job to verify
        job_id: String,
        /// Release the job deployed
        release_id: String,
        /// Target the job deployed to
        release_target: ReleaseTarget,
    },
}

impl OutboundEvent {
    /// Log envelope for events that are published back onto the log
    pub fn to_envelope(&self, workspace_id: &str) -> CoreResult<Option<EventEnvelope>> {
        let envelope = match self {
            OutboundEvent::JobCreated { job } => Some(EventEnvelope::new(
                EventType::JobCreated,
                workspace_id,
                serde_json::to_value(job)?,
            )),
            OutboundEvent::JobUpdated { job, .. } => Some(EventEnvelope::new(
                EventType::JobUpdated,
                workspace_id,
                serde_json::to_value(job)?,
            )),
            OutboundEvent::VerificationRequested { .. } => None,
        };
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_type_names() {
        assert_eq!(
            "deployment-version.created".parse::<EventType>().unwrap(),
            EventType::Entity(EntityKind::DeploymentVersion, EntityAction::Created)
        );
        assert_eq!(
            "resource-provider.set-resources".parse::<EventType>().unwrap(),
            EventType::ResourceProviderSetResources
        );
        assert_eq!("job.update".parse::<EventType>().unwrap(), EventType::JobUpdate);
        assert!(matches!(
            "job.explode".parse::<EventType>(),
            Err(CoreError::UnknownEventType(_))
        ));
    }

    #[test]
    fn test_every_type_round_trips_through_its_name() {
        for event_type in EventType::all() {
            assert_eq!(event_type.to_string().parse::<EventType>().unwrap(), event_type);
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(EventEnvelope::decode(b"not json"), Err(CoreError::DecodeError(_))));
        assert!(matches!(
            EventEnvelope::decode(br#"{"eventType":"system.created","workspaceId":""}"#),
            Err(CoreError::DecodeError(_))
        ));
    }

    #[test]
    fn test_envelope_wire_form() {
        let envelope = EventEnvelope::new(
            EventType::WorkspaceSave,
            "ws-1",
            json!({}),
        )
        .at(Utc.timestamp_nanos(1_700_000_000_000_000_001));
        let bytes = envelope.encode().unwrap();
        let decoded = EventEnvelope::decode(&bytes).unwrap();

        assert_eq!(decoded.event_type, "workspace.save");
        assert_eq!(decoded.timestamp_utc(), Some(Utc.timestamp_nanos(1_700_000_000_000_000_001)));
        assert_eq!(decoded.kind().unwrap(), EventType::WorkspaceSave);
    }

    #[test]
    fn test_payload_decode_error_names_event() {
        let envelope = EventEnvelope::new(
            EventType::ResourceProviderSetResources,
            "ws",
            json!({ "resources": [] }),
        );
        match envelope.payload::<SetResourcesPayload>() {
            Err(CoreError::DecodeError(msg)) => assert!(msg.contains("resource-provider.set-resources")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
