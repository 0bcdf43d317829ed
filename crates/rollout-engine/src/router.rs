//! Event router.
//!
//! Maps every [`EventType`] to its handler and wraps a handler call with the
//! bookkeeping every event needs: the quarantine check, event-time stamping,
//! reconciliation and draining of outbound events.

use crate::handlers::{self, EntityHandler};
use crate::reconciler::{self, ReconcileReport};
use crate::verification;
use crate::workspace::{ApplyMode, Workspace};
use once_cell::sync::Lazy;
use rollout_core::{
    CoreError, CoreResult, Deployment, DeploymentVersion, EntityAction, EntityKind, Environment,
    EventEnvelope, EventType, JobAgent, OutboundEvent, Policy, RelationshipRule, Resource,
    ResourceProvider, ResourceVariable, System, UserApprovalRecord,
};
use std::collections::HashMap;
use tracing::{debug, error};

type Handler = fn(&mut Workspace, &EventEnvelope) -> CoreResult<()>;

fn entity_handlers<T: EntityHandler>(kind: EntityKind, table: &mut HashMap<EventType, Handler>) {
    table.insert(EventType::Entity(kind, EntityAction::Created), handlers::upsert::<T>);
    table.insert(EventType::Entity(kind, EntityAction::Updated), handlers::upsert::<T>);
    table.insert(EventType::Entity(kind, EntityAction::Deleted), handlers::delete::<T>);
}

static HANDLERS: Lazy<HashMap<EventType, Handler>> = Lazy::new(|| {
    let mut table: HashMap<EventType, Handler> = HashMap::new();
    entity_handlers::<System>(EntityKind::System, &mut table);
    entity_handlers::<Deployment>(EntityKind::Deployment, &mut table);
    entity_handlers::<Environment>(EntityKind::Environment, &mut table);
    entity_handlers::<Resource>(EntityKind::Resource, &mut table);
    entity_handlers::<ResourceProvider>(EntityKind::ResourceProvider, &mut table);
    entity_handlers::<DeploymentVersion>(EntityKind::DeploymentVersion, &mut table);
    entity_handlers::<JobAgent>(EntityKind::JobAgent, &mut table);
    entity_handlers::<Policy>(EntityKind::Policy, &mut table);
    entity_handlers::<UserApprovalRecord>(EntityKind::UserApprovalRecord, &mut table);
    entity_handlers::<RelationshipRule>(EntityKind::RelationshipRule, &mut table);
    entity_handlers::<ResourceVariable>(EntityKind::ResourceVariable, &mut table);

    table.insert(EventType::ResourceProviderSetResources, handlers::set_resources);
    table.insert(EventType::JobCreated, handlers::job_echo);
    table.insert(EventType::JobUpdated, handlers::job_echo);
    table.insert(EventType::JobUpdate, handlers::job_update);
    table.insert(EventType::JobVerificationStarted, verification::started);
    table.insert(EventType::JobVerificationCompleted, verification::completed);
    table.insert(EventType::WorkspaceTick, handlers::tick);
    table.insert(EventType::WorkspaceSave, handlers::save);
    table
});

/// Result of applying one event
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyOutcome {
    /// Parsed event type
    pub event_type: EventType,
    /// Side effects to publish or dispatch; empty in replay mode
    pub outbound: Vec<OutboundEvent>,
    /// Whether the caller should snapshot the workspace now
    pub save_requested: bool,
    /// What the reconciler did
    pub report: ReconcileReport,
}

impl Workspace {
    /// Apply one event.
    ///
    /// A rejected event leaves the workspace unchanged and returns its error.
    /// An internal invariant failure quarantines the workspace: this and
    /// every later event fails with `WorkspaceQuarantined`.
    pub fn apply(&mut self, event: &EventEnvelope, mode: ApplyMode) -> CoreResult<ApplyOutcome> {
        self.ensure_active()?;
        if event.workspace_id != self.id() {
            return Err(CoreError::ValidationError(format!(
                "event for workspace {} routed to workspace {}",
                event.workspace_id,
                self.id()
            )));
        }

        let event_type = event.kind()?;
        let handler = HANDLERS
            .get(&event_type)
            .ok_or_else(|| CoreError::UnknownEventType(event.event_type.clone()))?;

        self.mode = mode;
        self.event_time = event.timestamp_utc();
        self.outbound.clear();

        let result = handler(self, event);
        let result = result.map(|()| {
            let report = reconciler::run(self);
            debug!(
                workspace_id = %self.id(),
                event_type = %event_type,
                passes = report.passes,
                planned = report.planned,
                jobs_created = report.jobs_created,
                "Event applied"
            );
            report
        });
        self.event_time = None;
        self.evaluation_time = None;

        match result {
            Ok(report) => Ok(ApplyOutcome {
                event_type,
                outbound: std::mem::take(&mut self.outbound),
                save_requested: event_type == EventType::WorkspaceSave,
                report,
            }),
            Err(err) => {
                self.outbound.clear();
                if err.is_fatal() {
                    error!(workspace_id = %self.id(), event_type = %event_type, error = %err, "Fatal error applying event");
                    self.quarantine(err.to_string());
                }
                Err(err)
            }
        }
    }
}
