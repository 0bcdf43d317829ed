//! Event handlers.
//!
//! Entity events share two generic handlers, [`upsert`] and [`delete`]; the
//! per-kind behaviour (normalisation, validation and invalidation of derived
//! state) lives in the [`EntityHandler`] impls. Payloads are decoded and
//! validated before anything is written, so a rejected event leaves the
//! workspace untouched.

use crate::state::StoredEntity;
use crate::store::{Change, ChangeKind};
use crate::workspace::Workspace;
use rollout_core::{
    ids, CoreError, CoreResult, Deployment, DeploymentVersion, EntityHandle, EntityKind, EntityRef,
    Environment, EventEnvelope, Job, JobAgent, JobPatch, JobStatus, Policy, Resource,
    ResourceProvider, ResourceVariable, RelationshipRule, SetResourcesPayload, System,
    UserApprovalRecord,
};
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Per-kind hooks for entity events
pub(crate) trait EntityHandler: StoredEntity {
    /// Normalise and validate an incoming entity
    fn prepare(self, _ws: &Workspace) -> CoreResult<Self> {
        Ok(self)
    }

    /// Store key named by a delete payload
    fn delete_key(data: &Value) -> CoreResult<String> {
        let reference: EntityRef = serde_json::from_value(data.clone())
            .map_err(|e| CoreError::DecodeError(format!("Invalid delete payload: {}", e)))?;
        if reference.id.is_empty() {
            return Err(CoreError::ValidationError("Delete payload has no id".to_string()));
        }
        Ok(reference.id)
    }

    /// Bring derived state up to date after a change
    fn on_change(_ws: &mut Workspace, _change: &Change<Self>) {}
}

/// `<kind>.created` / `<kind>.updated`
pub(crate) fn upsert<T: EntityHandler>(ws: &mut Workspace, event: &EventEnvelope) -> CoreResult<()> {
    let entity: T = event.payload()?;
    let entity = entity.prepare(ws)?;
    match ws.write(entity) {
        Some(change) => {
            debug!(workspace_id = %ws.id(), kind = %T::KIND, id = %change.id(), change = ?change.kind, "Entity written");
            T::on_change(ws, &change);
        }
        None => debug!(workspace_id = %ws.id(), kind = %T::KIND, "No-op write"),
    }
    Ok(())
}

/// `<kind>.deleted`
pub(crate) fn delete<T: EntityHandler>(ws: &mut Workspace, event: &EventEnvelope) -> CoreResult<()> {
    let id = T::delete_key(&event.data)?;
    remove::<T>(ws, &id);
    Ok(())
}

fn remove<T: EntityHandler>(ws: &mut Workspace, id: &str) {
    match ws.delete::<T>(id) {
        Some(change) => {
            debug!(workspace_id = %ws.id(), kind = %T::KIND, id = %id, "Entity deleted");
            T::on_change(ws, &change);
        }
        None => debug!(workspace_id = %ws.id(), kind = %T::KIND, id = %id, "Delete of unknown entity"),
    }
}

fn validate_selector(selector: Option<&rollout_core::Selector>, owner: &str) -> CoreResult<()> {
    match selector {
        Some(selector) => selector
            .validate()
            .map_err(|e| CoreError::ValidationError(format!("{}: {}", owner, e))),
        None => Ok(()),
    }
}

fn fill_workspace(workspace_id: &mut String, ws: &Workspace) {
    if workspace_id.is_empty() {
        *workspace_id = ws.id().to_string();
    }
}

impl EntityHandler for System {
    fn prepare(mut self, ws: &Workspace) -> CoreResult<Self> {
        fill_workspace(&mut self.workspace_id, ws);
        Ok(self)
    }

    fn on_change(ws: &mut Workspace, change: &Change<Self>) {
        if change.kind != ChangeKind::Deleted {
            return;
        }
        let system_id = change.id().to_string();
        let deployments: Vec<String> = ws
            .stores
            .deployments
            .values()
            .filter(|d| d.system_id == system_id)
            .map(|d| d.id.clone())
            .collect();
        let environments: Vec<String> = ws
            .stores
            .environments
            .values()
            .filter(|e| e.system_id == system_id)
            .map(|e| e.id.clone())
            .collect();
        for id in deployments {
            remove::<Deployment>(ws, &id);
        }
        for id in environments {
            remove::<Environment>(ws, &id);
        }
    }
}

impl EntityHandler for Deployment {
    fn prepare(self, _ws: &Workspace) -> CoreResult<Self> {
        validate_selector(self.resource_selector.as_ref(), &format!("deployment {}", self.id))?;
        Ok(self)
    }

    fn on_change(ws: &mut Workspace, change: &Change<Self>) {
        let id = change.id().to_string();
        let diff = ws.release_targets.refresh_deployment(&ws.stores, &ws.cache, &id);
        ws.apply_target_diff(diff);
        let targets = ws.release_targets.for_deployment(&id);
        ws.refresh_targets(&targets);
        ws.refresh_relations(&EntityHandle::new(EntityKind::Deployment, &id));

        if change.kind == ChangeKind::Deleted {
            let versions: Vec<String> = ws
                .stores
                .deployment_versions
                .values()
                .filter(|v| v.deployment_id == id)
                .map(|v| v.id.clone())
                .collect();
            for version_id in versions {
                remove::<DeploymentVersion>(ws, &version_id);
            }
        }
    }
}

impl EntityHandler for Environment {
    fn prepare(self, _ws: &Workspace) -> CoreResult<Self> {
        validate_selector(self.resource_selector.as_ref(), &format!("environment {}", self.id))?;
        Ok(self)
    }

    fn on_change(ws: &mut Workspace, change: &Change<Self>) {
        let id = change.id().to_string();
        let diff = ws.release_targets.refresh_environment(&ws.stores, &ws.cache, &id);
        ws.apply_target_diff(diff);
        let targets = ws.release_targets.for_environment(&id);
        ws.refresh_targets(&targets);
        ws.refresh_relations(&EntityHandle::new(EntityKind::Environment, &id));
    }
}

impl EntityHandler for Resource {
    /// Provider-owned resources can only be written by events carrying the
    /// owner's id, and identifiers are unique per workspace
    fn prepare(mut self, ws: &Workspace) -> CoreResult<Self> {
        fill_workspace(&mut self.workspace_id, ws);

        if let Some(existing) = ws.stores.resources.get(&self.id) {
            if let Some(owner) = &existing.provider_id {
                if self.provider_id.as_ref() != Some(owner) {
                    return Err(CoreError::OwnershipViolation(format!(
                        "resource {} is owned by provider {}",
                        self.id, owner
                    )));
                }
            }
        }
        if let Some(holder) = ws.stores.resource_by_identifier(&self.identifier) {
            if holder.id != self.id {
                return Err(CoreError::ValidationError(format!(
                    "identifier {} already belongs to resource {}",
                    self.identifier, holder.id
                )));
            }
        }
        Ok(self)
    }

    fn on_change(ws: &mut Workspace, change: &Change<Self>) {
        let id = change.id().to_string();
        let diff = ws.release_targets.refresh_resource(&ws.stores, &ws.cache, &id);
        ws.apply_target_diff(diff);
        let targets = ws.release_targets.for_resource(&id);
        ws.refresh_targets(&targets);
        ws.refresh_relations(&EntityHandle::new(EntityKind::Resource, &id));

        if change.kind == ChangeKind::Deleted {
            let variables: Vec<String> = ws
                .stores
                .variables_for_resource(&id)
                .iter()
                .map(|v| v.id.clone())
                .collect();
            for variable_id in variables {
                remove::<ResourceVariable>(ws, &variable_id);
            }
        }
    }
}

impl EntityHandler for ResourceProvider {
    fn prepare(mut self, ws: &Workspace) -> CoreResult<Self> {
        fill_workspace(&mut self.workspace_id, ws);
        Ok(self)
    }

    /// A deleted provider takes its resources with it
    fn on_change(ws: &mut Workspace, change: &Change<Self>) {
        if change.kind != ChangeKind::Deleted {
            return;
        }
        let provider_id = change.id().to_string();
        let owned: Vec<String> = ws
            .stores
            .resources
            .values()
            .filter(|r| r.provider_id.as_deref() == Some(provider_id.as_str()))
            .map(|r| r.id.clone())
            .collect();
        for id in owned {
            remove::<Resource>(ws, &id);
        }
    }
}

impl EntityHandler for DeploymentVersion {
    fn prepare(mut self, _ws: &Workspace) -> CoreResult<Self> {
        if self.name.is_empty() {
            self.name = self.tag.clone();
        }
        Ok(self)
    }

    fn on_change(ws: &mut Workspace, change: &Change<Self>) {
        if change.kind == ChangeKind::Deleted {
            ws.unblock_version(change.id());
        }
        let deployments: BTreeSet<String> = change
            .old
            .iter()
            .chain(change.new.iter())
            .map(|v| v.deployment_id.clone())
            .collect();
        for deployment_id in deployments {
            let targets = ws.release_targets.for_deployment(&deployment_id);
            ws.mark_targets_dirty(&targets);
        }
    }
}

impl EntityHandler for JobAgent {
    fn prepare(mut self, ws: &Workspace) -> CoreResult<Self> {
        fill_workspace(&mut self.workspace_id, ws);
        Ok(self)
    }

    fn on_change(ws: &mut Workspace, change: &Change<Self>) {
        let agent_id = change.id().to_string();
        let deployments: Vec<String> = ws
            .stores
            .deployments
            .values()
            .filter(|d| d.job_agent_id.as_deref() == Some(agent_id.as_str()))
            .map(|d| d.id.clone())
            .collect();
        for deployment_id in deployments {
            let targets = ws.release_targets.for_deployment(&deployment_id);
            ws.mark_targets_dirty(&targets);
        }
    }
}

impl EntityHandler for Policy {
    fn prepare(mut self, ws: &Workspace) -> CoreResult<Self> {
        fill_workspace(&mut self.workspace_id, ws);
        for selector in &self.selectors {
            let owner = format!("policy {}", self.id);
            validate_selector(selector.deployment_selector.as_ref(), &owner)?;
            validate_selector(selector.environment_selector.as_ref(), &owner)?;
            validate_selector(selector.resource_selector.as_ref(), &owner)?;
        }
        Ok(self)
    }

    fn on_change(ws: &mut Workspace, change: &Change<Self>) {
        let policy_id = change.id().to_string();
        let previously = ws.policy_targets.targets_for_policy(&policy_id);
        let changed = ws.policy_targets.refresh_policy(
            &ws.stores,
            &ws.cache,
            &policy_id,
            ws.release_targets.items().values(),
        );
        let now = ws.policy_targets.targets_for_policy(&policy_id);

        let affected: BTreeSet<String> = previously.into_iter().chain(changed).chain(now).collect();
        for key in affected {
            ws.mark_dirty(&key);
        }
    }
}

impl EntityHandler for UserApprovalRecord {
    fn prepare(self, _ws: &Workspace) -> CoreResult<Self> {
        Ok(self.normalized())
    }

    fn delete_key(data: &Value) -> CoreResult<String> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Key {
            #[serde(default)]
            id: String,
            version_id: Option<String>,
            environment_id: Option<String>,
            user_id: Option<String>,
        }
        let key: Key = serde_json::from_value(data.clone())
            .map_err(|e| CoreError::DecodeError(format!("Invalid approval delete payload: {}", e)))?;
        match (key.version_id, key.environment_id, key.user_id) {
            (Some(v), Some(e), Some(u)) => Ok(UserApprovalRecord::key(&v, &e, &u)),
            _ if !key.id.is_empty() => Ok(key.id),
            _ => Err(CoreError::ValidationError(
                "Approval delete needs an id or versionId, environmentId and userId".to_string(),
            )),
        }
    }

    fn on_change(ws: &mut Workspace, change: &Change<Self>) {
        let Some(record) = change.new.as_ref().or(change.old.as_ref()) else {
            return;
        };
        let Some(version) = ws.stores.deployment_versions.get(&record.version_id) else {
            return;
        };
        let environment_id = record.environment_id.clone();
        let targets: Vec<_> = ws
            .release_targets
            .for_deployment(&version.deployment_id)
            .into_iter()
            .filter(|t| t.environment_id == environment_id)
            .collect();
        ws.mark_targets_dirty(&targets);
    }
}

impl EntityHandler for RelationshipRule {
    fn prepare(mut self, ws: &Workspace) -> CoreResult<Self> {
        fill_workspace(&mut self.workspace_id, ws);
        let owner = format!("relationship rule {}", self.id);
        validate_selector(self.from_selector.as_ref(), &owner)?;
        validate_selector(self.to_selector.as_ref(), &owner)?;
        Ok(self)
    }

    fn on_change(ws: &mut Workspace, change: &Change<Self>) {
        let touched = ws.relationships.refresh_rule(&ws.stores, &ws.cache, change.id());
        ws.dirty_related_resources(touched);
    }
}

impl EntityHandler for ResourceVariable {
    fn prepare(self, ws: &Workspace) -> CoreResult<Self> {
        if !ws.stores.resources.contains(&self.resource_id) {
            return Err(CoreError::EntityNotFound(format!("resource {}", self.resource_id)));
        }
        Ok(self.normalized())
    }

    fn delete_key(data: &Value) -> CoreResult<String> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Key {
            #[serde(default)]
            id: String,
            resource_id: Option<String>,
            key: Option<String>,
        }
        let key: Key = serde_json::from_value(data.clone())
            .map_err(|e| CoreError::DecodeError(format!("Invalid variable delete payload: {}", e)))?;
        match (key.resource_id, key.key) {
            (Some(resource_id), Some(name)) => Ok(ResourceVariable::key_for(&resource_id, &name)),
            _ if !key.id.is_empty() => Ok(key.id),
            _ => Err(CoreError::ValidationError(
                "Variable delete needs an id or resourceId and key".to_string(),
            )),
        }
    }

    fn on_change(ws: &mut Workspace, change: &Change<Self>) {
        let resources: BTreeSet<String> = change
            .old
            .iter()
            .chain(change.new.iter())
            .map(|v| v.resource_id.clone())
            .collect();
        for resource_id in resources {
            let targets = ws.release_targets.for_resource(&resource_id);
            ws.mark_targets_dirty(&targets);
        }
    }
}

/// `resource-provider.set-resources`: the payload is the provider's complete
/// resource set
pub(crate) fn set_resources(ws: &mut Workspace, event: &EventEnvelope) -> CoreResult<()> {
    let payload: SetResourcesPayload = event.payload()?;
    let provider_id = payload.provider_id;
    if !ws.stores.resource_providers.contains(&provider_id) {
        return Err(CoreError::EntityNotFound(format!("resource provider {}", provider_id)));
    }

    let mut accepted = Vec::new();
    for mut resource in payload.resources {
        match ws.stores.resource_by_identifier(&resource.identifier) {
            Some(existing) if existing.provider_id.as_deref().map_or(false, |owner| owner != provider_id) => {
                warn!(
                    workspace_id = %ws.id(),
                    provider_id = %provider_id,
                    identifier = %resource.identifier,
                    owner = ?existing.provider_id,
                    "Ignoring resource owned by another provider"
                );
                continue;
            }
            Some(existing) => {
                if existing.provider_id.is_none() {
                    info!(workspace_id = %ws.id(), provider_id = %provider_id, identifier = %resource.identifier, "Provider claimed resource");
                }
                resource.id = existing.id.clone();
            }
            None if resource.id.is_empty() => {
                resource.id = ids::resource_id(&provider_id, &resource.identifier);
            }
            None => {}
        }
        resource.provider_id = Some(provider_id.clone());
        fill_workspace(&mut resource.workspace_id, ws);
        accepted.push(resource);
    }

    let keep: BTreeSet<String> = accepted.iter().map(|r| r.identifier.clone()).collect();
    let stale: Vec<String> = ws
        .stores
        .resources
        .values()
        .filter(|r| r.provider_id.as_deref() == Some(provider_id.as_str()))
        .filter(|r| !keep.contains(&r.identifier))
        .map(|r| r.id.clone())
        .collect();

    for resource in accepted {
        if let Some(change) = ws.write(resource) {
            Resource::on_change(ws, &change);
        }
    }
    for id in stale {
        remove::<Resource>(ws, &id);
    }
    Ok(())
}

/// `job.created` / `job.updated`: full jobs echoed back from the log.
///
/// The engine wrote these itself, so the carried timestamps are kept. A
/// `job.created` for a known job is ignored, and a `job.updated` older
/// than the stored job never overwrites it.
pub(crate) fn job_echo(ws: &mut Workspace, event: &EventEnvelope) -> CoreResult<()> {
    let job: Job = event.payload()?;
    if !ws.stores.releases.contains(&job.release_id) {
        return Err(CoreError::ValidationError(format!(
            "job {} references unknown release {}",
            job.id, job.release_id
        )));
    }

    if let Some(existing) = ws.stores.jobs.get(&job.id) {
        if event.event_type == "job.created" || existing.updated_at > job.updated_at {
            debug!(workspace_id = %ws.id(), job_id = %job.id, "Ignoring stale job echo");
            return Ok(());
        }
    }

    if let Some(stored) = ws.write_stamped(job).and_then(|change| change.new) {
        ws.job_index.add_job(&stored);
        if let Some(release) = ws.stores.releases.get(&stored.release_id) {
            let target = release.release_target.clone();
            ws.mark_dirty(&target.key());
        }
    }
    Ok(())
}

/// `job.update`: partial update reported by a job agent
pub(crate) fn job_update(ws: &mut Workspace, event: &EventEnvelope) -> CoreResult<()> {
    let patch: JobPatch = event.payload()?;
    let mut job = ws
        .stores
        .jobs
        .get(&patch.job_id)
        .cloned()
        .ok_or_else(|| CoreError::EntityNotFound(format!("job {}", patch.job_id)))?;

    let previous = patch.apply(&mut job);
    let stamp = ws.next_stamp();
    if job.status == JobStatus::InProgress && job.started_at.is_none() {
        job.started_at = Some(stamp);
    }
    if job.status.is_terminal() && job.completed_at.is_none() {
        job.completed_at = Some(stamp);
    }

    let Some(stored) = ws.write(job).and_then(|change| change.new) else {
        return Ok(());
    };
    if let Some(previous) = previous {
        info!(
            workspace_id = %ws.id(),
            job_id = %stored.id,
            from = ?previous,
            to = ?stored.status,
            "Job status changed"
        );
        crate::verification::on_job_status_change(ws, &stored);
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
struct TickPayload {
    #[serde(default)]
    timestamp: Option<i64>,
}

/// `workspace.tick`: re-plan every target whose deadline has passed
pub(crate) fn tick(ws: &mut Workspace, event: &EventEnvelope) -> CoreResult<()> {
    let payload: TickPayload = if event.data.is_null() { TickPayload::default() } else { event.payload()? };
    let mut now = ws.now();
    if let Some(at) = payload.timestamp.filter(|ns| *ns > 0).map(|ns| Utc.timestamp_nanos(ns)) {
        now = now.max(at);
    }
    if let Some(at) = event.timestamp_utc() {
        now = now.max(at);
    }

    ws.evaluation_time = Some(now);

    for entry in ws.scheduler.pop_due(now) {
        debug!(workspace_id = %ws.id(), target = %entry.target_key, reason = %entry.reason, "Deadline reached");
        ws.mark_dirty(&entry.target_key);
    }
    Ok(())
}

/// `workspace.save`: the server takes the snapshot once the event is applied
pub(crate) fn save(_ws: &mut Workspace, _event: &EventEnvelope) -> CoreResult<()> {
    Ok(())
}
