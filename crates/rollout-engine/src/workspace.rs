//! A workspace: one tenant's complete engine state.
//!
//! A workspace owns its entity stores plus every structure derived from
//! them (release targets, policy matchings, job and relationship indexes,
//! the plan cache and the scheduler). It is a single-writer domain: the
//! router mutates it under the registry's write lock and every derived
//! structure is brought up to date before the lock is released.

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::index::{JobIndex, PolicyTargetIndex, ReleaseTargetIndex, TargetDiff};
use crate::planner::{self, PlanOutcome, WorldView};
use crate::relationships::RelationshipIndex;
use crate::scheduler::{ScheduledEntry, Scheduler};
use crate::state::{StoredEntity, Stores};
use crate::store::Change;
use chrono::{DateTime, Duration, Utc};
use rollout_core::{
    CoreError, CoreResult, EntityHandle, EntityKind, EntityRelation, Job, JobStatus,
    MatchCache, MatchCacheStats, OutboundEvent, ReleaseTarget, ReleaseTargetState,
};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How an event is being applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Normal processing: reconcile and emit outbound events
    Live,
    /// Catching up to a snapshot: mutate state only
    Replay,
}

/// A rollback waiting for the reconciler
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RollbackRequest {
    pub target_key: String,
    pub release_id: String,
    pub failed_job_id: String,
}

/// One tenant's engine state
pub struct Workspace {
    id: String,
    pub(crate) config: EngineConfig,
    clock: Arc<dyn Clock>,

    pub(crate) stores: Stores,
    pub(crate) cache: MatchCache,
    pub(crate) release_targets: ReleaseTargetIndex,
    pub(crate) policy_targets: PolicyTargetIndex,
    pub(crate) job_index: JobIndex,
    pub(crate) relationships: RelationshipIndex,
    pub(crate) scheduler: Scheduler,
    pub(crate) rollback_blocks: BTreeMap<String, BTreeSet<String>>,

    pub(crate) plans: BTreeMap<String, PlanOutcome>,
    pub(crate) dirty: BTreeSet<String>,
    pub(crate) pending_rollbacks: Vec<RollbackRequest>,
    pub(crate) outbound: Vec<OutboundEvent>,
    pub(crate) mode: ApplyMode,
    pub(crate) event_time: Option<DateTime<Utc>>,
    /// Planning time of the current event when it is ahead of the clock
    pub(crate) evaluation_time: Option<DateTime<Utc>>,
    pub(crate) last_stamp: Option<DateTime<Utc>>,

    pub(crate) last_processed_offset: i64,
    pub(crate) snapshot_offset: i64,
    pub(crate) snapshot_extra: Map<String, Value>,
    quarantined: Option<String>,
}

impl Workspace {
    /// Empty workspace
    pub fn new(id: impl Into<String>, config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let cache = MatchCache::new(config.match_cache_capacity);
        Self {
            id: id.into(),
            config,
            clock,
            stores: Stores::default(),
            cache,
            release_targets: ReleaseTargetIndex::new(),
            policy_targets: PolicyTargetIndex::new(),
            job_index: JobIndex::new(),
            relationships: RelationshipIndex::new(),
            scheduler: Scheduler::new(),
            rollback_blocks: BTreeMap::new(),
            plans: BTreeMap::new(),
            dirty: BTreeSet::new(),
            pending_rollbacks: Vec::new(),
            outbound: Vec::new(),
            mode: ApplyMode::Live,
            event_time: None,
            evaluation_time: None,
            last_stamp: None,
            last_processed_offset: -1,
            snapshot_offset: -1,
            snapshot_extra: Map::new(),
            quarantined: None,
        }
    }

    /// Workspace built from existing stores, with every derived structure
    /// rebuilt and every target marked for re-planning
    pub fn from_stores(id: impl Into<String>, stores: Stores, config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let mut workspace = Self::new(id, config, clock);
        workspace.stores = stores;
        workspace.rebuild_indexes();
        workspace
    }

    /// Workspace id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Engine settings
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Entity stores
    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Current wall-clock time
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Offset of the last event applied from the log (−1 if none)
    pub fn last_processed_offset(&self) -> i64 {
        self.last_processed_offset
    }

    /// Record the offset of an applied event
    pub fn set_last_processed_offset(&mut self, offset: i64) {
        self.last_processed_offset = self.last_processed_offset.max(offset);
    }

    /// Offset covered by the snapshot this workspace was loaded from (−1 if
    /// none). Events at or below it are replayed.
    pub fn snapshot_offset(&self) -> i64 {
        self.snapshot_offset
    }

    /// Override the snapshot offset, e.g. from the snapshot registry
    pub fn set_snapshot_offset(&mut self, offset: i64) {
        self.snapshot_offset = offset;
    }

    /// Why the workspace stopped accepting events, if it did
    pub fn quarantine_reason(&self) -> Option<&str> {
        self.quarantined.as_deref()
    }

    /// Whether the workspace stopped accepting events
    pub fn is_quarantined(&self) -> bool {
        self.quarantined.is_some()
    }

    /// Stop accepting events
    pub fn quarantine(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(workspace_id = %self.id, reason = %reason, "Quarantining workspace");
        self.quarantined = Some(reason);
    }

    /// Every release target, ordered by key
    pub fn release_targets(&self) -> Vec<ReleaseTarget> {
        self.release_targets.items().values().cloned().collect()
    }

    /// Release target by key
    pub fn release_target(&self, key: &str) -> Option<&ReleaseTarget> {
        self.release_targets.get(key)
    }

    /// Current, desired and latest-job view of a target
    pub fn release_target_state(&self, target: &ReleaseTarget) -> ReleaseTargetState {
        let key = target.key();
        let desired = match self.plans.get(&key) {
            Some(plan) => plan.desired.clone(),
            None => self.plan(target).desired,
        };
        ReleaseTargetState {
            current_release: self.job_index.current_release(&self.stores, &key).cloned(),
            desired_release: desired,
            latest_job: self.job_index.latest_job(&self.stores, &key).cloned(),
        }
    }

    /// Planner output for a target, from the plan cache when fresh
    pub fn plan(&self, target: &ReleaseTarget) -> PlanOutcome {
        match self.plans.get(&target.key()) {
            Some(plan) if !self.dirty.contains(&target.key()) => plan.clone(),
            _ => planner::plan(&self.view(), target),
        }
    }

    /// Jobs of every release of a target, oldest first
    pub fn jobs_for_target(&self, target: &ReleaseTarget) -> Vec<&Job> {
        self.job_index.jobs_for_target(&self.stores, &target.key())
    }

    /// Entities of `kind` related to `entity` through any relationship rule
    pub fn related_entities(&self, entity: &EntityHandle, kind: EntityKind) -> Vec<EntityHandle> {
        self.relationships.related_entities(entity, kind)
    }

    /// Relations produced by one rule
    pub fn relations_for_rule(&self, rule_id: &str) -> Vec<EntityRelation> {
        self.relationships.relations_for_rule(rule_id)
    }

    /// Pending scheduler entries
    pub fn scheduled(&self) -> Vec<ScheduledEntry> {
        self.scheduler.entries()
    }

    /// Earliest scheduler deadline
    pub fn next_deadline(&mut self) -> Option<DateTime<Utc>> {
        self.scheduler.next_deadline()
    }

    /// Versions blocked on each target by rollbacks
    pub fn rollback_blocks(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.rollback_blocks
    }

    /// Selector match cache counters
    pub fn match_cache_stats(&self) -> MatchCacheStats {
        self.cache.stats()
    }

    /// Targets waiting for a re-plan
    pub fn dirty_targets(&self) -> Vec<String> {
        self.dirty.iter().cloned().collect()
    }

    pub(crate) fn view(&self) -> WorldView<'_> {
        WorldView {
            stores: &self.stores,
            cache: &self.cache,
            release_targets: &self.release_targets,
            policy_targets: &self.policy_targets,
            jobs: &self.job_index,
            relationships: &self.relationships,
            rollback_blocks: &self.rollback_blocks,
            now: self.evaluation_time.unwrap_or_else(|| self.now()),
        }
    }

    /// Stamp for the next store mutation: the event time (or the clock),
    /// strictly after the previous stamp
    pub(crate) fn next_stamp(&self) -> DateTime<Utc> {
        let base = self.event_time.unwrap_or_else(|| self.clock.now());
        match self.last_stamp {
            Some(last) if base <= last => last + Duration::nanoseconds(1),
            _ => base,
        }
    }

    fn commit_stamp(&mut self, stamp: DateTime<Utc>) {
        if self.last_stamp.map(|last| stamp > last).unwrap_or(true) {
            self.last_stamp = Some(stamp);
        }
    }

    /// Create or update an entity through its store
    pub(crate) fn write<T: StoredEntity>(&mut self, entity: T) -> Option<Change<T>> {
        let stamp = self.next_stamp();
        let change = T::store_mut(&mut self.stores).upsert(entity, stamp)?;
        self.commit_stamp(stamp);
        Some(change)
    }

    /// Write an entity that already carries its timestamps
    pub(crate) fn write_stamped<T: StoredEntity>(&mut self, entity: T) -> Option<Change<T>> {
        let change = T::store_mut(&mut self.stores).put_stamped(entity)?;
        if let Some(stamp) = change.new.as_ref().and_then(|e| e.updated_at().or(e.created_at())) {
            self.commit_stamp(stamp);
        }
        Some(change)
    }

    /// Remove an entity from its store
    pub(crate) fn delete<T: StoredEntity>(&mut self, id: &str) -> Option<Change<T>> {
        T::store_mut(&mut self.stores).remove(id)
    }

    /// Queue a target for re-planning and drop its cached plan
    pub(crate) fn mark_dirty(&mut self, key: &str) {
        self.plans.remove(key);
        self.dirty.insert(key.to_string());
    }

    /// Queue several targets
    pub(crate) fn mark_targets_dirty<'a>(&mut self, targets: impl IntoIterator<Item = &'a ReleaseTarget>) {
        for target in targets {
            self.mark_dirty(&target.key());
        }
    }

    /// Queue every target
    pub(crate) fn mark_all_dirty(&mut self) {
        let keys: Vec<String> = self.release_targets.items().keys().cloned().collect();
        for key in keys {
            self.mark_dirty(&key);
        }
    }

    /// Queue every target that lives on the same environment and resource
    /// as `target` (dependency rules look sideways)
    pub(crate) fn mark_siblings_dirty(&mut self, target: &ReleaseTarget) {
        let siblings: Vec<String> = self
            .release_targets
            .items()
            .values()
            .filter(|t| t.environment_id == target.environment_id && t.resource_id == target.resource_id)
            .map(|t| t.key())
            .collect();
        for key in siblings {
            self.mark_dirty(&key);
        }
    }

    /// Record an outbound side effect; dropped in replay mode
    pub(crate) fn emit(&mut self, event: OutboundEvent) {
        if self.mode == ApplyMode::Live {
            self.outbound.push(event);
        }
    }

    /// Bring policy matchings, plans and the scheduler in line with a
    /// release-target diff
    pub(crate) fn apply_target_diff(&mut self, diff: TargetDiff) {
        for target in &diff.added {
            debug!(workspace_id = %self.id, target = %target, "Release target added");
            self.policy_targets.refresh_target(&self.stores, &self.cache, target);
            self.mark_dirty(&target.key());
        }
        for target in &diff.removed {
            debug!(workspace_id = %self.id, target = %target, "Release target removed");
            let key = target.key();
            self.policy_targets.remove_target(&key);
            self.scheduler.cancel(&key);
            self.plans.remove(&key);
            self.dirty.remove(&key);
            self.rollback_blocks.remove(&key);
            if self.config.cancel_pending_jobs_on_target_removal {
                self.cancel_pending_jobs(&key);
            }
        }
    }

    /// Drop a deleted version from every target's rollback blocks
    pub(crate) fn unblock_version(&mut self, version_id: &str) {
        self.rollback_blocks.retain(|_, versions| {
            versions.remove(version_id);
            !versions.is_empty()
        });
    }

    fn cancel_pending_jobs(&mut self, target_key: &str) {
        let pending: Vec<Job> = self
            .job_index
            .jobs_for_target(&self.stores, target_key)
            .into_iter()
            .filter(|job| job.status == JobStatus::Pending)
            .cloned()
            .collect();

        for mut job in pending {
            let previous_status = job.status;
            job.status = JobStatus::Cancelled;
            job.message = Some("release target removed".to_string());
            if let Some(change) = self.write(job) {
                if let Some(job) = change.new {
                    info!(workspace_id = %self.id, job_id = %job.id, "Cancelled pending job of removed target");
                    self.emit(OutboundEvent::JobUpdated { job, previous_status });
                }
            }
        }
    }

    /// Recompute policy matchings for targets and queue them
    pub(crate) fn refresh_targets(&mut self, targets: &[ReleaseTarget]) {
        for target in targets {
            self.policy_targets.refresh_target(&self.stores, &self.cache, target);
            self.mark_dirty(&target.key());
        }
    }

    /// Recompute relations touching an entity and queue the targets on any
    /// resource whose relations changed
    pub(crate) fn refresh_relations(&mut self, handle: &EntityHandle) {
        let touched = self.relationships.refresh_entity(&self.stores, &self.cache, handle);
        self.dirty_related_resources(touched);
    }

    pub(crate) fn dirty_related_resources(&mut self, touched: BTreeSet<EntityHandle>) {
        for handle in touched {
            if handle.kind == EntityKind::Resource {
                let targets = self.release_targets.for_resource(&handle.id);
                self.mark_targets_dirty(&targets);
            }
        }
    }

    /// Rebuild every derived structure from the stores and queue every
    /// target
    pub(crate) fn rebuild_indexes(&mut self) {
        self.cache.clear();
        self.release_targets = ReleaseTargetIndex::new();
        self.release_targets.rebuild(&self.stores, &self.cache);
        self.policy_targets = PolicyTargetIndex::new();
        self.policy_targets
            .rebuild(&self.stores, &self.cache, self.release_targets.items().values());
        self.job_index = JobIndex::rebuild(&self.stores);
        self.relationships = RelationshipIndex::rebuild(&self.stores, &self.cache);
        self.plans.clear();
        self.mark_all_dirty();
    }

    /// Fail with `WorkspaceQuarantined` if the workspace stopped accepting
    /// events
    pub(crate) fn ensure_active(&self) -> CoreResult<()> {
        match &self.quarantined {
            Some(reason) => Err(CoreError::WorkspaceQuarantined(format!("{}: {}", self.id, reason))),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Workspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workspace")
            .field("id", &self.id)
            .field("release_targets", &self.release_targets.len())
            .field("jobs", &self.stores.jobs.len())
            .field("last_processed_offset", &self.last_processed_offset)
            .field("snapshot_offset", &self.snapshot_offset)
            .field("quarantined", &self.quarantined)
            .finish()
    }
}
