//! Harnesses driving the engine and the server in tests

use crate::builders::EntityBuilder;
use crate::implementations::{RecordingJobDispatcher, RecordingVerificationRunner, StaticInitialStateLoader};
use chrono::{DateTime, Duration, TimeZone, Utc};
use rollout_core::{
    CoreResult, EventEnvelope, EventType, Job, JobPatch, JobPatchValues, JobStatus, JobUpdateField, OutboundEvent,
    ReleaseTarget,
};
use rollout_engine::{ApplyMode, ApplyOutcome, Clock, EngineConfig, ManualClock, Workspace, WorkspaceHandle, WorkspaceRegistry};
use rollout_server::consumer::{ConsumerContext, ConsumerStats, PartitionConsumer};
use rollout_server::retry::RetryPolicy;
use rollout_server::snapshots::SnapshotManager;
use rollout_server::ticker::Ticker;
use rollout_server::{InMemoryPartitionLog, Outbox, PartitionLog, ServerResult};
use rollout_snapshot_store::{InMemorySnapshotStorage, SnapshotRegistry, StorageSnapshotRegistry};
use serde_json::json;
use std::sync::Arc;

/// Workspace id used by [`EngineHarness`]
pub const TEST_WORKSPACE: &str = "ws-test";

/// Fixed start of the manual clock
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap()
}

/// Patch setting a job's status
pub fn status_update(workspace_id: &str, job_id: &str, status: JobStatus) -> EventEnvelope {
    let patch = JobPatch {
        job_id: job_id.to_string(),
        fields_to_update: vec![JobUpdateField::Status],
        job: JobPatchValues { status: Some(status), ..JobPatchValues::default() },
    };
    EventEnvelope::new(EventType::JobUpdate, workspace_id, serde_json::to_value(patch).unwrap())
}

/// A single workspace applied to directly, on a manual clock
pub struct EngineHarness {
    /// Clock shared with the workspace
    pub clock: Arc<ManualClock>,
    /// Workspace under test
    pub ws: Workspace,
    outbound: Vec<OutboundEvent>,
}

impl Default for EngineHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineHarness {
    /// Harness with the default engine settings
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Harness with explicit engine settings
    pub fn with_config(config: EngineConfig) -> Self {
        let clock = Arc::new(ManualClock::new(start_time()));
        let ws = Workspace::new(TEST_WORKSPACE, config, clock.clone());
        Self { clock, ws, outbound: Vec::new() }
    }

    /// Apply an event live, keeping its outbound events
    pub fn try_apply(&mut self, envelope: &EventEnvelope) -> CoreResult<ApplyOutcome> {
        let outcome = self.ws.apply(envelope, ApplyMode::Live)?;
        self.outbound.extend(outcome.outbound.iter().cloned());
        Ok(outcome)
    }

    /// Apply an event live; panics if it is rejected
    pub fn apply(&mut self, envelope: &EventEnvelope) -> ApplyOutcome {
        match self.try_apply(envelope) {
            Ok(outcome) => outcome,
            Err(e) => panic!("{} rejected: {}", envelope.event_type, e),
        }
    }

    /// `<kind>.created`
    pub fn create(&mut self, entity: EntityBuilder) -> ApplyOutcome {
        self.apply(&entity.created(TEST_WORKSPACE))
    }

    /// `<kind>.updated`
    pub fn update(&mut self, entity: EntityBuilder) -> ApplyOutcome {
        self.apply(&entity.updated(TEST_WORKSPACE))
    }

    /// `<kind>.deleted`
    pub fn delete(&mut self, entity: EntityBuilder) -> ApplyOutcome {
        self.apply(&entity.deleted(TEST_WORKSPACE))
    }

    /// Move the clock forward
    pub fn advance(&mut self, by: Duration) {
        self.clock.advance(by);
    }

    /// `workspace.tick` stamped with the current time
    pub fn tick(&mut self) -> ApplyOutcome {
        let now = self.clock.now();
        let timestamp = now.timestamp_nanos_opt().unwrap_or_default();
        self.apply(&EventEnvelope::new(EventType::WorkspaceTick, TEST_WORKSPACE, json!({ "timestamp": timestamp })).at(now))
    }

    /// `job.update` setting a job's status
    pub fn set_status(&mut self, job_id: &str, status: JobStatus) -> ApplyOutcome {
        self.apply(&status_update(TEST_WORKSPACE, job_id, status))
    }

    /// Every job, oldest first
    pub fn jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.ws.stores().jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    /// Jobs of one release target, oldest first
    pub fn jobs_for(&self, target: &ReleaseTarget) -> Vec<Job> {
        let key = target.key();
        self.jobs()
            .into_iter()
            .filter(|job| {
                self.ws.stores().releases.get(&job.release_id).map_or(false, |release| release.release_target_key() == key)
            })
            .collect()
    }

    /// Most recent job; panics if there is none
    pub fn latest_job(&self) -> Job {
        self.jobs().pop().expect("no jobs")
    }

    /// Version tag deployed by a job
    pub fn tag_of(&self, job: &Job) -> String {
        self.ws
            .stores()
            .releases
            .get(&job.release_id)
            .map(|release| release.version.tag.clone())
            .unwrap_or_default()
    }

    /// Tags of every job, oldest first
    pub fn job_tags(&self) -> Vec<String> {
        self.jobs().iter().map(|job| self.tag_of(job)).collect()
    }

    /// Outbound events collected so far
    pub fn outbound(&self) -> &[OutboundEvent] {
        &self.outbound
    }

    /// Drain the collected outbound events
    pub fn take_outbound(&mut self) -> Vec<OutboundEvent> {
        std::mem::take(&mut self.outbound)
    }
}

/// Partition consumers over in-memory backends.
///
/// The log, snapshot storage, registry, loader and fakes outlive
/// [`restart`](Self::restart), which only drops in-process state.
pub struct ServerHarness {
    /// Clock shared with every workspace
    pub clock: Arc<ManualClock>,
    /// Event log
    pub log: Arc<InMemoryPartitionLog>,
    /// Snapshot blobs
    pub storage: Arc<InMemorySnapshotStorage>,
    /// Snapshot registry rows
    pub registry: Arc<dyn SnapshotRegistry>,
    /// Bootstrap rows
    pub loader: Arc<StaticInitialStateLoader>,
    /// Job agent fake
    pub dispatcher: Arc<RecordingJobDispatcher>,
    /// Verification fake
    pub verifier: Arc<RecordingVerificationRunner>,
    /// Consumer collaborators of the current process
    pub ctx: ConsumerContext,
}

impl ServerHarness {
    /// Fresh backends with `num_partitions` partitions
    pub fn new(num_partitions: i32) -> Self {
        let storage = Arc::new(InMemorySnapshotStorage::new());
        let registry: Arc<dyn SnapshotRegistry> = Arc::new(StorageSnapshotRegistry::new(storage.clone()));
        let clock = Arc::new(ManualClock::new(start_time()));
        let log = Arc::new(InMemoryPartitionLog::new(num_partitions));
        let loader = Arc::new(StaticInitialStateLoader::new());
        let dispatcher = Arc::new(RecordingJobDispatcher::new());
        let verifier = Arc::new(RecordingVerificationRunner::new());
        let ctx = Self::context(&clock, &log, &storage, &registry, &loader, &dispatcher, &verifier, num_partitions);
        Self { clock, log, storage, registry, loader, dispatcher, verifier, ctx }
    }

    #[allow(clippy::too_many_arguments)]
    fn context(
        clock: &Arc<ManualClock>,
        log: &Arc<InMemoryPartitionLog>,
        storage: &Arc<InMemorySnapshotStorage>,
        registry: &Arc<dyn SnapshotRegistry>,
        loader: &Arc<StaticInitialStateLoader>,
        dispatcher: &Arc<RecordingJobDispatcher>,
        verifier: &Arc<RecordingVerificationRunner>,
        num_partitions: i32,
    ) -> ConsumerContext {
        let retry = RetryPolicy::new(2, std::time::Duration::from_millis(1));
        let workspaces = Arc::new(WorkspaceRegistry::new(EngineConfig::default(), clock.clone()));
        let outbox = Outbox::new(
            log.producer(),
            num_partitions,
            dispatcher.clone(),
            verifier.clone(),
            workspaces.clone(),
            retry,
        )
        .with_dispatch_backoff(RetryPolicy::new(3, std::time::Duration::ZERO));
        ConsumerContext {
            workspaces,
            snapshots: Arc::new(SnapshotManager::new(storage.clone(), registry.clone(), num_partitions, retry)),
            loader: loader.clone(),
            outbox: Arc::new(outbox),
            stats: Arc::new(ConsumerStats::new()),
            num_partitions,
            retry,
        }
    }

    /// Partition count
    pub fn num_partitions(&self) -> i32 {
        self.ctx.num_partitions
    }

    /// Simulate a process restart: same backends, no workspaces in memory
    pub fn restart(&mut self) {
        self.ctx = Self::context(
            &self.clock,
            &self.log,
            &self.storage,
            &self.registry,
            &self.loader,
            &self.dispatcher,
            &self.verifier,
            self.ctx.num_partitions,
        );
    }

    /// Consumer for `partition`, not yet started
    pub fn consumer(&self, partition: i32) -> ServerResult<PartitionConsumer> {
        Ok(PartitionConsumer::new(self.log.reader(partition)?, self.ctx.clone()))
    }

    /// Ticker covering every partition
    pub fn ticker(&self) -> Ticker {
        Ticker::new(
            self.ctx.workspaces.clone(),
            self.ctx.outbox.clone(),
            0..self.ctx.num_partitions,
            self.ctx.num_partitions,
            std::time::Duration::from_millis(10),
        )
    }

    /// Append an event to its workspace's partition
    pub async fn append(&self, envelope: &EventEnvelope) -> ServerResult<i64> {
        self.ctx.outbox.append(envelope).await
    }

    /// Append `<kind>.created` for `entity` in `workspace_id`
    pub async fn create(&self, workspace_id: &str, entity: &EntityBuilder) -> ServerResult<i64> {
        self.append(&entity.created(workspace_id)).await
    }

    /// Loaded workspace
    pub fn workspace(&self, workspace_id: &str) -> Option<WorkspaceHandle> {
        self.ctx.workspaces.get(workspace_id)
    }

    /// Decoded events of `partition`, in offset order
    pub fn events(&self, partition: i32) -> Vec<EventEnvelope> {
        self.log
            .records(partition)
            .iter()
            .filter_map(|record| EventEnvelope::decode(&record.payload).ok())
            .collect()
    }

    /// Event types of `partition`, in offset order
    pub fn event_types(&self, partition: i32) -> Vec<String> {
        self.events(partition).into_iter().map(|event| event.event_type).collect()
    }
}
