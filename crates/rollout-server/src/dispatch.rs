//! Job-agent boundary and the outbox for live side effects.
//!
//! Live event processing returns outbound events. The [`Outbox`] publishes
//! job events back onto the log, hands new jobs to the [`JobDispatcher`] and
//! verification requests to the [`VerificationRunner`]. Dispatch failures
//! are classified: a misconfigured agent turns into a `job.update` setting
//! the job to `invalidJobAgent`; a retryable failure leaves the job pending
//! and queues it for another attempt.

use crate::error::{ServerError, ServerResult};
use crate::log::LogProducer;
use crate::partition::partition_of;
use crate::retry::{with_retry_context, RetryPolicy};
use async_trait::async_trait;
use rollout_core::{
    EventEnvelope, EventType, Job, JobPatch, JobPatchValues, JobStatus, JobUpdateField, OutboundEvent,
    ReleaseTarget,
};
use rollout_engine::WorkspaceRegistry;
use rollout_monitoring::EngineMetrics;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Why a dispatch failed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// The agent may accept the job later (e.g. destination not synced)
    #[error("Retryable dispatch failure: {0}")]
    Retryable(String),
    /// The agent cannot run the job as configured
    #[error("Job agent misconfigured: {0}")]
    Misconfigured(String),
}

/// Hands jobs to job agents
#[async_trait]
pub trait JobDispatcher: Send + Sync + Debug {
    /// Start executing `job`
    async fn dispatch(&self, workspace_id: &str, job: &Job) -> Result<(), DispatchError>;
}

/// Runs post-deploy verification probes
#[async_trait]
pub trait VerificationRunner: Send + Sync + Debug {
    /// Start verifying a successful job; results come back as
    /// `job-verification.*` events
    async fn request(&self, workspace_id: &str, job_id: &str, release_id: &str, target: &ReleaseTarget) -> ServerResult<()>;
}

/// Dispatcher that only logs; used when no agent integration is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingJobDispatcher;

#[async_trait]
impl JobDispatcher for LoggingJobDispatcher {
    async fn dispatch(&self, workspace_id: &str, job: &Job) -> Result<(), DispatchError> {
        info!(workspace_id, job_id = %job.id, job_agent_id = %job.job_agent_id, "Dispatching job");
        Ok(())
    }
}

/// Verification runner that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingVerificationRunner;

#[async_trait]
impl VerificationRunner for LoggingVerificationRunner {
    async fn request(&self, workspace_id: &str, job_id: &str, release_id: &str, target: &ReleaseTarget) -> ServerResult<()> {
        info!(workspace_id, job_id, release_id, target = %target.key(), "Verification requested");
        Ok(())
    }
}

/// `job.update` marking a job's agent as invalid
pub fn invalid_job_agent_event(workspace_id: &str, job_id: &str, message: &str) -> ServerResult<EventEnvelope> {
    let patch = JobPatch {
        job_id: job_id.to_string(),
        fields_to_update: vec![JobUpdateField::Status, JobUpdateField::Message],
        job: JobPatchValues {
            status: Some(JobStatus::InvalidJobAgent),
            message: Some(message.to_string()),
            ..JobPatchValues::default()
        },
    };
    Ok(EventEnvelope::new(EventType::JobUpdate, workspace_id, serde_json::to_value(patch)?))
}

#[derive(Debug, Clone)]
struct PendingDispatch {
    workspace_id: String,
    job: Job,
    attempts: u32,
    due: Instant,
}

/// Publishes live side effects
#[derive(Debug)]
pub struct Outbox {
    producer: Arc<dyn LogProducer>,
    num_partitions: i32,
    dispatcher: Arc<dyn JobDispatcher>,
    verifier: Arc<dyn VerificationRunner>,
    workspaces: Arc<WorkspaceRegistry>,
    io_retry: RetryPolicy,
    dispatch_backoff: RetryPolicy,
    pending: Mutex<Vec<PendingDispatch>>,
}

impl Outbox {
    /// Outbox publishing to `producer`
    pub fn new(
        producer: Arc<dyn LogProducer>,
        num_partitions: i32,
        dispatcher: Arc<dyn JobDispatcher>,
        verifier: Arc<dyn VerificationRunner>,
        workspaces: Arc<WorkspaceRegistry>,
        io_retry: RetryPolicy,
    ) -> Self {
        Self {
            producer,
            num_partitions,
            dispatcher,
            verifier,
            workspaces,
            io_retry,
            dispatch_backoff: RetryPolicy::new(10, Duration::from_secs(1)),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Override the backoff between dispatch retries
    pub fn with_dispatch_backoff(mut self, backoff: RetryPolicy) -> Self {
        self.dispatch_backoff = backoff;
        self
    }

    /// Append an event to the workspace's partition
    pub async fn append(&self, envelope: &EventEnvelope) -> ServerResult<i64> {
        let partition = partition_of(&envelope.workspace_id, self.num_partitions);
        let payload = envelope.encode()?;
        with_retry_context(self.io_retry, "append event", || {
            self.producer.append(partition, &envelope.workspace_id, payload.clone())
        })
        .await
    }

    /// Handle the outbound events of one live apply
    pub async fn publish(&self, workspace_id: &str, outbound: Vec<OutboundEvent>) -> ServerResult<()> {
        let mut created = 0;
        for event in outbound {
            if let Some(envelope) = event.to_envelope(workspace_id)? {
                self.append(&envelope).await?;
            }
            match event {
                OutboundEvent::JobCreated { job } => {
                    created += 1;
                    self.dispatch(workspace_id, job, 0).await?;
                }
                OutboundEvent::JobUpdated { job, previous_status } => {
                    debug!(workspace_id, job_id = %job.id, from = ?previous_status, to = ?job.status, "Published job update");
                }
                OutboundEvent::VerificationRequested { job_id, release_id, release_target } => {
                    if let Err(e) = self.verifier.request(workspace_id, &job_id, &release_id, &release_target).await {
                        error!(workspace_id, job_id = %job_id, error = %e, "Verification request failed");
                    }
                }
            }
        }
        EngineMetrics::record_jobs_created(created);
        Ok(())
    }

    async fn dispatch(&self, workspace_id: &str, job: Job, attempts: u32) -> ServerResult<()> {
        match self.dispatcher.dispatch(workspace_id, &job).await {
            Ok(()) => Ok(()),
            Err(DispatchError::Misconfigured(message)) => {
                EngineMetrics::record_dispatch_failure(false);
                warn!(workspace_id, job_id = %job.id, message = %message, "Job agent misconfigured");
                let event = invalid_job_agent_event(workspace_id, &job.id, &message)?;
                self.append(&event).await.map(|_| ())
            }
            Err(DispatchError::Retryable(message)) => {
                EngineMetrics::record_dispatch_failure(true);
                let attempts = attempts + 1;
                if attempts >= self.dispatch_backoff.attempts {
                    error!(workspace_id, job_id = %job.id, attempts, message = %message, "Giving up dispatching job; it stays pending");
                    return Ok(());
                }
                let due = Instant::now() + self.dispatch_backoff.delay_after(attempts);
                warn!(workspace_id, job_id = %job.id, attempts, message = %message, "Dispatch failed, will retry");
                self.lock_pending().push(PendingDispatch { workspace_id: workspace_id.to_string(), job, attempts, due });
                Ok(())
            }
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Vec<PendingDispatch>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Jobs waiting for another dispatch attempt
    pub fn pending_dispatches(&self) -> usize {
        self.lock_pending().len()
    }

    /// Retry queued dispatches whose backoff has elapsed.
    ///
    /// Jobs that are no longer pending in their workspace are dropped.
    pub async fn retry_due(&self) -> ServerResult<usize> {
        let now = Instant::now();
        let due: Vec<PendingDispatch> = {
            let mut pending = self.lock_pending();
            let (due, waiting): (Vec<_>, Vec<_>) = pending.drain(..).partition(|entry| entry.due <= now);
            *pending = waiting;
            due
        };

        let mut retried = 0;
        for entry in due {
            let still_pending = match self.workspaces.get(&entry.workspace_id) {
                Some(handle) => handle
                    .read()
                    .await
                    .stores()
                    .jobs
                    .get(&entry.job.id)
                    .map_or(false, |job| job.status == JobStatus::Pending),
                None => false,
            };
            if !still_pending {
                debug!(workspace_id = %entry.workspace_id, job_id = %entry.job.id, "Dropping dispatch retry for settled job");
                continue;
            }
            retried += 1;
            self.dispatch(&entry.workspace_id, entry.job, entry.attempts).await?;
        }
        Ok(retried)
    }
}

impl From<DispatchError> for ServerError {
    fn from(err: DispatchError) -> Self {
        ServerError::DispatchError(err.to_string())
    }
}
