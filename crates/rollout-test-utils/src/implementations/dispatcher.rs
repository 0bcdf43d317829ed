use async_trait::async_trait;
use rollout_core::{Job, ReleaseTarget};
use rollout_server::dispatch::{DispatchError, JobDispatcher, VerificationRunner};
use rollout_server::ServerResult;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// One dispatch attempt
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRecord {
    /// Workspace of the job
    pub workspace_id: String,
    /// Job as handed to the agent
    pub job: Job,
    /// Whether the attempt succeeded
    pub accepted: bool,
}

/// Job dispatcher that records every attempt.
///
/// Failures can be scripted per call with [`fail_next`](Self::fail_next) or
/// per agent with [`misconfigure`](Self::misconfigure).
#[derive(Debug, Default)]
pub struct RecordingJobDispatcher {
    attempts: Mutex<Vec<DispatchRecord>>,
    scripted: Mutex<VecDeque<DispatchError>>,
    misconfigured: Mutex<HashMap<String, String>>,
}

impl RecordingJobDispatcher {
    /// Dispatcher accepting every job
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next dispatch with `error`; queued failures are used in order
    pub fn fail_next(&self, error: DispatchError) {
        self.scripted.lock().unwrap().push_back(error);
    }

    /// Reject every job for `job_agent_id` as misconfigured
    pub fn misconfigure(&self, job_agent_id: &str, message: &str) {
        self.misconfigured.lock().unwrap().insert(job_agent_id.to_string(), message.to_string());
    }

    /// Every attempt, in order
    pub fn attempts(&self) -> Vec<DispatchRecord> {
        self.attempts.lock().unwrap().clone()
    }

    /// Jobs that were accepted, in order
    pub fn dispatched(&self) -> Vec<Job> {
        self.attempts().into_iter().filter(|record| record.accepted).map(|record| record.job).collect()
    }

    /// Number of attempts made for `job_id`
    pub fn attempts_for(&self, job_id: &str) -> usize {
        self.attempts().iter().filter(|record| record.job.id == job_id).count()
    }
}

#[async_trait]
impl JobDispatcher for RecordingJobDispatcher {
    async fn dispatch(&self, workspace_id: &str, job: &Job) -> Result<(), DispatchError> {
        let result = match self.misconfigured.lock().unwrap().get(&job.job_agent_id) {
            Some(message) => Err(DispatchError::Misconfigured(message.clone())),
            None => self.scripted.lock().unwrap().pop_front().map_or(Ok(()), Err),
        };
        self.attempts.lock().unwrap().push(DispatchRecord {
            workspace_id: workspace_id.to_string(),
            job: job.clone(),
            accepted: result.is_ok(),
        });
        result
    }
}

/// One verification request
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationRecord {
    /// Workspace of the job
    pub workspace_id: String,
    /// Verified job
    pub job_id: String,
    /// Release the job deployed
    pub release_id: String,
    /// Target of the release
    pub target: ReleaseTarget,
}

/// Verification runner that records requests
#[derive(Debug, Default)]
pub struct RecordingVerificationRunner {
    requests: Mutex<Vec<VerificationRecord>>,
}

impl RecordingVerificationRunner {
    /// Empty runner
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests received, in order
    pub fn requests(&self) -> Vec<VerificationRecord> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl VerificationRunner for RecordingVerificationRunner {
    async fn request(&self, workspace_id: &str, job_id: &str, release_id: &str, target: &ReleaseTarget) -> ServerResult<()> {
        self.requests.lock().unwrap().push(VerificationRecord {
            workspace_id: workspace_id.to_string(),
            job_id: job_id.to_string(),
            release_id: release_id.to_string(),
            target: target.clone(),
        });
        Ok(())
    }
}
