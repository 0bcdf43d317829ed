use crate::harness::EngineHarness;
use rollout_core::{JobStatus, OutboundEvent, ReleaseTarget};
use thiserror::Error;

/// A failed expectation about jobs or release targets
#[derive(Debug, Error, PartialEq)]
pub enum JobAssertionError {
    /// Wrong number of jobs
    #[error("Expected {expected} jobs, found {actual}: {tags:?}")]
    JobCount {
        /// Expected count
        expected: usize,
        /// Actual count
        actual: usize,
        /// Tags of the jobs found
        tags: Vec<String>,
    },

    /// A target has no job
    #[error("No job for release target {0}")]
    NoJob(String),

    /// A target's latest job is for another version
    #[error("Latest job for {target} deploys {actual}, expected {expected}")]
    WrongVersion {
        /// Target key
        target: String,
        /// Expected tag
        expected: String,
        /// Deployed tag
        actual: String,
    },

    /// A job is in an unexpected status
    #[error("Job {job_id} is {actual:?}, expected {expected:?}")]
    WrongStatus {
        /// Job id
        job_id: String,
        /// Expected status
        expected: JobStatus,
        /// Actual status
        actual: JobStatus,
    },

    /// Outbound events contain a job creation where none was expected
    #[error("Expected no new jobs, found {0}")]
    UnexpectedJobs(usize),
}

/// Exactly `expected` jobs exist
pub fn assert_job_count(harness: &EngineHarness, expected: usize) -> Result<(), JobAssertionError> {
    let jobs = harness.jobs();
    if jobs.len() == expected {
        return Ok(());
    }
    Err(JobAssertionError::JobCount { expected, actual: jobs.len(), tags: harness.job_tags() })
}

/// The latest job of `target` deploys `tag`
pub fn assert_deploys(harness: &EngineHarness, target: &ReleaseTarget, tag: &str) -> Result<(), JobAssertionError> {
    let job = harness.jobs_for(target).pop().ok_or_else(|| JobAssertionError::NoJob(target.key()))?;
    let actual = harness.tag_of(&job);
    if actual == tag {
        return Ok(());
    }
    Err(JobAssertionError::WrongVersion { target: target.key(), expected: tag.to_string(), actual })
}

/// A job is in `expected` status
pub fn assert_job_status(harness: &EngineHarness, job_id: &str, expected: JobStatus) -> Result<(), JobAssertionError> {
    let actual = harness
        .ws
        .stores()
        .jobs
        .get(job_id)
        .map(|job| job.status)
        .ok_or_else(|| JobAssertionError::NoJob(job_id.to_string()))?;
    if actual == expected {
        return Ok(());
    }
    Err(JobAssertionError::WrongStatus { job_id: job_id.to_string(), expected, actual })
}

/// No `JobCreated` among `outbound`
pub fn assert_no_new_jobs(outbound: &[OutboundEvent]) -> Result<(), JobAssertionError> {
    let created = outbound.iter().filter(|event| matches!(event, OutboundEvent::JobCreated { .. })).count();
    if created == 0 {
        return Ok(());
    }
    Err(JobAssertionError::UnexpectedJobs(created))
}
