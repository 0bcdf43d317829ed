use crate::domain::entity::EntityKind;
use crate::impl_entity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Metadata key marking jobs created by a rollback
pub const ROLLBACK_METADATA_KEY: &str = "rollback";

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    /// Created, not yet picked up by an agent
    Pending,
    /// Agent is executing the job
    InProgress,
    /// Job completed successfully
    Successful,
    /// Job failed
    Failure,
    /// Job was cancelled
    Cancelled,
    /// Job was skipped by the agent
    Skipped,
    /// The job agent is missing or misconfigured
    InvalidJobAgent,
}

impl JobStatus {
    /// Whether the job has finished
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::InProgress)
    }

    /// Whether the job is still running or waiting to run
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Terminal and not successful
    pub fn is_unsuccessful(&self) -> bool {
        self.is_terminal() && *self != JobStatus::Successful
    }
}

/// Aggregate: a single attempt at making a release real
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Unique identifier
    pub id: String,
    /// Release this job deploys; immutable
    pub release_id: String,
    /// Agent the job is dispatched to
    pub job_agent_id: String,
    /// Merged agent configuration
    #[serde(default = "crate::domain::entities::empty_object")]
    pub job_agent_config: Value,
    /// Current status
    pub status: JobStatus,
    /// Identifier assigned by the external agent
    #[serde(default)]
    pub external_id: Option<String>,
    /// Last status message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Free-form labels (`rollback = "true"` marks rollback jobs)
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Creation timestamp
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Last update timestamp
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// When the agent started executing
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal status
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl_entity!(Job, EntityKind::Job);

impl Job {
    /// Whether this job was created by a rollback
    pub fn is_rollback(&self) -> bool {
        self.metadata
            .get(ROLLBACK_METADATA_KEY)
            .map(|v| v == "true")
            .unwrap_or(false)
    }
}

/// Fields a `job.update` event may touch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobUpdateField {
    /// `status`
    Status,
    /// `externalId`
    ExternalId,
    /// `message`
    Message,
    /// `startedAt`
    StartedAt,
    /// `completedAt`
    CompletedAt,
    /// `metadata`
    Metadata,
}

/// New values carried by a job patch; only fields listed in
/// `fieldsToUpdate` are applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPatchValues {
    /// New status
    #[serde(default)]
    pub status: Option<JobStatus>,
    /// New external id
    #[serde(default)]
    pub external_id: Option<String>,
    /// New message
    #[serde(default)]
    pub message: Option<String>,
    /// New start time
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// New completion time
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Metadata entries to merge
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, String>>,
}

/// Payload of `job.update`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPatch {
    /// Job to update
    pub job_id: String,
    /// Fields to apply; empty means every field present in the values
    #[serde(default)]
    pub fields_to_update: Vec<JobUpdateField>,
    /// New values
    #[serde(alias = "newValues", default)]
    pub job: JobPatchValues,
}

impl JobPatch {
    fn selects(&self, field: JobUpdateField) -> bool {
        self.fields_to_update.is_empty() || self.fields_to_update.contains(&field)
    }

    /// Apply the patch to a job. Returns the previous status when the patch
    /// changed it. The release id is never touched.
    pub fn apply(&self, job: &mut Job) -> Option<JobStatus> {
        let previous = job.status;

        if self.selects(JobUpdateField::Status) {
            if let Some(status) = self.job.status {
                job.status = status;
            }
        }
        if self.selects(JobUpdateField::ExternalId) && self.job.external_id.is_some() {
            job.external_id = self.job.external_id.clone();
        }
        if self.selects(JobUpdateField::Message) && self.job.message.is_some() {
            job.message = self.job.message.clone();
        }
        if self.selects(JobUpdateField::StartedAt) && self.job.started_at.is_some() {
            job.started_at = self.job.started_at;
        }
        if self.selects(JobUpdateField::CompletedAt) && self.job.completed_at.is_some() {
            job.completed_at = self.job.completed_at;
        }
        if self.selects(JobUpdateField::Metadata) {
            if let Some(metadata) = &self.job.metadata {
                for (k, v) in metadata {
                    job.metadata.insert(k.clone(), v.clone());
                }
            }
        }

        (job.status != previous).then_some(previous)
    }
}

/// Status of a post-deploy verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    /// Probe is running
    Running,
    /// Probe passed
    Passed,
    /// Probe failed
    Failed,
}

/// Verification record for a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobVerification {
    /// Unique identifier
    pub id: String,
    /// Verified job
    pub job_id: String,
    /// Current status
    pub status: VerificationStatus,
    /// Result message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Creation timestamp
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Last update timestamp
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl_entity!(JobVerification, EntityKind::JobVerification);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pending_job() -> Job {
        Job {
            id: "j1".into(),
            release_id: "rel1".into(),
            job_agent_id: "a1".into(),
            job_agent_config: json!({}),
            status: JobStatus::Pending,
            external_id: None,
            message: None,
            metadata: BTreeMap::new(),
            created_at: None,
            updated_at: None,
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_status_classification() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::InProgress.is_terminal());
        assert!(JobStatus::Successful.is_terminal());
        assert!(!JobStatus::Successful.is_unsuccessful());
        assert!(JobStatus::Cancelled.is_unsuccessful());
        assert!(JobStatus::InvalidJobAgent.is_unsuccessful());
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(serde_json::to_value(JobStatus::InProgress).unwrap(), json!("inProgress"));
        assert_eq!(
            serde_json::to_value(JobStatus::InvalidJobAgent).unwrap(),
            json!("invalidJobAgent")
        );
    }

    #[test]
    fn test_patch_respects_field_list() {
        let patch: JobPatch = serde_json::from_value(json!({
            "jobId": "j1",
            "fieldsToUpdate": ["status"],
            "newValues": { "status": "successful", "externalId": "ext-1", "releaseId": "other" }
        }))
        .unwrap();

        let mut job = pending_job();
        let previous = patch.apply(&mut job);

        assert_eq!(previous, Some(JobStatus::Pending));
        assert_eq!(job.status, JobStatus::Successful);
        assert_eq!(job.external_id, None);
        assert_eq!(job.release_id, "rel1");
    }

    #[test]
    fn test_patch_without_field_list_applies_everything() {
        let patch: JobPatch = serde_json::from_value(json!({
            "jobId": "j1",
            "job": { "externalId": "ext-1", "metadata": { "run": "42" } }
        }))
        .unwrap();

        let mut job = pending_job();
        assert_eq!(patch.apply(&mut job), None);
        assert_eq!(job.external_id.as_deref(), Some("ext-1"));
        assert_eq!(job.metadata.get("run").map(String::as_str), Some("42"));
    }

    #[test]
    fn test_rollback_marker() {
        let mut job = pending_job();
        assert!(!job.is_rollback());
        job.metadata.insert(ROLLBACK_METADATA_KEY.into(), "true".into());
        assert!(job.is_rollback());
    }
}
