//! Shared helpers for the engine integration tests

#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use rollout_core::{EventEnvelope, EventType, Job, JobStatus};
use rollout_engine::{ApplyMode, ApplyOutcome, EngineConfig, ManualClock, Workspace};
use serde_json::{json, Value};
use std::sync::Arc;

pub const WS: &str = "ws-test";

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap()
}

pub struct Fixture {
    pub clock: Arc<ManualClock>,
    pub ws: Workspace,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let clock = Arc::new(ManualClock::new(start()));
        let ws = Workspace::new(WS, config, clock.clone());
        Self { clock, ws }
    }

    pub fn send(&mut self, event_type: &str, data: Value) -> ApplyOutcome {
        self.try_send(event_type, data).unwrap()
    }

    pub fn try_send(&mut self, event_type: &str, data: Value) -> rollout_core::CoreResult<ApplyOutcome> {
        let event_type: EventType = event_type.parse()?;
        self.ws.apply(&EventEnvelope::new(event_type, WS, data), ApplyMode::Live)
    }

    pub fn advance(&mut self, by: Duration) {
        self.clock.advance(by);
    }

    /// System `sys`, environment `prod`, agent `agent`, deployment `api`
    /// and resource `r1`
    pub fn basic(&mut self) {
        self.send("system.created", json!({ "id": "sys", "name": "sys" }));
        self.send("job-agent.created", json!({ "id": "agent", "name": "agent", "type": "test", "config": { "image": "base" } }));
        self.send("environment.created", json!({ "id": "prod", "systemId": "sys", "name": "prod" }));
        self.send(
            "deployment.created",
            json!({ "id": "api", "systemId": "sys", "name": "api", "jobAgentId": "agent" }),
        );
        self.send("resource.created", resource("r1", "prod"));
    }

    pub fn version(&mut self, deployment: &str, tag: &str) -> ApplyOutcome {
        self.send(
            "deployment-version.created",
            json!({ "id": format!("{}-{}", deployment, tag), "deploymentId": deployment, "tag": tag }),
        )
    }

    pub fn policy(&mut self, id: &str, rules: Value) {
        self.send(
            "policy.created",
            json!({ "id": id, "name": id, "selectors": [{}], "rules": rules }),
        );
    }

    pub fn set_status(&mut self, job_id: &str, status: &str) -> ApplyOutcome {
        self.send(
            "job.update",
            json!({ "jobId": job_id, "fieldsToUpdate": ["status"], "job": { "status": status } }),
        )
    }

    pub fn jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.ws.stores().jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }

    pub fn latest_job(&self) -> Job {
        self.jobs().pop().expect("no jobs")
    }

    pub fn job_tags(&self) -> Vec<String> {
        self.jobs()
            .iter()
            .map(|job| self.ws.stores().releases.get(&job.release_id).unwrap().version.tag.clone())
            .collect()
    }

    pub fn jobs_with_status(&self, status: JobStatus) -> usize {
        self.jobs().iter().filter(|job| job.status == status).count()
    }
}

pub fn resource(id: &str, env: &str) -> Value {
    json!({
        "id": id,
        "identifier": format!("{}-identifier", id),
        "name": id,
        "kind": "Kubernetes/Cluster",
        "metadata": { "env": env }
    })
}
