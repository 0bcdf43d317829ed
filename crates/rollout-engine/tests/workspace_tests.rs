mod common;

use chrono::Duration;
use common::{resource, Fixture, WS};
use pretty_assertions::assert_eq;
use rollout_core::{CoreError, EventEnvelope, EventType, JobStatus, OutboundEvent, ReleaseTarget};
use rollout_engine::{snapshot, ApplyMode, EngineConfig, ManualClock, Workspace};
use serde_json::json;
use std::sync::Arc;

fn api_target() -> ReleaseTarget {
    ReleaseTarget::new("api", "prod", "r1")
}

#[test]
fn test_new_version_creates_pending_job() {
    let mut fx = Fixture::new();
    fx.basic();
    assert_eq!(fx.ws.release_targets(), vec![api_target()]);
    assert!(fx.jobs().is_empty());

    let outcome = fx.version("api", "v1");

    assert_eq!(outcome.outbound.len(), 1);
    assert!(matches!(&outcome.outbound[0], OutboundEvent::JobCreated { job } if job.status == JobStatus::Pending));
    let job = fx.latest_job();
    assert_eq!(job.job_agent_config, json!({ "image": "base" }));
    assert_eq!(fx.job_tags(), vec!["v1".to_string()]);

    let state = fx.ws.release_target_state(&api_target());
    assert_eq!(state.desired_release.map(|r| r.version.tag), Some("v1".to_string()));
    assert_eq!(state.latest_job.map(|j| j.id), Some(job.id));
    assert!(fx.ws.dirty_targets().is_empty());
}

#[test]
fn test_reapplying_same_version_is_noop() {
    let mut fx = Fixture::new();
    fx.basic();
    fx.version("api", "v1");
    let outcome = fx.version("api", "v1");
    assert!(outcome.outbound.is_empty());
    assert_eq!(fx.jobs().len(), 1);
}

#[test]
fn test_environment_selector_limits_targets() {
    let mut fx = Fixture::new();
    fx.basic();
    fx.send(
        "environment.updated",
        json!({
            "id": "prod", "systemId": "sys", "name": "prod",
            "resourceSelector": { "json": { "type": "metadata", "key": "env", "operator": "equals", "value": "prod" } }
        }),
    );
    fx.send("resource.created", resource("r2", "staging"));
    assert_eq!(fx.ws.release_targets(), vec![api_target()]);

    fx.send("system.created", json!({ "id": "other", "name": "other" }));
    fx.send("environment.created", json!({ "id": "qa", "systemId": "other", "name": "qa" }));
    assert_eq!(fx.ws.release_targets().len(), 1, "environments of another system never pair with api");
}

#[test]
fn test_deployment_without_agent_gets_no_job() {
    let mut fx = Fixture::new();
    fx.basic();
    fx.send("deployment.updated", json!({ "id": "api", "systemId": "sys", "name": "api" }));
    fx.version("api", "v1");
    assert!(fx.jobs().is_empty());
}

#[test]
fn test_missing_agent_yields_invalid_job_agent() {
    let mut fx = Fixture::new();
    fx.basic();
    fx.send("deployment.updated", json!({ "id": "api", "systemId": "sys", "name": "api", "jobAgentId": "ghost" }));
    fx.version("api", "v1");

    let job = fx.latest_job();
    assert_eq!(job.status, JobStatus::InvalidJobAgent);
    assert_eq!(job.message.as_deref(), Some("Job agent ghost not found"));
}

#[test]
fn test_denied_version_falls_back_to_older() {
    let mut fx = Fixture::new();
    fx.basic();
    fx.policy("approvals", json!([{ "type": "anyApproval", "minApprovals": 1 }]));

    fx.version("api", "v1");
    assert!(fx.jobs().is_empty());

    fx.send(
        "user-approval-record.created",
        json!({ "versionId": "api-v1", "environmentId": "prod", "userId": "alice" }),
    );
    assert_eq!(fx.job_tags(), vec!["v1".to_string()]);

    fx.version("api", "v2");
    let plan = fx.ws.plan(&api_target());
    assert_eq!(plan.desired.map(|r| r.version.tag), Some("v1".to_string()));
    assert_eq!(plan.evaluations.len(), 2);
    assert_eq!(fx.jobs().len(), 1);
}

#[test]
fn test_strict_mode_never_retries() {
    let mut fx = Fixture::new();
    fx.basic();
    fx.version("api", "v1");
    let job = fx.latest_job();
    fx.set_status(&job.id, "failure");

    assert_eq!(fx.jobs().len(), 1);
    let failed = fx.latest_job();
    assert!(failed.completed_at.is_some());
}

#[test]
fn test_retry_rule_bounds_attempts() {
    let mut fx = Fixture::new();
    fx.basic();
    fx.policy("retry", json!([{ "type": "retry", "maxRetries": 1 }]));
    fx.version("api", "v1");

    let first = fx.latest_job();
    fx.set_status(&first.id, "failure");
    assert_eq!(fx.jobs().len(), 2);

    let second = fx.latest_job();
    assert_ne!(first.id, second.id);
    fx.set_status(&second.id, "failure");
    assert_eq!(fx.jobs().len(), 2);
    assert_eq!(fx.jobs_with_status(JobStatus::Failure), 2);
}

#[test]
fn test_failed_job_rolls_back_to_previous_release() {
    let mut fx = Fixture::new();
    fx.basic();
    fx.policy("rollback", json!([{ "type": "rollback", "rollBackJobStatuses": ["failure"] }]));

    fx.version("api", "v1");
    let v1_job = fx.latest_job();
    fx.set_status(&v1_job.id, "successful");

    fx.version("api", "v2");
    let v2_job = fx.latest_job();
    let outcome = fx.set_status(&v2_job.id, "failure");

    assert_eq!(outcome.outbound.len(), 1);
    assert_eq!(fx.job_tags(), vec!["v1".to_string(), "v2".to_string(), "v1".to_string()]);
    let rollback = fx.latest_job();
    assert!(rollback.is_rollback());
    assert_eq!(rollback.release_id, v1_job.release_id);
    assert!(fx.ws.rollback_blocks()[&api_target().key()].contains("api-v2"));

    fx.set_status(&rollback.id, "failure");
    assert_eq!(fx.jobs().len(), 3, "rollback jobs never chain");
}

#[test]
fn test_rollback_without_previous_release() {
    let mut fx = Fixture::new();
    fx.basic();
    fx.policy("rollback", json!([{ "type": "rollback", "rollBackJobStatuses": ["failure"] }]));
    fx.version("api", "v1");
    let job = fx.latest_job();
    fx.set_status(&job.id, "failure");

    assert_eq!(fx.jobs().len(), 1);
    assert!(!fx.ws.rollback_blocks().contains_key(&api_target().key()));
}

#[test]
fn test_first_deploy_failure_still_retries_under_rollback_rule() {
    let mut fx = Fixture::new();
    fx.basic();
    fx.policy(
        "safety",
        json!([
            { "type": "rollback", "rollBackJobStatuses": ["failure"] },
            { "type": "retry", "maxRetries": 3 }
        ]),
    );
    fx.version("api", "v1");
    let first = fx.latest_job();
    fx.set_status(&first.id, "failure");

    assert_eq!(fx.jobs().len(), 2);
    let retry = fx.latest_job();
    assert_eq!(retry.release_id, first.release_id);
    assert!(!retry.is_rollback());
    assert!(fx.ws.rollback_blocks().is_empty());
}

#[test]
fn test_successful_job_requests_verification() {
    let mut fx = Fixture::new();
    fx.basic();
    fx.policy("verify", json!([{ "type": "rollback", "onVerificationFailure": true }]));
    fx.version("api", "v1");
    let v1_job = fx.latest_job();
    let outcome = fx.set_status(&v1_job.id, "successful");
    assert!(matches!(&outcome.outbound[..], [OutboundEvent::VerificationRequested { job_id, .. }] if *job_id == v1_job.id));

    fx.version("api", "v2");
    let v2_job = fx.latest_job();
    fx.set_status(&v2_job.id, "successful");
    fx.send("job-verification.started", json!({ "jobId": v2_job.id }));
    fx.send("job-verification.completed", json!({ "jobId": v2_job.id, "passed": false, "message": "probe failed" }));

    assert_eq!(fx.job_tags(), vec!["v1".to_string(), "v2".to_string(), "v1".to_string()]);
    assert!(fx.latest_job().is_rollback());
    let record = fx.ws.stores().job_verifications.get(&v2_job.id).unwrap();
    assert_eq!(record.message.as_deref(), Some("probe failed"));
}

#[test]
fn test_deny_window_defers_until_window_end() {
    let mut fx = Fixture::new();
    fx.basic();
    fx.policy(
        "freeze",
        json!([{ "type": "deploymentWindow", "rrule": "FREQ=DAILY;BYHOUR=11;BYMINUTE=0", "durationMinutes": 120, "allow": false }]),
    );
    fx.version("api", "v1");
    assert!(fx.jobs().is_empty());

    let scheduled = fx.ws.scheduled();
    assert_eq!(scheduled.len(), 1);
    assert_eq!(scheduled[0].deadline, common::start() + Duration::hours(1));

    fx.send("workspace.tick", json!({}));
    assert!(fx.jobs().is_empty());

    fx.advance(Duration::minutes(61));
    fx.send("workspace.tick", json!({}));
    assert_eq!(fx.job_tags(), vec!["v1".to_string()]);
    assert!(fx.ws.scheduled().is_empty());
}

#[test]
fn test_cooldown_holds_new_version() {
    let mut fx = Fixture::new();
    fx.basic();
    fx.policy("cooldown", json!([{ "type": "versionCooldown", "seconds": 3600 }]));
    fx.version("api", "v1");
    let v1_job = fx.latest_job();
    fx.set_status(&v1_job.id, "successful");

    fx.version("api", "v2");
    assert_eq!(fx.jobs().len(), 1);
    assert_eq!(fx.ws.plan(&api_target()).desired, None);

    fx.advance(Duration::seconds(3601));
    fx.send("workspace.tick", json!({}));
    assert_eq!(fx.job_tags(), vec!["v1".to_string(), "v2".to_string()]);
}

#[test]
fn test_tick_ahead_of_clock_plans_at_tick_time() {
    let mut fx = Fixture::new();
    fx.basic();
    fx.policy("cooldown", json!([{ "type": "versionCooldown", "seconds": 3600 }]));
    fx.version("api", "v1");
    let v1_job = fx.latest_job();
    fx.set_status(&v1_job.id, "successful");
    fx.version("api", "v2");
    assert_eq!(fx.ws.scheduled().len(), 1);

    let tick_at = common::start() + Duration::seconds(3601);
    fx.send("workspace.tick", json!({ "timestamp": tick_at.timestamp_nanos_opt().unwrap() }));

    assert_eq!(fx.job_tags(), vec!["v1".to_string(), "v2".to_string()]);
    assert!(fx.ws.scheduled().is_empty());
}

#[test]
fn test_dependency_waits_for_other_deployment() {
    let mut fx = Fixture::new();
    fx.basic();
    fx.send("deployment.created", json!({ "id": "db", "systemId": "sys", "name": "db", "jobAgentId": "agent" }));
    fx.send(
        "policy.created",
        json!({
            "id": "needs-db", "name": "needs-db",
            "selectors": [{ "deploymentSelector": { "cel": "deployment.name == 'api'" } }],
            "rules": [{ "type": "deploymentDependency", "dependsOnDeploymentSelector": { "cel": "deployment.name == 'db'" } }]
        }),
    );

    fx.version("api", "v1");
    assert!(fx.jobs().is_empty());

    fx.version("db", "v1");
    let db_job = fx.latest_job();
    fx.set_status(&db_job.id, "successful");
    assert_eq!(fx.job_tags(), vec!["v1".to_string(), "v1".to_string()]);
    let api_job = fx.latest_job();
    assert_eq!(fx.ws.stores().releases.get(&api_job.release_id).unwrap().release_target, api_target());
}

#[test]
fn test_set_resources_owns_and_prunes() {
    let mut fx = Fixture::new();
    fx.basic();
    fx.send("resource-provider.created", json!({ "id": "p1", "name": "cloud" }));
    fx.send(
        "resource-provider.set-resources",
        json!({ "providerId": "p1", "resources": [ resource("c1", "prod"), resource("c2", "prod") ] }),
    );
    assert_eq!(fx.ws.stores().resources.get("c1").unwrap().provider_id.as_deref(), Some("p1"));
    assert_eq!(fx.ws.release_targets().len(), 3);

    let err = fx.try_send("resource.updated", resource("c1", "staging")).unwrap_err();
    assert!(matches!(err, CoreError::OwnershipViolation(_)));
    assert_eq!(fx.ws.stores().resources.get("c1").unwrap().metadata["env"], "prod");

    fx.send("resource-provider.set-resources", json!({ "providerId": "p1", "resources": [ resource("c2", "prod") ] }));
    assert!(fx.ws.stores().resources.get("c1").is_none());
    assert_eq!(fx.ws.release_targets().len(), 2);
}

#[test]
fn test_set_resources_for_unknown_provider_fails() {
    let mut fx = Fixture::new();
    let err = fx
        .try_send("resource-provider.set-resources", json!({ "providerId": "nope", "resources": [] }))
        .unwrap_err();
    assert!(matches!(err, CoreError::EntityNotFound(_)));
}

#[test]
fn test_duplicate_identifier_rejected() {
    let mut fx = Fixture::new();
    fx.basic();
    let mut duplicate = resource("r9", "prod");
    duplicate["identifier"] = json!("r1-identifier");
    let err = fx.try_send("resource.created", duplicate).unwrap_err();
    assert!(matches!(err, CoreError::ValidationError(_)));
    assert!(fx.ws.stores().resources.get("r9").is_none());
}

#[test]
fn test_deleting_system_cascades() {
    let mut fx = Fixture::new();
    fx.basic();
    fx.version("api", "v1");
    fx.send("system.deleted", json!({ "id": "sys" }));

    assert!(fx.ws.stores().deployments.is_empty());
    assert!(fx.ws.stores().environments.is_empty());
    assert!(fx.ws.stores().deployment_versions.is_empty());
    assert!(fx.ws.release_targets().is_empty());
    assert_eq!(fx.jobs().len(), 1, "jobs outlive their targets");
}

#[test]
fn test_target_removal_can_cancel_pending_jobs() {
    let mut fx = Fixture::with_config(EngineConfig { cancel_pending_jobs_on_target_removal: true, ..EngineConfig::default() });
    fx.basic();
    fx.version("api", "v1");
    let outcome = fx.send("resource.deleted", json!({ "id": "r1" }));

    assert_eq!(fx.latest_job().status, JobStatus::Cancelled);
    assert!(matches!(&outcome.outbound[..], [OutboundEvent::JobUpdated { previous_status: JobStatus::Pending, .. }]));
}

/// Remove the `api|prod|r1` target in one of the supported ways
fn remove_target(fx: &mut Fixture, how: &str) -> rollout_engine::ApplyOutcome {
    match how {
        "environment" => fx.send("environment.deleted", json!({ "id": "prod" })),
        "deployment" => fx.send("deployment.deleted", json!({ "id": "api" })),
        "selector" => fx.send(
            "environment.updated",
            json!({
                "id": "prod", "systemId": "sys", "name": "prod",
                "resourceSelector": { "json": { "type": "metadata", "key": "env", "operator": "equals", "value": "staging" } }
            }),
        ),
        other => panic!("unknown removal {}", other),
    }
}

#[test]
fn test_target_removal_leaves_pending_jobs_by_default() {
    for how in ["environment", "deployment", "selector"] {
        let mut fx = Fixture::new();
        fx.basic();
        fx.version("api", "v1");
        let outcome = remove_target(&mut fx, how);

        assert!(fx.ws.release_targets().is_empty(), "{}", how);
        assert_eq!(fx.latest_job().status, JobStatus::Pending, "{}", how);
        assert!(outcome.outbound.is_empty(), "{}", how);
    }
}

#[test]
fn test_every_target_removal_cancels_pending_jobs_when_enabled() {
    for how in ["environment", "deployment", "selector"] {
        let mut fx =
            Fixture::with_config(EngineConfig { cancel_pending_jobs_on_target_removal: true, ..EngineConfig::default() });
        fx.basic();
        fx.version("api", "v1");
        let outcome = remove_target(&mut fx, how);

        assert_eq!(fx.latest_job().status, JobStatus::Cancelled, "{}", how);
        assert!(
            matches!(&outcome.outbound[..], [OutboundEvent::JobUpdated { previous_status: JobStatus::Pending, .. }]),
            "{}",
            how
        );
    }
}

/// v1 succeeds, v2 fails and is rolled back, leaving `api-v2` blocked
fn rolled_back() -> Fixture {
    let mut fx = Fixture::new();
    fx.basic();
    fx.policy("rollback", json!([{ "type": "rollback", "rollBackJobStatuses": ["failure"] }]));
    fx.version("api", "v1");
    let v1_job = fx.latest_job();
    fx.set_status(&v1_job.id, "successful");
    fx.version("api", "v2");
    let v2_job = fx.latest_job();
    fx.set_status(&v2_job.id, "failure");
    assert!(fx.ws.rollback_blocks()[&api_target().key()].contains("api-v2"));
    fx
}

#[test]
fn test_removed_target_forgets_rollback_blocks() {
    let mut fx = rolled_back();
    fx.send("resource.deleted", json!({ "id": "r1" }));
    assert!(fx.ws.rollback_blocks().is_empty());
}

#[test]
fn test_deleted_version_is_unblocked() {
    let mut fx = rolled_back();
    fx.send("deployment-version.deleted", json!({ "id": "api-v2" }));
    assert!(fx.ws.rollback_blocks().is_empty());
}

#[test]
fn test_resource_variables_change_release() {
    let mut fx = Fixture::new();
    fx.basic();
    fx.version("api", "v1");
    let first = fx.latest_job();
    fx.set_status(&first.id, "successful");

    fx.send(
        "resource-variable.created",
        json!({ "resourceId": "r1", "key": "replicas", "value": { "type": "literal", "value": 3 } }),
    );
    let second = fx.latest_job();
    assert_ne!(first.release_id, second.release_id);
    let release = fx.ws.stores().releases.get(&second.release_id).unwrap();
    assert_eq!(release.variables["replicas"], json!(3));
}

#[test]
fn test_event_for_other_workspace_rejected() {
    let mut fx = Fixture::new();
    let event = EventEnvelope::new(EventType::WorkspaceSave, "someone-else", json!({}));
    assert!(fx.ws.apply(&event, ApplyMode::Live).is_err());
}

#[test]
fn test_save_requests_snapshot() {
    let mut fx = Fixture::new();
    assert!(fx.send("workspace.save", json!({})).save_requested);
}

#[test]
fn test_quarantined_workspace_rejects_events() {
    let mut fx = Fixture::new();
    fx.ws.quarantine("index out of sync");
    let err = fx.try_send("system.created", json!({ "id": "sys", "name": "sys" })).unwrap_err();
    assert!(matches!(err, CoreError::WorkspaceQuarantined(_)));
}

#[test]
fn test_replay_reproduces_live_state() {
    let mut live = Fixture::new();
    let mut log = Vec::new();
    let events = vec![
        ("system.created", json!({ "id": "sys", "name": "sys" })),
        ("job-agent.created", json!({ "id": "agent", "name": "agent" })),
        ("environment.created", json!({ "id": "prod", "systemId": "sys", "name": "prod" })),
        ("deployment.created", json!({ "id": "api", "systemId": "sys", "name": "api", "jobAgentId": "agent" })),
        ("resource.created", resource("r1", "prod")),
        ("deployment-version.created", json!({ "id": "api-v1", "deploymentId": "api", "tag": "v1" })),
    ];
    for (event_type, data) in events {
        let envelope = EventEnvelope::new(event_type.parse().unwrap(), WS, data);
        let outcome = live.ws.apply(&envelope, ApplyMode::Live).unwrap();
        log.push(envelope);
        for event in outcome.outbound {
            if let Some(echo) = event.to_envelope(WS).unwrap() {
                log.push(echo);
            }
        }
    }

    let clock = Arc::new(ManualClock::new(common::start()));
    let mut replayed = Workspace::new(WS, EngineConfig::default(), clock);
    for envelope in &log {
        let outcome = replayed.apply(envelope, ApplyMode::Replay).unwrap();
        assert!(outcome.outbound.is_empty());
    }

    assert_eq!(replayed.stores(), live.ws.stores());
}

#[test]
fn test_snapshot_restores_state() {
    let mut fx = Fixture::new();
    fx.basic();
    fx.version("api", "v1");
    fx.ws.set_last_processed_offset(12);

    let bytes = snapshot::encode(&fx.ws).unwrap();
    let restored = snapshot::decode(&bytes, EngineConfig::default(), fx.clock.clone()).unwrap();

    assert_eq!(restored.stores(), fx.ws.stores());
    assert_eq!(restored.release_targets(), fx.ws.release_targets());
    assert_eq!(restored.snapshot_offset(), 12);
    assert_eq!(
        restored.plan(&api_target()).desired.map(|r| r.id),
        fx.ws.plan(&api_target()).desired.map(|r| r.id)
    );
}
