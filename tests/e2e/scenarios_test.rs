use chrono::Duration;
use pretty_assertions::assert_eq;
use rollout_core::{JobStatus, ReleaseTarget};
use rollout_e2e_tests::{api_target, single_target};
use rollout_test_utils::assertions::{assert_deploys, assert_job_count, assert_no_new_jobs};
use rollout_test_utils::builders::*;

#[test]
fn test_single_target_happy_path() {
    let mut harness = single_target(Vec::new());
    harness.create(version("api", "v1.0.0"));

    assert_job_count(&harness, 1).unwrap();
    let job = harness.latest_job();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.job_agent_id, "agent");
    let release = harness.ws.stores().releases.get(&job.release_id).unwrap().clone();
    assert_eq!(release.release_target, api_target());

    harness.set_status(&job.id, JobStatus::Successful);
    let state = harness.ws.release_target_state(&api_target());
    assert_eq!(state.current_release.map(|r| r.version.tag), Some("v1.0.0".to_string()));
}

#[test]
fn test_approval_gate_needs_two_users() {
    let mut harness = single_target(vec![policy("approval", vec![rules::any_approval(2)])]);
    harness.create(version("api", "v1.0.0"));
    assert_job_count(&harness, 0).unwrap();

    harness.create(approval("api-v1.0.0", "prod", "u1"));
    assert_job_count(&harness, 0).unwrap();

    // The same user approving again does not count twice
    harness.update(approval("api-v1.0.0", "prod", "u1"));
    assert_job_count(&harness, 0).unwrap();

    harness.create(approval("api-v1.0.0", "prod", "u2"));
    assert_job_count(&harness, 1).unwrap();
    assert_deploys(&harness, &api_target(), "v1.0.0").unwrap();
}

#[test]
fn test_version_cooldown_blocks_second_deploy() {
    let mut harness = single_target(vec![policy("cooldown", vec![rules::version_cooldown(3600)])]);
    harness.create(version("api", "v1.0.0"));
    assert_job_count(&harness, 1).unwrap();
    let first = harness.latest_job();
    harness.set_status(&first.id, JobStatus::Successful);

    let outcome = harness.create(version("api", "v2.0.0"));
    assert_no_new_jobs(&outcome.outbound).unwrap();
    assert_job_count(&harness, 1).unwrap();

    harness.advance(Duration::seconds(3601));
    harness.tick();
    assert_job_count(&harness, 2).unwrap();
    assert_deploys(&harness, &api_target(), "v2.0.0").unwrap();
}

#[test]
fn test_deployment_dependency_orders_rollout() {
    let mut harness = single_target(Vec::new());
    harness.create(deployment_with_agent("db", "sys", "agent").resource_selector(match_all()));
    harness.create(
        policy("needs-db", vec![rules::depends_on("db")])
            .set("selectors", serde_json::json!([{ "deploymentSelector": { "json": id_equals("api") } }])),
    );

    harness.create(version("api", "v1"));
    assert_job_count(&harness, 0).unwrap();

    harness.create(version("db", "v1"));
    assert_job_count(&harness, 1).unwrap();
    let db_target = ReleaseTarget::new("db", "prod", "r1");
    assert_deploys(&harness, &db_target, "v1").unwrap();

    let db_job = harness.latest_job();
    harness.set_status(&db_job.id, JobStatus::Successful);
    assert_job_count(&harness, 2).unwrap();
    assert_deploys(&harness, &api_target(), "v1").unwrap();
}

#[test]
fn test_rollback_on_failure_redeploys_last_good_version() {
    let mut harness = single_target(vec![policy("rollback", vec![rules::rollback(&["failure"])])]);
    harness.create(version("api", "v1.0.0"));
    let first = harness.latest_job();
    harness.set_status(&first.id, JobStatus::Successful);

    harness.create(version("api", "v2.0.0"));
    let second = harness.latest_job();
    assert_eq!(harness.tag_of(&second), "v2.0.0");
    harness.set_status(&second.id, JobStatus::Failure);

    assert_job_count(&harness, 3).unwrap();
    let rollback = harness.latest_job();
    assert_eq!(rollback.status, JobStatus::Pending);
    assert!(rollback.is_rollback());
    assert_eq!(harness.tag_of(&rollback), "v1.0.0");
}
