mod common;

use common::{resource, Fixture};
use proptest::prelude::*;
use rollout_core::{JobStatus, OutboundEvent, ReleaseTarget};
use rollout_engine::{snapshot, EngineConfig};
use serde_json::json;
use std::collections::BTreeSet;

const ENVS: [&str; 3] = ["prod", "staging", "dev"];
const DEPLOYMENTS: [&str; 2] = ["api", "db"];

#[derive(Debug, Clone)]
enum Op {
    PutResource { index: usize, env: usize },
    DeleteResource { index: usize },
    Version { deployment: usize },
    Finish { pick: usize, success: bool },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..5usize, 0..3usize).prop_map(|(index, env)| Op::PutResource { index, env }),
        (0..5usize).prop_map(|index| Op::DeleteResource { index }),
        (0..2usize).prop_map(|deployment| Op::Version { deployment }),
        (0..8usize, any::<bool>()).prop_map(|(pick, success)| Op::Finish { pick, success }),
    ]
}

/// One system with three environments selecting resources by their `env`
/// label and two deployments that run everywhere
fn setup(fx: &mut Fixture) {
    fx.send("system.created", json!({ "id": "sys", "name": "sys" }));
    fx.send("job-agent.created", json!({ "id": "agent", "name": "agent" }));
    for env in ENVS {
        fx.send(
            "environment.created",
            json!({
                "id": env, "systemId": "sys", "name": env,
                "resourceSelector": { "json": { "type": "metadata", "key": "env", "operator": "equals", "value": env } }
            }),
        );
    }
    for deployment in DEPLOYMENTS {
        fx.send(
            "deployment.created",
            json!({ "id": deployment, "systemId": "sys", "name": deployment, "jobAgentId": "agent" }),
        );
    }
    fx.policy(
        "safety",
        json!([
            { "type": "retry", "maxRetries": 1 },
            { "type": "rollback", "rollBackJobStatuses": ["failure"] }
        ]),
    );
}

fn run(fx: &mut Fixture, ops: &[Op]) -> Vec<OutboundEvent> {
    let mut outbound = Vec::new();
    let mut versions = 0;
    for op in ops {
        let outcome = match op {
            Op::PutResource { index, env } => {
                let id = format!("r{}", index);
                let event = if fx.ws.stores().resources.contains(&id) { "resource.updated" } else { "resource.created" };
                fx.send(event, resource(&id, ENVS[*env]))
            }
            Op::DeleteResource { index } => fx.send("resource.deleted", json!({ "id": format!("r{}", index) })),
            Op::Version { deployment } => {
                versions += 1;
                fx.version(DEPLOYMENTS[*deployment], &format!("v{}", versions))
            }
            Op::Finish { pick, success } => {
                let active: Vec<String> = fx
                    .jobs()
                    .into_iter()
                    .filter(|job| job.status.is_active())
                    .map(|job| job.id)
                    .collect();
                if active.is_empty() {
                    continue;
                }
                let job_id = active[pick % active.len()].clone();
                fx.set_status(&job_id, if *success { "successful" } else { "failure" })
            }
        };
        outbound.extend(outcome.outbound);
    }
    outbound
}

fn expected_targets(fx: &Fixture) -> BTreeSet<ReleaseTarget> {
    let stores = fx.ws.stores();
    let mut expected = BTreeSet::new();
    for deployment in stores.deployments.values() {
        for environment in stores.environments.values() {
            if deployment.system_id != environment.system_id {
                continue;
            }
            for resource in stores.resources.values() {
                if resource.metadata.get("env") == Some(&environment.id) {
                    expected.insert(ReleaseTarget::new(&deployment.id, &environment.id, &resource.id));
                }
            }
        }
    }
    expected
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_release_targets_match_brute_force(ops in prop::collection::vec(op(), 1..30)) {
        let mut fx = Fixture::new();
        setup(&mut fx);
        run(&mut fx, &ops);

        let actual: BTreeSet<ReleaseTarget> = fx.ws.release_targets().into_iter().collect();
        prop_assert_eq!(actual, expected_targets(&fx));
    }

    #[test]
    fn prop_same_history_same_state(ops in prop::collection::vec(op(), 1..30)) {
        let mut left = Fixture::new();
        let mut right = Fixture::new();
        setup(&mut left);
        setup(&mut right);

        let left_out = run(&mut left, &ops);
        let right_out = run(&mut right, &ops);

        prop_assert_eq!(left_out, right_out);
        prop_assert_eq!(left.ws.stores(), right.ws.stores());
    }

    #[test]
    fn prop_snapshot_round_trip(ops in prop::collection::vec(op(), 1..30)) {
        let mut fx = Fixture::new();
        setup(&mut fx);
        run(&mut fx, &ops);

        let bytes = snapshot::encode(&fx.ws).unwrap();
        let restored = snapshot::decode(&bytes, EngineConfig::default(), fx.clock.clone()).unwrap();
        prop_assert_eq!(restored.stores(), fx.ws.stores());
        prop_assert_eq!(restored.release_targets(), fx.ws.release_targets());
        prop_assert_eq!(restored.rollback_blocks(), fx.ws.rollback_blocks());
        prop_assert_eq!(snapshot::encode(&restored).unwrap(), bytes);
    }

    #[test]
    fn prop_retry_bound(max_retries in 0u32..4, failures in 1usize..8) {
        let mut fx = Fixture::new();
        fx.basic();
        fx.policy("retry", json!([{ "type": "retry", "maxRetries": max_retries }]));
        fx.version("api", "v1");

        for _ in 0..failures {
            let job = fx.latest_job();
            if job.status.is_active() {
                fx.set_status(&job.id, "failure");
            }
        }

        let attempts = fx.jobs().len();
        prop_assert!(attempts <= max_retries as usize + 1);
        prop_assert_eq!(attempts, (max_retries as usize + 1).min(failures + 1));
        prop_assert!(fx.jobs().iter().all(|job| job.status == JobStatus::Failure || job.status.is_active()));
    }
}
