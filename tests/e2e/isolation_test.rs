use rollout_test_utils::builders::*;
use rollout_test_utils::ServerHarness;

const WORKSPACE_A: &str = "ws-a";
const WORKSPACE_B: &str = "ws-b";

async fn topology(harness: &ServerHarness, workspace_id: &str) {
    for entity in [
        system("sys"),
        job_agent("agent"),
        environment("prod", "sys"),
        deployment_with_agent("api", "sys", "agent"),
        resource("r1"),
        version("api", "v1"),
    ] {
        harness.create(workspace_id, &entity).await.unwrap();
    }
}

#[tokio::test]
async fn test_workspaces_sharing_a_partition_stay_isolated() {
    let harness = ServerHarness::new(1);
    topology(&harness, WORKSPACE_A).await;
    topology(&harness, WORKSPACE_B).await;

    let mut consumer = harness.consumer(0).unwrap();
    consumer.cold_start().await.unwrap();
    consumer.drain().await.unwrap();

    let before = harness.workspace(WORKSPACE_B).unwrap().read().await.stores().clone();

    for entity in [resource("r2"), resource("r3"), version("api", "v2")] {
        harness.create(WORKSPACE_A, &entity).await.unwrap();
    }
    harness.append(&system("sys").deleted(WORKSPACE_A)).await.unwrap();
    consumer.drain().await.unwrap();

    let handle = harness.workspace(WORKSPACE_B).unwrap();
    let ws = handle.read().await;
    assert_eq!(ws.stores(), &before);
    assert_eq!(ws.release_targets().len(), 1);
    assert!(harness.workspace(WORKSPACE_A).unwrap().read().await.release_targets().is_empty());
}
