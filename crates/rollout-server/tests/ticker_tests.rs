use chrono::Duration;
use rollout_server::PartitionConsumer;
use rollout_test_utils::builders::*;
use rollout_test_utils::ServerHarness;

/// Two resources behind a one-minute gradual rollout: `r1` deploys at once,
/// `r2` is deferred by sixty seconds.
async fn deferred_rollout(harness: &ServerHarness) -> PartitionConsumer {
    for entity in [
        system("sys"),
        job_agent("agent"),
        environment("prod", "sys"),
        deployment_with_agent("api", "sys", "agent"),
        resource("r1"),
        resource("r2"),
        policy("rollout", vec![rules::gradual_rollout(60)]),
        version("api", "v1"),
    ] {
        harness.create("ws-1", &entity).await.unwrap();
    }
    let mut consumer = harness.consumer(0).unwrap();
    consumer.cold_start().await.unwrap();
    consumer.drain().await.unwrap();
    consumer
}

#[tokio::test]
async fn test_tick_appended_once_deadline_passes() {
    let harness = ServerHarness::new(1);
    let _consumer = deferred_rollout(&harness).await;
    assert_eq!(harness.dispatcher.dispatched().len(), 1);

    let mut ticker = harness.ticker();
    assert!(ticker.tick_once().await.unwrap().is_empty());

    harness.clock.advance(Duration::seconds(61));
    assert_eq!(ticker.tick_once().await.unwrap(), vec!["ws-1".to_string()]);
    assert_eq!(harness.event_types(0).last().map(String::as_str), Some("workspace.tick"));

    // Same deadline, no second tick
    assert!(ticker.tick_once().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_consumed_tick_releases_deferred_target() {
    let harness = ServerHarness::new(1);
    let mut consumer = deferred_rollout(&harness).await;

    harness.clock.advance(Duration::seconds(61));
    let mut ticker = harness.ticker();
    ticker.tick_once().await.unwrap();
    assert_eq!(consumer.drain().await.unwrap(), 2);

    let dispatched = harness.dispatcher.dispatched();
    assert_eq!(dispatched.len(), 2);
    assert_ne!(dispatched[0].release_id, dispatched[1].release_id);
}

#[tokio::test]
async fn test_ticker_skips_workspaces_without_deadlines() {
    let harness = ServerHarness::new(1);
    harness.create("ws-idle", &system("sys")).await.unwrap();
    let mut consumer = harness.consumer(0).unwrap();
    consumer.cold_start().await.unwrap();
    consumer.drain().await.unwrap();

    harness.clock.advance(Duration::hours(1));
    assert!(harness.ticker().tick_once().await.unwrap().is_empty());
}
