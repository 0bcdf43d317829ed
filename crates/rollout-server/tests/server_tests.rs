use rollout_core::{EventEnvelope, EventType};
use rollout_engine::SystemClock;
use rollout_server::bootstrap::NoopInitialStateLoader;
use rollout_server::dispatch::{LoggingJobDispatcher, LoggingVerificationRunner};
use rollout_server::{partition_of, EngineServer, InMemoryPartitionLog, PartitionLog, ServerComponents, ServerConfig};
use rollout_snapshot_store::{InMemorySnapshotStorage, StorageSnapshotRegistry};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn config(vars: &[(&str, &str)]) -> ServerConfig {
    let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    ServerConfig::from_lookup(|name| vars.get(name).cloned()).unwrap()
}

fn server(num_partitions: i32) -> EngineServer {
    let storage = Arc::new(InMemorySnapshotStorage::new());
    let components = ServerComponents {
        log: Arc::new(InMemoryPartitionLog::new(num_partitions)),
        storage: storage.clone(),
        snapshot_registry: Arc::new(StorageSnapshotRegistry::new(storage)),
        loader: Arc::new(NoopInitialStateLoader),
        dispatcher: Arc::new(LoggingJobDispatcher),
        verifier: Arc::new(LoggingVerificationRunner),
        clock: Arc::new(SystemClock),
    };
    let partitions = num_partitions.to_string();
    EngineServer::with_components(config(&[("LOG_NUM_PARTITIONS", partitions.as_str()), ("TICK_INTERVAL_MS", "20")]), components)
}

async fn wait_for_live(server: &EngineServer, workspace_id: &str, expected: u64) {
    for _ in 0..200 {
        if server.stats().get(workspace_id).live >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} never reached {} live events", workspace_id, expected);
}

fn system_created(workspace_id: &str) -> EventEnvelope {
    EventEnvelope::new(
        EventType::Entity(rollout_core::EntityKind::System, rollout_core::EntityAction::Created),
        workspace_id,
        json!({ "id": "sys", "name": "sys" }),
    )
}

#[tokio::test]
async fn test_assigned_partitions_consume_in_background() {
    let mut server = server(2);
    server.assign(0).unwrap();
    server.assign(1).unwrap();
    server.assign(1).unwrap();
    assert_eq!(server.assigned(), vec![0, 1]);

    for id in ["ws-a", "ws-b", "ws-c", "ws-d"] {
        server.context().outbox.append(&system_created(id)).await.unwrap();
    }
    for id in ["ws-a", "ws-b", "ws-c", "ws-d"] {
        wait_for_live(&server, id, 1).await;
    }
    assert_eq!(server.workspaces().len(), 4);
}

#[tokio::test]
async fn test_revoke_stops_consumer_and_evicts() {
    let mut server = server(2);
    server.assign(0).unwrap();
    server.assign(1).unwrap();
    let ids: Vec<String> = (0..8).map(|i| format!("ws-{}", i)).collect();
    for id in &ids {
        server.context().outbox.append(&system_created(id)).await.unwrap();
    }
    for id in &ids {
        wait_for_live(&server, id, 1).await;
    }

    let evicted = server.revoke(1).await.unwrap();
    assert_eq!(server.assigned(), vec![0]);
    for id in &ids {
        let on_revoked = partition_of(id, 2) == 1;
        assert_eq!(evicted.contains(id), on_revoked);
        assert_eq!(server.workspaces().get(id).is_none(), on_revoked);
    }
}

#[tokio::test]
async fn test_run_until_stops_on_shutdown() {
    let server = server(1);
    let log = server.log().clone();
    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        server.run_until(tokio::time::sleep(Duration::from_millis(100))),
    )
    .await
    .expect("server did not stop");
    assert!(outcome.is_ok());
    assert_eq!(log.num_partitions(), 1);
}
