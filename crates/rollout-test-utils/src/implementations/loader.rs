use async_trait::async_trait;
use rollout_server::bootstrap::{EntityRow, InitialStateLoader};
use rollout_server::ServerResult;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Initial state held in memory, standing in for the database
#[derive(Debug, Default)]
pub struct StaticInitialStateLoader {
    rows: Mutex<BTreeMap<String, Vec<EntityRow>>>,
}

impl StaticInitialStateLoader {
    /// Loader without workspaces
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a row to `workspace_id`
    pub fn insert(&self, workspace_id: &str, kind: &str, data: serde_json::Value) {
        self.rows
            .lock()
            .unwrap()
            .entry(workspace_id.to_string())
            .or_default()
            .push(EntityRow { kind: kind.to_string(), data });
    }
}

#[async_trait]
impl InitialStateLoader for StaticInitialStateLoader {
    async fn workspace_ids(&self) -> ServerResult<Vec<String>> {
        Ok(self.rows.lock().unwrap().keys().cloned().collect())
    }

    async fn load(&self, workspace_id: &str) -> ServerResult<Vec<EntityRow>> {
        Ok(self.rows.lock().unwrap().get(workspace_id).cloned().unwrap_or_default())
    }
}
