//! Process-wide workspace registry.
//!
//! Each workspace sits behind its own `tokio::sync::RwLock`, which is the
//! single-writer guarantee: events are applied under the write lock, queries
//! and snapshot encoding take the read lock. The map itself is a `DashMap`,
//! so looking up one workspace never blocks on another.

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::workspace::Workspace;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Shared handle to one workspace
pub type WorkspaceHandle = Arc<RwLock<Workspace>>;

/// Workspaces loaded by this process
pub struct WorkspaceRegistry {
    workspaces: DashMap<String, WorkspaceHandle>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
}

impl WorkspaceRegistry {
    /// Empty registry; new workspaces get `config` and `clock`
    pub fn new(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        Self { workspaces: DashMap::with_capacity(16), config, clock }
    }

    /// Engine settings handed to new workspaces
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Clock handed to new workspaces
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Register a workspace, replacing any existing one with the same id
    pub fn register(&self, workspace: Workspace) -> WorkspaceHandle {
        let id = workspace.id().to_string();
        let handle = Arc::new(RwLock::new(workspace));
        if self.workspaces.insert(id.clone(), handle.clone()).is_some() {
            debug!(workspace_id = %id, "Replaced registered workspace");
        } else {
            info!(workspace_id = %id, "Registered workspace");
        }
        handle
    }

    /// Workspace by id
    pub fn get(&self, id: &str) -> Option<WorkspaceHandle> {
        self.workspaces.get(id).map(|entry| entry.value().clone())
    }

    /// Workspace by id, creating an empty one if it is not loaded
    pub fn get_or_create(&self, id: &str) -> WorkspaceHandle {
        self.workspaces
            .entry(id.to_string())
            .or_insert_with(|| {
                info!(workspace_id = %id, "Created empty workspace");
                Arc::new(RwLock::new(Workspace::new(id, self.config.clone(), self.clock.clone())))
            })
            .value()
            .clone()
    }

    /// Drop a workspace from memory
    pub fn evict(&self, id: &str) -> Option<WorkspaceHandle> {
        let removed = self.workspaces.remove(id).map(|(_, handle)| handle);
        if removed.is_some() {
            info!(workspace_id = %id, "Evicted workspace");
        }
        removed
    }

    /// Drop every workspace whose id matches `predicate`; returns the evicted
    /// ids
    pub fn evict_where<F>(&self, predicate: F) -> Vec<String>
    where
        F: Fn(&str) -> bool,
    {
        let ids: Vec<String> = self
            .workspaces
            .iter()
            .filter(|entry| predicate(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for id in &ids {
            self.evict(id);
        }
        ids
    }

    /// Loaded workspace ids, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workspaces.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Number of loaded workspaces
    pub fn len(&self) -> usize {
        self.workspaces.len()
    }

    /// Whether no workspace is loaded
    pub fn is_empty(&self) -> bool {
        self.workspaces.is_empty()
    }
}

impl std::fmt::Debug for WorkspaceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceRegistry").field("workspaces", &self.ids()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn registry() -> WorkspaceRegistry {
        WorkspaceRegistry::new(EngineConfig::default(), Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_handle() {
        let registry = registry();
        let first = registry.get_or_create("ws-1");
        let second = registry.get_or_create("ws-1");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.read().await.id(), "ws-1");
    }

    #[test]
    fn test_evict_where() {
        let registry = registry();
        registry.get_or_create("a-1");
        registry.get_or_create("a-2");
        registry.get_or_create("b-1");

        let evicted = registry.evict_where(|id| id.starts_with("a-"));
        assert_eq!(evicted.len(), 2);
        assert_eq!(registry.ids(), vec!["b-1".to_string()]);
        assert!(registry.get("a-1").is_none());
    }
}
