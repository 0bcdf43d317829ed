use rollout_core::selector::cache::DEFAULT_MATCH_CACHE_CAPACITY;
use serde::{Deserialize, Serialize};

fn default_reconcile_budget() -> usize {
    16
}

fn default_match_cache_capacity() -> usize {
    DEFAULT_MATCH_CACHE_CAPACITY
}

/// Per-workspace engine settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum reconciler passes per event before giving up on a fixed point
    #[serde(default = "default_reconcile_budget")]
    pub reconcile_budget: usize,

    /// Selector match cache entries per workspace
    #[serde(default = "default_match_cache_capacity")]
    pub match_cache_capacity: usize,

    /// Cancel pending jobs when their release target disappears
    #[serde(default)]
    pub cancel_pending_jobs_on_target_removal: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reconcile_budget: default_reconcile_budget(),
            match_cache_capacity: default_match_cache_capacity(),
            cancel_pending_jobs_on_target_removal: false,
        }
    }
}
