use crate::error::CoreResult;
use crate::selector::{Matchable, Selector};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Default number of cached match results per workspace
pub const DEFAULT_MATCH_CACHE_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MatchKey {
    fingerprint: String,
    entity_id: String,
    stamp: i64,
}

/// Hit/miss counters of a [`MatchCache`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchCacheStats {
    /// Lookups served from the cache
    pub hits: u64,
    /// Lookups that evaluated the selector
    pub misses: u64,
    /// Entries currently cached
    pub entries: usize,
}

/// LRU cache of selector results keyed by
/// `(selector fingerprint, entity id, updatedAt ?? createdAt)`.
///
/// Any timestamp change on the entity produces a new key, so stale entries
/// simply age out. Evaluation errors are never cached.
pub struct MatchCache {
    entries: Mutex<LruCache<MatchKey, bool>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MatchCache {
    /// Create a cache holding at most `capacity` results
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Evaluate `selector` against `entity`, consulting the cache first
    pub fn matches<M: Matchable + ?Sized>(&self, selector: &Selector, entity: &M) -> CoreResult<bool> {
        let key = MatchKey {
            fingerprint: selector.fingerprint(),
            entity_id: entity.match_id().to_string(),
            stamp: entity.match_stamp(),
        };

        if let Some(hit) = self.lock().get(&key).copied() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let result = selector.matches(entity)?;
        self.lock().put(key, result);
        Ok(result)
    }

    /// Evaluate an optional selector; `None` matches without touching the cache
    pub fn matches_optional<M: Matchable + ?Sized>(
        &self,
        selector: Option<&Selector>,
        entity: &M,
    ) -> CoreResult<bool> {
        match selector {
            Some(selector) => self.matches(selector, entity),
            None => Ok(true),
        }
    }

    /// Drop every cached result
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Current counters
    pub fn stats(&self) -> MatchCacheStats {
        MatchCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.lock().len(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<MatchKey, bool>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MatchCache {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_CACHE_CAPACITY)
    }
}

impl std::fmt::Debug for MatchCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatchCache").field("stats", &self.stats()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::Environment;
    use crate::domain::entity::Entity;
    use chrono::{TimeZone, Utc};

    fn environment(name: &str) -> Environment {
        Environment {
            id: "e1".into(),
            system_id: "s1".into(),
            name: name.into(),
            description: None,
            resource_selector: None,
            created_at: Some(Utc.timestamp_opt(1, 0).unwrap()),
            updated_at: None,
        }
    }

    #[test]
    fn test_hits_until_timestamp_changes() {
        let cache = MatchCache::new(16);
        let selector = Selector::Cel("environment.name == 'prod'".into());
        let mut env = environment("prod");

        assert!(cache.matches(&selector, &env).unwrap());
        assert!(cache.matches(&selector, &env).unwrap());
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);

        env.name = "dev".into();
        env.set_timestamps(env.created_at, Some(Utc.timestamp_opt(2, 0).unwrap()));
        assert!(!cache.matches(&selector, &env).unwrap());
        assert_eq!(cache.stats().misses, 2);
    }

    #[test]
    fn test_capacity_is_bounded() {
        let cache = MatchCache::new(2);
        for i in 0..5 {
            let selector = Selector::Cel(format!("environment.name == 'env-{}'", i));
            cache.matches(&selector, &environment("prod")).unwrap();
        }
        assert_eq!(cache.stats().entries, 2);
    }

    #[test]
    fn test_errors_are_not_cached() {
        let cache = MatchCache::new(4);
        let selector = Selector::Cel("environment.name ==".into());
        assert!(cache.matches(&selector, &environment("prod")).is_err());
        assert_eq!(cache.stats().entries, 0);
    }
}
