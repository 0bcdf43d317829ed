//! Typed entity stores.
//!
//! A [`Store`] is an arena keyed by entity id. Its `upsert` is the only place
//! timestamps are written: `createdAt` on first insert, `updatedAt` on every
//! content change. No-op writes leave the entity untouched and emit nothing,
//! which keeps selector match-cache keys stable.

use chrono::{DateTime, Utc};
use rollout_core::Entity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of store mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Entity did not exist before
    Created,
    /// Entity content changed
    Updated,
    /// Entity was removed
    Deleted,
}

/// A store mutation with the entity before and after
#[derive(Debug, Clone, PartialEq)]
pub struct Change<T> {
    /// Mutation kind
    pub kind: ChangeKind,
    /// Entity before the mutation
    pub old: Option<T>,
    /// Entity after the mutation
    pub new: Option<T>,
}

impl<T: Entity> Change<T> {
    /// Id of the changed entity
    pub fn id(&self) -> &str {
        self.new
            .as_ref()
            .or(self.old.as_ref())
            .map(|e| e.id())
            .unwrap_or_default()
    }
}

type Listener<T> = Box<dyn Fn(&Change<T>) + Send + Sync>;

/// Keyed map of one entity kind
#[derive(Serialize, Deserialize)]
#[serde(transparent, bound(serialize = "T: Serialize", deserialize = "T: serde::de::DeserializeOwned"))]
pub struct Store<T: Entity> {
    items: BTreeMap<String, T>,
    #[serde(skip)]
    listeners: Vec<Listener<T>>,
}

impl<T: Entity> Store<T> {
    /// Empty store
    pub fn new() -> Self {
        Self { items: BTreeMap::new(), listeners: Vec::new() }
    }

    /// Entity by id
    pub fn get(&self, id: &str) -> Option<&T> {
        self.items.get(id)
    }

    /// Whether an entity exists
    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    /// Read-only view of every entity, ordered by id
    pub fn items(&self) -> &BTreeMap<String, T> {
        &self.items
    }

    /// Iterate entities ordered by id
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.items.values()
    }

    /// Number of entities
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Create or replace an entity, stamping it with `stamp` on change.
    ///
    /// Returns `None` when the write was a no-op.
    pub fn upsert(&mut self, mut entity: T, stamp: DateTime<Utc>) -> Option<Change<T>> {
        let id = entity.id().to_string();
        let change = match self.items.get(&id) {
            Some(existing) if existing.content_eq(&entity) => return None,
            Some(existing) => {
                let created_at = existing.created_at().or(entity.created_at()).or(Some(stamp));
                entity.set_timestamps(created_at, Some(stamp));
                Change {
                    kind: ChangeKind::Updated,
                    old: Some(existing.clone()),
                    new: Some(entity.clone()),
                }
            }
            None => {
                let created_at = entity.created_at().or(Some(stamp));
                let updated_at = entity.updated_at();
                entity.set_timestamps(created_at, updated_at);
                Change { kind: ChangeKind::Created, old: None, new: Some(entity.clone()) }
            }
        };

        self.items.insert(id, entity);
        self.notify(&change);
        Some(change)
    }

    /// Create or replace an entity keeping the timestamps it carries.
    ///
    /// For entities echoed back from the log, which were stamped when the
    /// engine first wrote them. Returns `None` when nothing changed.
    pub fn put_stamped(&mut self, entity: T) -> Option<Change<T>> {
        let id = entity.id().to_string();
        let old = match self.items.get(&id) {
            Some(existing) if *existing == entity => return None,
            existing => existing.cloned(),
        };
        let kind = if old.is_some() { ChangeKind::Updated } else { ChangeKind::Created };
        let change = Change { kind, old, new: Some(entity.clone()) };
        self.items.insert(id, entity);
        self.notify(&change);
        Some(change)
    }

    /// Remove an entity; no-op if absent
    pub fn remove(&mut self, id: &str) -> Option<Change<T>> {
        let old = self.items.remove(id)?;
        let change = Change { kind: ChangeKind::Deleted, old: Some(old), new: None };
        self.notify(&change);
        Some(change)
    }

    /// Register a listener called synchronously after every mutation.
    ///
    /// Listeners observe; they cannot reach back into the store.
    pub fn subscribe<F>(&mut self, listener: F)
    where
        F: Fn(&Change<T>) + Send + Sync + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    fn notify(&self, change: &Change<T>) {
        for listener in &self.listeners {
            listener(change);
        }
    }
}

impl<T: Entity> Default for Store<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> Clone for Store<T> {
    /// Clones the entities; listeners are not carried over
    fn clone(&self) -> Self {
        Self { items: self.items.clone(), listeners: Vec::new() }
    }
}

impl<T: Entity> PartialEq for Store<T> {
    fn eq(&self, other: &Self) -> bool {
        self.items == other.items
    }
}

impl<T: Entity> fmt::Debug for Store<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("kind", &T::KIND)
            .field("len", &self.items.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rollout_core::System;
    use std::sync::{Arc, Mutex};

    fn system(name: &str) -> System {
        System {
            id: "s1".into(),
            workspace_id: "ws".into(),
            name: name.into(),
            description: None,
            created_at: None,
            updated_at: None,
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs)
    }

    #[test]
    fn test_create_stamps_created_at() {
        let mut store = Store::new();
        let change = store.upsert(system("a"), t(0)).unwrap();

        assert_eq!(change.kind, ChangeKind::Created);
        let stored = store.get("s1").unwrap();
        assert_eq!(stored.created_at, Some(t(0)));
        assert_eq!(stored.updated_at, None);
    }

    #[test]
    fn test_noop_write_keeps_timestamps() {
        let mut store = Store::new();
        store.upsert(system("a"), t(0));
        assert!(store.upsert(system("a"), t(5)).is_none());
        assert_eq!(store.get("s1").unwrap().updated_at, None);
    }

    #[test]
    fn test_update_bumps_updated_at_and_keeps_created_at() {
        let mut store = Store::new();
        store.upsert(system("a"), t(0));
        let change = store.upsert(system("b"), t(5)).unwrap();

        assert_eq!(change.kind, ChangeKind::Updated);
        assert_eq!(change.old.unwrap().name, "a");
        let stored = store.get("s1").unwrap();
        assert_eq!(stored.created_at, Some(t(0)));
        assert_eq!(stored.updated_at, Some(t(5)));
    }

    #[test]
    fn test_remove_is_noop_when_absent() {
        let mut store: Store<System> = Store::new();
        assert!(store.remove("missing").is_none());
        store.upsert(system("a"), t(0));
        assert_eq!(store.remove("s1").unwrap().kind, ChangeKind::Deleted);
        assert!(store.is_empty());
    }

    #[test]
    fn test_put_stamped_keeps_carried_timestamps() {
        let mut store = Store::new();
        let mut echoed = system("a");
        echoed.created_at = Some(t(3));
        echoed.updated_at = Some(t(4));

        assert_eq!(store.put_stamped(echoed.clone()).unwrap().kind, ChangeKind::Created);
        assert!(store.put_stamped(echoed.clone()).is_none());
        assert_eq!(store.get("s1"), Some(&echoed));
    }

    #[test]
    fn test_listeners_see_every_mutation() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut store = Store::new();
        let sink = seen.clone();
        store.subscribe(move |change: &Change<System>| {
            sink.lock().unwrap().push((change.kind, change.id().to_string()));
        });

        store.upsert(system("a"), t(0));
        store.upsert(system("a"), t(1));
        store.upsert(system("b"), t(2));
        store.remove("s1");

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (ChangeKind::Created, "s1".to_string()),
                (ChangeKind::Updated, "s1".to_string()),
                (ChangeKind::Deleted, "s1".to_string()),
            ]
        );
    }

    #[test]
    fn test_serializes_as_plain_map() {
        let mut store = Store::new();
        store.upsert(system("a"), t(0));
        let value = serde_json::to_value(&store).unwrap();
        assert!(value.get("s1").is_some());

        let restored: Store<System> = serde_json::from_value(value).unwrap();
        assert_eq!(restored, store);
    }
}
