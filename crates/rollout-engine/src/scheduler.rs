//! Deferred re-evaluation queue.
//!
//! The planner schedules "re-plan target T at or after t" whenever an
//! evaluator defers. Entries for the same target collapse to the earliest
//! deadline. The queue is part of the workspace snapshot so restarts do not
//! lose deferred deployments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};

/// One pending re-evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledEntry {
    /// Release target key
    pub target_key: String,
    /// Earliest time the target should be re-planned
    pub deadline: DateTime<Utc>,
    /// Why the target was deferred
    pub reason: String,
}

/// Min-heap of deadlines with one live entry per target
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    heap: BinaryHeap<Reverse<(DateTime<Utc>, String)>>,
    entries: BTreeMap<String, ScheduledEntry>,
}

impl Scheduler {
    /// Empty scheduler
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a target. Keeps the earlier deadline if one is already queued.
    /// Returns whether the queue changed.
    pub fn schedule(&mut self, target_key: &str, deadline: DateTime<Utc>, reason: impl Into<String>) -> bool {
        if let Some(existing) = self.entries.get(target_key) {
            if existing.deadline <= deadline {
                return false;
            }
        }
        self.entries.insert(
            target_key.to_string(),
            ScheduledEntry { target_key: target_key.to_string(), deadline, reason: reason.into() },
        );
        self.heap.push(Reverse((deadline, target_key.to_string())));
        true
    }

    /// Remove a target's entry
    pub fn cancel(&mut self, target_key: &str) {
        self.entries.remove(target_key);
    }

    /// Earliest live deadline
    pub fn next_deadline(&mut self) -> Option<DateTime<Utc>> {
        self.discard_stale();
        self.heap.peek().map(|Reverse((deadline, _))| *deadline)
    }

    /// Pop every entry whose deadline is at or before `now`, ordered by
    /// deadline
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<ScheduledEntry> {
        let mut due = Vec::new();
        loop {
            self.discard_stale();
            match self.heap.peek() {
                Some(Reverse((deadline, _))) if *deadline <= now => {}
                _ => break,
            }
            if let Some(Reverse((_, key))) = self.heap.pop() {
                if let Some(entry) = self.entries.remove(&key) {
                    due.push(entry);
                }
            }
        }
        due
    }

    /// Live entries ordered by target key
    pub fn entries(&self) -> Vec<ScheduledEntry> {
        self.entries.values().cloned().collect()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is scheduled
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rebuild from persisted entries
    pub fn from_entries(entries: Vec<ScheduledEntry>) -> Self {
        let mut scheduler = Self::new();
        for entry in entries {
            scheduler.schedule(&entry.target_key, entry.deadline, entry.reason);
        }
        scheduler
    }

    /// Drop heap heads that no longer match a live entry
    fn discard_stale(&mut self) {
        while let Some(Reverse((deadline, key))) = self.heap.peek() {
            let live = self
                .entries
                .get(key)
                .map(|entry| entry.deadline == *deadline)
                .unwrap_or(false);
            if live {
                break;
            }
            self.heap.pop();
        }
    }
}

impl PartialEq for Scheduler {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs)
    }

    #[test]
    fn test_collapses_to_earliest_deadline() {
        let mut scheduler = Scheduler::new();
        assert!(scheduler.schedule("t1", t(100), "cooldown"));
        assert!(!scheduler.schedule("t1", t(200), "window"));
        assert!(scheduler.schedule("t1", t(50), "window"));

        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.next_deadline(), Some(t(50)));
        assert_eq!(scheduler.entries()[0].reason, "window");
    }

    #[test]
    fn test_pop_due_in_deadline_order() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule("b", t(20), "x");
        scheduler.schedule("a", t(10), "x");
        scheduler.schedule("c", t(30), "x");

        let due = scheduler.pop_due(t(25));
        let keys: Vec<_> = due.iter().map(|e| e.target_key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(scheduler.next_deadline(), Some(t(30)));
        assert!(scheduler.pop_due(t(25)).is_empty());
    }

    #[test]
    fn test_cancel_and_restore() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule("a", t(10), "x");
        scheduler.schedule("b", t(20), "y");
        scheduler.cancel("a");
        assert_eq!(scheduler.next_deadline(), Some(t(20)));

        let restored = Scheduler::from_entries(scheduler.entries());
        assert_eq!(restored, scheduler);
    }
}
