//! Bounded record of billable events that matched no rule.
//!
//! Keyed by `(tag, rule_name)`. A repeated key bumps its count in place; a
//! new key past capacity evicts the oldest-inserted key.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Longest kept sample, in characters, before the `...` marker.
pub const SAMPLE_MAX_CHARS: usize = 500;

/// Entries returned by a snapshot when no limit is given.
pub const DEFAULT_SNAPSHOT_LIMIT: usize = 200;

type Key = (String, String);

/// One unmatched `(tag, rule_name)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnmatchedItem {
    pub tag: String,
    pub rule_name: String,
    /// Most recent log line, truncated.
    pub sample: String,
    pub count: u64,
    pub last_seen: DateTime<Utc>,
}

struct Slot {
    item: UnmatchedItem,
    touch: u64,
}

#[derive(Default)]
struct RingState {
    entries: HashMap<Key, Slot>,
    /// Keys in first-insertion order, for eviction.
    arrival: VecDeque<Key>,
    /// Keys by last touch, for snapshots.
    touched: BTreeMap<u64, Key>,
    next_touch: u64,
}

/// Fixed-capacity keyed ring.
pub struct UnmatchedRing {
    capacity: usize,
    state: Mutex<RingState>,
}

impl std::fmt::Debug for UnmatchedRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnmatchedRing")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

fn truncate_sample(line: &str) -> String {
    match line.char_indices().nth(SAMPLE_MAX_CHARS) {
        Some((cut, _)) => format!("{}...", &line[..cut]),
        None => line.to_string(),
    }
}

impl UnmatchedRing {
    /// A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(RingState::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record one occurrence. Ignored when both tag and rule name are empty.
    pub fn record(&self, tag: &str, rule_name: &str, log_line: &str) {
        if tag.is_empty() && rule_name.is_empty() {
            return;
        }
        let key = (tag.to_string(), rule_name.to_string());
        let sample = truncate_sample(log_line);
        let now = Utc::now();

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let touch = state.next_touch;
        state.next_touch += 1;

        if let Some(slot) = state.entries.get_mut(&key) {
            state.touched.remove(&slot.touch);
            slot.touch = touch;
            slot.item.count += 1;
            slot.item.sample = sample;
            slot.item.last_seen = now;
            state.touched.insert(touch, key);
            return;
        }

        while state.entries.len() >= self.capacity {
            let Some(oldest) = state.arrival.pop_front() else {
                break;
            };
            if let Some(evicted) = state.entries.remove(&oldest) {
                state.touched.remove(&evicted.touch);
            }
        }

        state.arrival.push_back(key.clone());
        state.touched.insert(touch, key.clone());
        state.entries.insert(
            key.clone(),
            Slot {
                item: UnmatchedItem {
                    tag: key.0,
                    rule_name: key.1,
                    sample,
                    count: 1,
                    last_seen: now,
                },
                touch,
            },
        );
    }

    /// Up to `limit` entries, most recently touched first. A `limit` of 0
    /// returns every entry.
    pub fn snapshot(&self, limit: usize) -> Vec<UnmatchedItem> {
        let state = self.state.lock();
        let limit = if limit == 0 { usize::MAX } else { limit };
        state
            .touched
            .values()
            .rev()
            .take(limit)
            .filter_map(|key| state.entries.get(key))
            .map(|slot| slot.item.clone())
            .collect()
    }
}
