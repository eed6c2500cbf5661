//! Bounded seen-set of event ids.
//!
//! Ids are remembered in insertion order. When the set grows past its
//! capacity the oldest half is evicted, so memory stays bounded while the
//! most recent ids are always retained.

use std::collections::{HashSet, VecDeque};
use tracing::debug;

pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug)]
pub struct Deduplicator {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Deduplicator {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity + 1),
            seen: HashSet::with_capacity(capacity + 1),
        }
    }

    pub fn seen(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    /// Record `id`. Marking an id already present is a no-op.
    pub fn mark_seen(&mut self, id: &str) {
        if !self.seen.insert(id.to_string()) {
            return;
        }
        self.order.push_back(id.to_string());
        if self.order.len() > self.capacity {
            self.evict_oldest_half();
        }
    }

    /// Returns true if `id` is new (and records it), false for a duplicate.
    pub fn check_and_mark(&mut self, id: &str) -> bool {
        if self.seen(id) {
            return false;
        }
        self.mark_seen(id);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }

    fn evict_oldest_half(&mut self) {
        let evict = self.order.len() / 2;
        for id in self.order.drain(..evict) {
            self.seen.remove(&id);
        }
        debug!(evicted = evict, retained = self.order.len(), "dedup window trimmed");
    }
}
