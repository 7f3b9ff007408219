//! Bounded de-duplication cache for poller results.
//!
//! Keys are opaque strings naming a unit of delivered state. A key present
//! here means its event has already been emitted (or deliberately swallowed
//! by the startup warm-up pass). Eviction is FIFO by insertion order and only
//! happens in [`DedupCache::trim`]; inserts never evict.

use std::collections::{HashSet, VecDeque};

/// Default number of keys kept per cache after a trim.
pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
pub struct DedupCache {
    keys: HashSet<String>,
    /// Insertion order, oldest first
    order: VecDeque<String>,
    capacity: usize,
    /// Keys inserted since the last trim. These are never evicted by the
    /// trim that closes their cycle.
    fresh: usize,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            keys: HashSet::new(),
            order: VecDeque::new(),
            capacity,
            fresh: 0,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    /// Insert a key. Returns `true` if it was not already present.
    pub fn insert(&mut self, key: impl Into<String>) -> bool {
        let key = key.into();
        if self.keys.contains(&key) {
            return false;
        }
        self.keys.insert(key.clone());
        self.order.push_back(key);
        self.fresh += 1;
        true
    }

    /// Evict oldest keys until the cache fits its capacity, sparing keys
    /// inserted since the previous trim. Returns the number evicted.
    pub fn trim(&mut self) -> usize {
        let mut evictable = self.order.len().saturating_sub(self.fresh);
        let mut evicted = 0;
        while self.order.len() > self.capacity && evictable > 0 {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
                evicted += 1;
            }
            evictable -= 1;
        }
        self.fresh = 0;
        evicted
    }

    pub fn clear(&mut self) {
        self.keys.clear();
        self.order.clear();
        self.fresh = 0;
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
