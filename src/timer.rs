//! Keyed Expiry Timer
//!
//! Tracks a deadline per key. Refreshing a key pushes a new heap entry and
//! bumps the key's generation, so superseded heap entries are skipped lazily
//! when the heap is drained.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Heap entries are compacted once stale ones outnumber live keys by this factor
const COMPACT_FACTOR: usize = 4;

/// Deadline tracker keyed by `K`
#[derive(Debug)]
pub struct ExpiryTimer<K> {
    /// Lifetime applied by `set`
    ttl: Duration,
    /// Live keys: key -> (deadline, generation)
    deadlines: HashMap<K, (Instant, u64)>,
    /// Min-heap of (deadline, generation, key)
    queue: BinaryHeap<Reverse<(Instant, u64, K)>>,
    /// Monotonic generation counter
    generation: u64,
}

impl<K> ExpiryTimer<K>
where
    K: Hash + Eq + Ord + Clone,
{
    /// Create a timer whose keys live for `ttl` after their last refresh
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            deadlines: HashMap::new(),
            queue: BinaryHeap::new(),
            generation: 0,
        }
    }

    /// Lifetime applied by `set`
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Insert or refresh a key so that it expires `ttl` after `now`
    pub fn set(&mut self, key: K, now: Instant) {
        let deadline = now + self.ttl;
        self.set_deadline(key, deadline);
    }

    /// Insert or refresh a key with an explicit deadline
    pub fn set_deadline(&mut self, key: K, deadline: Instant) {
        self.generation += 1;
        let generation = self.generation;
        self.deadlines.insert(key.clone(), (deadline, generation));
        self.queue.push(Reverse((deadline, generation, key)));
        self.maybe_compact();
    }

    /// Check whether a key is tracked
    pub fn contains(&self, key: &K) -> bool {
        self.deadlines.contains_key(key)
    }

    /// Deadline of a key, if tracked
    pub fn deadline(&self, key: &K) -> Option<Instant> {
        self.deadlines.get(key).map(|(d, _)| *d)
    }

    /// Stop tracking a key
    pub fn remove(&mut self, key: &K) -> bool {
        self.deadlines.remove(key).is_some()
    }

    /// Forget every key
    pub fn clear(&mut self) {
        self.deadlines.clear();
        self.queue.clear();
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    /// Check if no key is tracked
    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    /// Earliest live deadline
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, generation, key))) = self.queue.peek() {
            if self.is_live(key, *generation) {
                return Some(*deadline);
            }
            self.queue.pop();
        }
        None
    }

    /// Remove and return every key whose deadline is at or before `now`
    pub fn drain_expired(&mut self, now: Instant) -> Vec<K> {
        let mut expired = Vec::new();

        while let Some(Reverse((deadline, _, _))) = self.queue.peek() {
            if *deadline > now {
                break;
            }
            let Some(Reverse((_, generation, key))) = self.queue.pop() else {
                break;
            };
            if self.is_live(&key, generation) {
                self.deadlines.remove(&key);
                expired.push(key);
            }
        }

        expired
    }

    fn is_live(&self, key: &K, generation: u64) -> bool {
        matches!(self.deadlines.get(key), Some((_, g)) if *g == generation)
    }

    /// Rebuild the heap from live keys when stale entries dominate
    fn maybe_compact(&mut self) {
        if self.queue.len() <= (self.deadlines.len() + 16) * COMPACT_FACTOR {
            return;
        }
        self.queue = self
            .deadlines
            .iter()
            .map(|(k, (d, g))| Reverse((*d, *g, k.clone())))
            .collect();
    }
}
