use crate::arena::{Arena, Node, NIL};
use crate::sharded::CacheStats;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Longest lifetime an entry can be given.
const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// SIEVE eviction (NSDI '24) with per-entry expiry.
///
/// New entries go in at the head. A hand walks from the tail toward the head: visited
/// entries have their bit cleared and stay where they are, the first unvisited or expired
/// entry is evicted. A hit only sets the visited bit.
pub struct SieveCache<V> {
    arena: Arena<V>,
    map: HashMap<String, u32>,
    hand: u32,
    capacity: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl<V> SieveCache<V> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be > 0");
        Self {
            arena: Arena::new(capacity),
            map: HashMap::with_capacity(capacity),
            hand: NIL,
            capacity,
            hits: 0,
            misses: 0,
            evictions: 0,
            expirations: 0,
        }
    }

    fn evict_one(&mut self, now: Instant) {
        loop {
            if self.hand == NIL {
                self.hand = self.arena.tail;
            }
            let index = self.hand;
            let Some(node) = self.arena.get(index) else {
                return;
            };

            let expired = node.is_expired(now);
            if !expired && node.clear_visited() {
                self.hand = node.prev;
                continue;
            }

            self.hand = node.prev;
            if let Some(evicted) = self.arena.remove(index) {
                self.map.remove(&evicted.key);
            }
            if expired {
                self.expirations += 1;
            } else {
                self.evictions += 1;
            }
            return;
        }
    }

    fn unlink(&mut self, index: u32) {
        if self.hand == index {
            self.hand = self.arena.get(index).map_or(NIL, |n| n.prev);
        }
        if let Some(node) = self.arena.remove(index) {
            self.map.remove(&node.key);
        }
    }

    pub fn get(&mut self, key: &str, now: Instant) -> Option<Arc<V>> {
        let Some(&index) = self.map.get(key) else {
            self.misses += 1;
            return None;
        };
        let node = self.arena.get(index)?;
        if node.is_expired(now) {
            self.misses += 1;
            self.expirations += 1;
            self.unlink(index);
            return None;
        }
        self.hits += 1;
        node.mark_visited();
        Some(Arc::clone(&node.value))
    }

    /// Insert or replace `key`, evicting if full. The entry stops being returned once
    /// `ttl` has elapsed.
    pub fn insert(&mut self, key: String, value: V, ttl: Duration, now: Instant) {
        if let Some(&old) = self.map.get(&key) {
            self.unlink(old);
        }
        while self.arena.len() >= self.capacity {
            self.evict_one(now);
        }

        let expires_at = now + ttl.min(MAX_TTL);
        if let Some(index) = self.arena.push_head(Node::new(key.clone(), value, expires_at)) {
            self.map.insert(key, index);
        }
    }

    pub fn remove(&mut self, key: &str) -> bool {
        match self.map.get(key) {
            Some(&index) => {
                self.unlink(index);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            expirations: self.expirations,
            current_size: self.arena.len(),
            capacity: self.capacity,
        }
    }
}
