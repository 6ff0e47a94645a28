use crate::sieve::SieveCache;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Number of shards. Power of two so selection is a mask.
const NUM_SHARDS: usize = 64;
const SHARD_MASK: u64 = (NUM_SHARDS as u64) - 1;

/// Counters for an in-process store.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub current_size: usize,
    pub capacity: usize,
}

/// 64 independently locked SIEVE caches. Keys are spread with `ahash` so concurrent
/// requests for different resources rarely contend.
pub struct ShardedCache<V> {
    shards: Box<[RwLock<SieveCache<V>>]>,
}

impl<V> ShardedCache<V> {
    /// Each shard gets `total_capacity / 64` slots, minimum 1.
    pub fn new(total_capacity: usize) -> Self {
        let per_shard = (total_capacity / NUM_SHARDS).max(1);
        let shards = (0..NUM_SHARDS)
            .map(|_| RwLock::new(SieveCache::new(per_shard)))
            .collect();
        Self { shards }
    }

    #[inline]
    fn shard(&self, key: &str) -> &RwLock<SieveCache<V>> {
        let hash = ahash::RandomState::with_seeds(1, 2, 3, 4).hash_one(key);
        &self.shards[(hash & SHARD_MASK) as usize]
    }

    /// Takes the write lock: an expired hit is unlinked on the spot.
    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        self.shard(key).write().get(key, Instant::now())
    }

    pub fn insert(&self, key: String, value: V, ttl: Duration) {
        self.shard(&key).write().insert(key, value, ttl, Instant::now());
    }

    pub fn remove(&self, key: &str) -> bool {
        self.shard(key).write().remove(key)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shards.iter().map(|s| s.read().capacity()).sum()
    }

    pub fn stats(&self) -> CacheStats {
        let mut total = CacheStats::default();
        for shard in self.shards.iter() {
            let s = shard.read().stats();
            total.hits += s.hits;
            total.misses += s.misses;
            total.evictions += s.evictions;
            total.expirations += s.expirations;
            total.current_size += s.current_size;
            total.capacity += s.capacity;
        }
        total
    }
}
