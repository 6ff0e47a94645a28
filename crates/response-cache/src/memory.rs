//! In-process store holding entries as values.

use crate::entry::CacheEntry;
use crate::error::StoreError;
use crate::sharded::{CacheStats, ShardedCache};
use crate::store::ResponseCacheStore;
use async_trait::async_trait;
use std::time::Duration;

/// Entries live in a sharded SIEVE cache bounded by entry count. Nothing is serialized:
/// a hit clones the entry, which shares the body shards.
pub struct MemoryResponseStore {
    cache: ShardedCache<CacheEntry>,
}

impl MemoryResponseStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: ShardedCache::new(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[async_trait]
impl ResponseCacheStore for MemoryResponseStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        Ok(self.cache.get(key).map(|entry| (*entry).clone()))
    }

    async fn set(&self, key: &str, entry: CacheEntry, ttl: Duration) -> Result<(), StoreError> {
        tracing::trace!(
            key = %key.escape_debug(),
            kind = entry.kind(),
            ttl_ms = ttl.as_millis() as u64,
            "memory store set"
        );
        self.cache.insert(key.to_owned(), entry, ttl);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.cache.remove(key);
        Ok(())
    }

    fn stats(&self) -> Option<CacheStats> {
        Some(self.cache.stats())
    }
}
