//! The storage seam.

use crate::entry::CacheEntry;
use crate::error::StoreError;
use crate::sharded::CacheStats;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Key-value storage for cache entries. Expiry is the store's job: an entry set with a
/// `ttl` must stop being returned once it elapses.
///
/// Implementations are free to fail; callers treat a failed `get` as a miss and a failed
/// `set`/`remove` as a no-op.
#[async_trait]
pub trait ResponseCacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError>;

    async fn set(&self, key: &str, entry: CacheEntry, ttl: Duration) -> Result<(), StoreError>;

    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Occupancy and hit counters, for stores that keep them.
    fn stats(&self) -> Option<CacheStats> {
        None
    }
}

#[async_trait]
impl<S: ResponseCacheStore + ?Sized> ResponseCacheStore for Arc<S> {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, entry: CacheEntry, ttl: Duration) -> Result<(), StoreError> {
        (**self).set(key, entry, ttl).await
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        (**self).remove(key).await
    }

    fn stats(&self) -> Option<CacheStats> {
        (**self).stats()
    }
}
