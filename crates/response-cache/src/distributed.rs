//! Storage over an opaque byte store, the shape of a remote key-value cache.
//!
//! Entries are serialized. Response bodies don't travel inline: each shard is stored
//! under its own key and the response record only carries the shard-key prefix and
//! count, so no single value grows with the body.

use crate::entry::CacheEntry;
use crate::error::StoreError;
use crate::serializer::{self, Decoded, DetachedResponse};
use crate::sharded::{CacheStats, ShardedCache};
use crate::store::ResponseCacheStore;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Byte values under string keys, with expiry.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError>;

    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    fn stats(&self) -> Option<CacheStats> {
        None
    }
}

/// In-process [`BlobStore`].
pub struct MemoryBlobStore {
    cache: ShardedCache<Bytes>,
}

impl MemoryBlobStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: ShardedCache::new(capacity),
        }
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        Ok(self.cache.get(key).map(|b| Bytes::clone(&b)))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError> {
        self.cache.insert(key.to_owned(), value, ttl);
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

/// [`ResponseCacheStore`] that serializes into a [`BlobStore`], one value per body shard.
pub struct ShardedResponseStore<B> {
    blobs: B,
}

impl<B: BlobStore> ShardedResponseStore<B> {
    pub fn new(blobs: B) -> Self {
        Self { blobs }
    }

    pub fn blobs(&self) -> &B {
        &self.blobs
    }

    async fn fetch_shards(
        &self,
        detached: &DetachedResponse,
    ) -> Result<Option<Vec<Bytes>>, StoreError> {
        let mut shards = Vec::with_capacity(detached.shard_count as usize);
        for shard_key in detached.shard_keys() {
            match self.blobs.get(&shard_key).await? {
                Some(shard) => shards.push(shard),
                None => {
                    tracing::debug!(shard = %shard_key, "body shard missing");
                    return Ok(None);
                }
            }
        }
        Ok(Some(shards))
    }

    async fn remove_shards(&self, detached: &DetachedResponse) -> Result<(), StoreError> {
        for shard_key in detached.shard_keys() {
            self.blobs.remove(&shard_key).await?;
        }
        Ok(())
    }
}

fn detached_record(bytes: Bytes) -> Option<DetachedResponse> {
    match serializer::decode_any(bytes) {
        Some(Decoded::Detached(detached)) => Some(detached),
        _ => None,
    }
}

#[async_trait]
impl<B: BlobStore> ResponseCacheStore for ShardedResponseStore<B> {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        let Some(bytes) = self.blobs.get(key).await? else {
            return Ok(None);
        };
        match serializer::decode_any(bytes) {
            None => Ok(None),
            Some(Decoded::Entry(entry)) => Ok(Some(entry)),
            Some(Decoded::Detached(detached)) => {
                let Some(shards) = self.fetch_shards(&detached).await? else {
                    return Ok(None);
                };
                let response = detached.attach(shards);
                if response.is_none() {
                    tracing::debug!(
                        key = %key.escape_debug(),
                        "body shards don't match their record"
                    );
                }
                Ok(response.map(CacheEntry::Response))
            }
        }
    }

    /// Shards are written before the record that points at them, under a prefix unique to
    /// this write, so a concurrent reader never sees a record with another write's body.
    /// The shards of the record being replaced are dropped once the new one is in place.
    async fn set(&self, key: &str, entry: CacheEntry, ttl: Duration) -> Result<(), StoreError> {
        let record = match &entry {
            CacheEntry::Response(response) => {
                let prefix = format!("{key}\x1fS{}\x1f", uuid::Uuid::new_v4().simple());
                for (i, shard) in response.body.shards().iter().enumerate() {
                    let shard_key = DetachedResponse::shard_key(&prefix, i as u32);
                    self.blobs.set(&shard_key, shard.clone(), ttl).await?;
                }
                serializer::encode_detached(response, &prefix)
            }
            CacheEntry::VaryByRules(_) => serializer::encode(&entry),
        };
        let replaced = match self.blobs.get(key).await {
            Ok(previous) => previous.and_then(detached_record),
            Err(e) => {
                tracing::debug!(
                    key = %key.escape_debug(),
                    error = %e,
                    "previous record unreadable"
                );
                None
            }
        };
        self.blobs.set(key, record, ttl).await?;

        if let Some(old) = replaced {
            if let Err(e) = self.remove_shards(&old).await {
                tracing::debug!(
                    key = %key.escape_debug(),
                    error = %e,
                    "stale body shards left behind"
                );
            }
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        if let Some(old) = self.blobs.get(key).await?.and_then(detached_record) {
            self.remove_shards(&old).await?;
        }
        self.blobs.remove(key).await
    }

    fn stats(&self) -> Option<CacheStats> {
        self.blobs.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ShardedBody;
    use crate::entry::{CachedResponse, CachedVaryByRules};
    use http::{HeaderMap, HeaderValue, StatusCode};
    use std::time::SystemTime;

    const TTL: Duration = Duration::from_secs(60);

    fn response(body: &'static [u8], shard_size: usize) -> CachedResponse {
        let mut headers = HeaderMap::new();
        headers.insert("etag", HeaderValue::from_static("\"abc\""));
        CachedResponse {
            created: SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000),
            status: StatusCode::OK,
            headers,
            body: ShardedBody::from_bytes(Bytes::from_static(body), shard_size),
        }
    }

    struct FailingBlobs;

    #[async_trait]
    impl BlobStore for FailingBlobs {
        async fn get(&self, _: &str) -> Result<Option<Bytes>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn set(&self, _: &str, _: Bytes, _: Duration) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn remove(&self, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn response_round_trips_through_shards() {
        let store = ShardedResponseStore::new(MemoryBlobStore::new(1024));
        let original = response(b"0123456789", 4);
        store.set("k", original.clone().into(), TTL).await.unwrap();

        assert_eq!(store.get("k").await.unwrap(), Some(CacheEntry::Response(original)));
        // Record plus three shards.
        assert_eq!(store.stats().unwrap().current_size, 4);
    }

    #[tokio::test]
    async fn vary_rules_are_stored_inline() {
        let store = ShardedResponseStore::new(MemoryBlobStore::new(1024));
        let rules = CacheEntry::VaryByRules(CachedVaryByRules::new(["accept-language"], ["*"]));
        store.set("base", rules.clone(), TTL).await.unwrap();
        assert_eq!(store.get("base").await.unwrap(), Some(rules));
        assert_eq!(store.stats().unwrap().current_size, 1);
    }

    #[tokio::test]
    async fn empty_body_has_no_shards() {
        let store = ShardedResponseStore::new(MemoryBlobStore::new(1024));
        let original = response(b"", 4);
        store.set("k", original.clone().into(), TTL).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(CacheEntry::Response(original)));
        assert_eq!(store.stats().unwrap().current_size, 1);
    }

    #[tokio::test]
    async fn missing_shard_is_a_miss() {
        let store = ShardedResponseStore::new(MemoryBlobStore::new(1024));
        store.set("k", response(b"0123456789", 4).into(), TTL).await.unwrap();

        let record = store.blobs().get("k").await.unwrap().unwrap();
        let Some(Decoded::Detached(detached)) = serializer::decode_any(record) else {
            panic!("expected a detached record");
        };
        let last = detached.shard_keys().last().unwrap();
        store.blobs().remove(&last).await.unwrap();

        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn malformed_shard_is_a_miss() {
        let store = ShardedResponseStore::new(MemoryBlobStore::new(1024));
        store.set("k", response(b"0123456789", 4).into(), TTL).await.unwrap();

        let record = store.blobs().get("k").await.unwrap().unwrap();
        let Some(Decoded::Detached(detached)) = serializer::decode_any(record) else {
            panic!("expected a detached record");
        };
        let first = detached.shard_keys().next().unwrap();
        store.blobs().set(&first, Bytes::from_static(b"xy"), TTL).await.unwrap();

        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn garbage_record_is_a_miss() {
        let store = ShardedResponseStore::new(MemoryBlobStore::new(1024));
        store.blobs().set("k", Bytes::from_static(b"not an entry"), TTL).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn remove_drops_record_and_shards() {
        let store = ShardedResponseStore::new(MemoryBlobStore::new(1024));
        store.set("k", response(b"0123456789", 4).into(), TTL).await.unwrap();
        store.remove("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.stats().unwrap().current_size, 0);
    }

    #[tokio::test]
    async fn overwrite_drops_the_previous_shards() {
        let store = ShardedResponseStore::new(MemoryBlobStore::new(1024));
        store.set("k", response(b"0123456789", 4).into(), TTL).await.unwrap();
        let replacement = response(b"abcdef", 4);
        store.set("k", replacement.clone().into(), TTL).await.unwrap();

        assert_eq!(store.get("k").await.unwrap(), Some(CacheEntry::Response(replacement)));
        // Record plus the two shards of the replacement.
        assert_eq!(store.stats().unwrap().current_size, 3);

        let rules = CacheEntry::VaryByRules(CachedVaryByRules::new(["accept"], ["*"]));
        store.set("k", rules, TTL).await.unwrap();
        assert_eq!(store.stats().unwrap().current_size, 1);
    }

    #[tokio::test]
    async fn backend_failures_surface_as_errors() {
        let store = ShardedResponseStore::new(FailingBlobs);
        assert!(store.get("k").await.is_err());
        assert!(store.set("k", response(b"x", 4).into(), TTL).await.is_err());
        assert!(store.remove("k").await.is_err());
        assert!(store.stats().is_none());
    }
}
