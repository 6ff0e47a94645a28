//! HTTP response caching core.
//!
//! The pieces, leaves first:
//!
//! - [`buffer`]: write-once sharded byte buffer used to capture and replay bodies
//! - [`entry`]: the two values stored under cache keys
//! - [`serializer`]: versioned binary encoding of those values
//! - [`keys`]: base keys and vary keys
//! - [`cache_control`], [`policy`], [`conditional`]: request/response cacheability,
//!   freshness and `304 Not Modified` evaluation
//! - [`store`], [`memory`], [`distributed`]: the storage seam and its adapters
//! - [`middleware`]: the per-request state machine tying it all together

pub mod buffer;
pub mod cache_control;
pub mod conditional;
pub mod distributed;
pub mod entry;
pub mod error;
pub mod keys;
pub mod memory;
pub mod middleware;
pub mod options;
pub mod policy;
pub mod serializer;
pub mod store;

mod arena;
mod sharded;
mod sieve;

pub use buffer::{ShardReader, ShardWriter, ShardedBody};
pub use entry::{CacheEntry, CachedResponse, CachedVaryByRules};
pub use error::{CacheError, StoreError};
pub use keys::KeyProvider;
pub use middleware::{
    CacheLookup, CaptureTransaction, CommitOutcome, ResponseCaching, ResponseCachingFeature,
    ServedResponse,
};
pub use options::CacheOptions;
pub use policy::{CachePolicy, OverrideDecision};
pub use sharded::CacheStats;
pub use store::ResponseCacheStore;
