use crate::cache_layer::CacheState;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use metrics::{counter, describe_counter, Unit};
use response_cache::{CacheError, CacheLookup, CommitOutcome};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use tracing_subscriber::EnvFilter;

static METRIC_DESCRIPTIONS: Once = Once::new();

const HITS: &str = "response_cache_hits_total";
const MISSES: &str = "response_cache_misses_total";
const BYPASS: &str = "response_cache_bypass_total";
const NOT_MODIFIED: &str = "response_cache_not_modified_total";
const GATEWAY_TIMEOUTS: &str = "response_cache_gateway_timeouts_total";
const COMMITS: &str = "response_cache_commits_total";

/// JSON logs, `info` unless `RUST_LOG` says otherwise.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();
    describe_metrics();
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(HITS, Unit::Count, "Requests served from the cache.");
        describe_counter!(MISSES, Unit::Count, "Cacheable requests forwarded upstream.");
        describe_counter!(BYPASS, Unit::Count, "Requests that were not eligible for caching.");
        describe_counter!(
            NOT_MODIFIED,
            Unit::Count,
            "Conditional requests answered with 304 from the cache."
        );
        describe_counter!(
            GATEWAY_TIMEOUTS,
            Unit::Count,
            "only-if-cached requests with nothing servable."
        );
        describe_counter!(
            COMMITS,
            Unit::Count,
            "Captured responses, labelled by how the commit ended."
        );
    });
}

/// Request counters, kept both locally for `/api/stats` and in the global recorder.
#[derive(Debug, Default)]
pub struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    bypass: AtomicU64,
    not_modified: AtomicU64,
    gateway_timeouts: AtomicU64,
    committed: AtomicU64,
    not_committed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub bypass: u64,
    pub not_modified: u64,
    pub gateway_timeouts: u64,
    pub committed: u64,
    pub not_committed: u64,
}

impl CacheCounters {
    pub fn record_lookup<S: ?Sized>(&self, lookup: &CacheLookup<S>) {
        let (local, name) = match lookup {
            CacheLookup::Bypass => (&self.bypass, BYPASS),
            CacheLookup::Hit(_) => (&self.hits, HITS),
            CacheLookup::NotModified(_) => (&self.not_modified, NOT_MODIFIED),
            CacheLookup::GatewayTimeout => (&self.gateway_timeouts, GATEWAY_TIMEOUTS),
            CacheLookup::Miss(_) => (&self.misses, MISSES),
        };
        local.fetch_add(1, Ordering::Relaxed);
        counter!(name).increment(1);
    }

    pub fn record_commit(&self, result: &Result<CommitOutcome, CacheError>) {
        let outcome = match result {
            Ok(CommitOutcome::Committed) => "committed",
            Ok(CommitOutcome::NotCacheable) => "not_cacheable",
            Ok(CommitOutcome::BufferingDisabled) => "buffering_disabled",
            Ok(CommitOutcome::ContentLengthMismatch) => "content_length_mismatch",
            Ok(CommitOutcome::StoreFailed) => "store_failed",
            Err(err) => {
                tracing::error!(error = %err, "response capture failed");
                "error"
            }
        };
        if matches!(result, Ok(CommitOutcome::Committed)) {
            self.committed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.not_committed.fetch_add(1, Ordering::Relaxed);
        }
        counter!(COMMITS, "outcome" => outcome).increment(1);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            bypass: self.bypass.load(Ordering::Relaxed),
            not_modified: self.not_modified.load(Ordering::Relaxed),
            gateway_timeouts: self.gateway_timeouts.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            not_committed: self.not_committed.load(Ordering::Relaxed),
        }
    }
}

/// GET /api/stats
pub async fn stats_handler(State(cache): State<Arc<CacheState>>) -> impl IntoResponse {
    let caching = cache.caching.load();
    let counters = cache.counters.snapshot();
    let served = counters.hits + counters.not_modified;
    let lookups = served + counters.misses + counters.gateway_timeouts;
    let hit_rate = if lookups > 0 {
        served as f64 / lookups as f64
    } else {
        0.0
    };

    Json(serde_json::json!({
        "counters": counters,
        "hit_rate": hit_rate,
        "store": caching.store().stats(),
        "options": {
            "default_ttl_seconds": caching.options().default_ttl.as_secs(),
            "maximum_body_size": caching.options().maximum_body_size,
            "shard_size": caching.options().shard_size,
            "case_sensitive_paths": caching.options().case_sensitive_paths,
        },
    }))
}
