//! Per-request caching state machine.
//!
//! The host drives it in two phases:
//!
//! 1. [`ResponseCaching::lookup`] before running the downstream handler. The result says
//!    whether to serve from cache, short-circuit with `304`/`504`, bypass caching
//!    entirely, or run the handler while capturing through a [`CaptureTransaction`].
//! 2. On a miss, [`CaptureTransaction::on_headers_ready`] once before the first body byte
//!    is sent, [`CaptureTransaction::write`] for every body chunk, and
//!    [`CaptureTransaction::on_body_complete`] once the body has ended.
//!
//! Storage failures never reach the host: they are logged and treated as a miss or a
//! skipped write.

use crate::buffer::{ShardWriter, ShardedBody};
use crate::cache_control::{header_list, valid_http_date, CacheControl};
use crate::conditional::content_is_not_modified;
use crate::entry::{normalize_names, CacheEntry, CachedResponse, CachedVaryByRules};
use crate::error::CacheError;
use crate::keys::KeyProvider;
use crate::options::CacheOptions;
use crate::policy::{is_fresh, CachePolicy};
use crate::store::ResponseCacheStore;
use http::header::{
    HeaderName, HeaderValue, AGE, CACHE_CONTROL, CONNECTION, CONTENT_LENGTH, CONTENT_LOCATION,
    DATE, ETAG, EXPIRES, TRANSFER_ENCODING, VARY,
};
use http::{HeaderMap, Method, Request, StatusCode};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Source of the current time.
pub type Clock = Arc<dyn Fn() -> SystemTime + Send + Sync>;

/// Never stored; regenerated when serving or meaningless to replay.
const UNSTORED_HEADERS: [HeaderName; 5] =
    [DATE, AGE, CONTENT_LENGTH, TRANSFER_ENCODING, CONNECTION];

/// Headers a `304` carries over from the stored response.
const NOT_MODIFIED_HEADERS: [HeaderName; 5] =
    [CACHE_CONTROL, CONTENT_LOCATION, ETAG, EXPIRES, VARY];

/// Handle placed in the request extensions of every request that passes through
/// [`ResponseCaching::lookup`]. Downstream code uses it to opt a response out of caching
/// or to declare that the response varies by query parameters.
#[derive(Clone, Default)]
pub struct ResponseCachingFeature {
    inner: Arc<Mutex<FeatureState>>,
}

#[derive(Default)]
struct FeatureState {
    disabled: bool,
    vary_by_query_keys: Vec<String>,
}

impl ResponseCachingFeature {
    /// Don't store this response.
    pub fn disable(&self) {
        self.inner.lock().disabled = true;
    }

    pub fn is_disabled(&self) -> bool {
        self.inner.lock().disabled
    }

    /// Query parameters the response varies by. [`crate::entry::ALL_QUERY_KEYS`] means
    /// every parameter present on the request.
    pub fn set_vary_by_query_keys<I>(&self, keys: I)
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.inner.lock().vary_by_query_keys = keys.into_iter().map(Into::into).collect();
    }

    pub fn vary_by_query_keys(&self) -> Vec<String> {
        self.inner.lock().vary_by_query_keys.clone()
    }
}

impl fmt::Debug for ResponseCachingFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("ResponseCachingFeature")
            .field("disabled", &state.disabled)
            .field("vary_by_query_keys", &state.vary_by_query_keys)
            .finish()
    }
}

/// A stored response ready to go out, or the headers of a `304`.
#[derive(Debug, Clone)]
pub struct ServedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ShardedBody,
    pub age: Duration,
}

/// What the host should do with a request.
pub enum CacheLookup<S: ?Sized> {
    /// Not cacheable; run the handler as if there were no cache.
    Bypass,
    /// Serve the stored response without running the handler.
    Hit(ServedResponse),
    /// The client's validators match the stored response; reply `304` with these headers.
    NotModified(ServedResponse),
    /// `only-if-cached` and nothing servable: reply `504` without running the handler.
    GatewayTimeout,
    /// Run the handler and feed its response through the transaction.
    Miss(CaptureTransaction<S>),
}

impl<S: ?Sized> CacheLookup<S> {
    pub fn label(&self) -> &'static str {
        match self {
            CacheLookup::Bypass => "bypass",
            CacheLookup::Hit(_) => "hit",
            CacheLookup::NotModified(_) => "not-modified",
            CacheLookup::GatewayTimeout => "gateway-timeout",
            CacheLookup::Miss(_) => "miss",
        }
    }
}

impl<S: ?Sized> fmt::Debug for CacheLookup<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How a captured response ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    NotCacheable,
    /// The body outgrew the buffering limit.
    BufferingDisabled,
    /// The body length disagreed with the declared `Content-Length`.
    ContentLengthMismatch,
    /// Everything checked out but the store rejected the write.
    StoreFailed,
}

/// The orchestrator. Cheap to clone; clones share the store.
pub struct ResponseCaching<S: ?Sized> {
    store: Arc<S>,
    options: CacheOptions,
    keys: KeyProvider,
    policy: CachePolicy,
    clock: Clock,
}

impl<S: ?Sized> Clone for ResponseCaching<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            options: self.options.clone(),
            keys: self.keys.clone(),
            policy: self.policy.clone(),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<S: ResponseCacheStore + ?Sized> ResponseCaching<S> {
    pub fn new(store: Arc<S>, options: CacheOptions) -> Self {
        assert!(options.shard_size > 0, "shard size must be > 0");
        Self {
            store,
            keys: KeyProvider::new(options.case_sensitive_paths),
            options,
            policy: CachePolicy::default(),
            clock: Arc::new(SystemTime::now),
        }
    }

    pub fn with_policy(mut self, policy: CachePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> SystemTime + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Decide how to handle `req`. Always leaves a [`ResponseCachingFeature`] in its
    /// extensions.
    pub async fn lookup<B>(&self, req: &mut Request<B>) -> CacheLookup<S> {
        let feature = ResponseCachingFeature::default();
        req.extensions_mut().insert(feature.clone());

        if !self.policy.request_is_cacheable(req.method(), req.headers()) {
            tracing::debug!(
                method = %req.method(),
                path = req.uri().path(),
                "request not cacheable"
            );
            return CacheLookup::Bypass;
        }

        let base_key = self.keys.base_key(&*req);
        let mut vary_rules = None;
        let mut cached = None;

        match self.fetch(&base_key).await {
            Some(CacheEntry::Response(response)) => cached = Some(response),
            Some(CacheEntry::VaryByRules(rules)) => {
                let candidates = self.keys.lookup_vary_keys(&*req, &rules);
                match candidates {
                    Ok(candidates) => {
                        for key in candidates {
                            if let Some(CacheEntry::Response(response)) = self.fetch(&key).await {
                                cached = Some(response);
                                break;
                            }
                        }
                    }
                    Err(err) => tracing::error!(error = %err, "vary key lookup failed"),
                }
                vary_rules = Some(rules);
            }
            None => {}
        }

        if let Some(response) = cached {
            let now = (self.clock)();
            let age = now.duration_since(response.created).unwrap_or(Duration::ZERO);
            if is_fresh(&response.headers, age, now, Some(req.headers())) {
                if content_is_not_modified(&response.headers, response.created, req.headers()) {
                    tracing::debug!(key = %printable(&base_key), "serving 304 from cache");
                    return CacheLookup::NotModified(not_modified(&response, age));
                }
                tracing::debug!(
                    key = %printable(&base_key),
                    age_secs = age.as_secs(),
                    "serving from cache"
                );
                return CacheLookup::Hit(served(response, age));
            }
            tracing::debug!(
                key = %printable(&base_key),
                age_secs = age.as_secs(),
                "cached response is stale"
            );
        }

        if CacheControl::from_headers(req.headers()).only_if_cached {
            tracing::debug!(key = %printable(&base_key), "only-if-cached with nothing servable");
            return CacheLookup::GatewayTimeout;
        }

        let mut request = Request::new(());
        *request.method_mut() = req.method().clone();
        *request.uri_mut() = req.uri().clone();
        *request.headers_mut() = req.headers().clone();

        CacheLookup::Miss(CaptureTransaction {
            caching: self.clone(),
            feature,
            request,
            base_key,
            vary_rules,
            headers_ready: false,
            plan: None,
            writer: Some(ShardWriter::new(self.options.shard_size)),
        })
    }

    async fn fetch(&self, key: &str) -> Option<CacheEntry> {
        match self.store.get(key).await {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(key = %printable(key), error = %err, "cache store get failed");
                None
            }
        }
    }
}

fn served(response: CachedResponse, age: Duration) -> ServedResponse {
    let mut headers = response.headers;
    insert_date(&mut headers, response.created);
    headers.insert(AGE, HeaderValue::from(age.as_secs()));
    if !headers.contains_key(CONTENT_LENGTH) {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(response.body.len()));
    }
    ServedResponse {
        status: response.status,
        headers,
        body: response.body,
        age,
    }
}

fn not_modified(response: &CachedResponse, age: Duration) -> ServedResponse {
    let mut headers = HeaderMap::new();
    for name in NOT_MODIFIED_HEADERS {
        for value in response.headers.get_all(&name) {
            headers.append(name.clone(), value.clone());
        }
    }
    insert_date(&mut headers, response.created);
    ServedResponse {
        status: StatusCode::NOT_MODIFIED,
        headers,
        body: ShardedBody::empty(response.body.shard_size()),
        age,
    }
}

fn insert_date(headers: &mut HeaderMap, at: SystemTime) {
    if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(at)) {
        headers.insert(DATE, value);
    }
}

/// Keys contain the unit separator; show it as `␟` in logs.
fn printable(key: &str) -> String {
    key.replace('\x1f', "\u{241f}")
}

/// What gets written at commit, settled when the headers were finalized.
struct CommitPlan {
    storage_key: String,
    ttl: Duration,
    status: StatusCode,
    headers: HeaderMap,
    created: SystemTime,
    content_length: Option<u64>,
}

/// Capture state for one response that missed the cache.
pub struct CaptureTransaction<S: ?Sized> {
    caching: ResponseCaching<S>,
    feature: ResponseCachingFeature,
    request: Request<()>,
    base_key: String,
    vary_rules: Option<CachedVaryByRules>,
    headers_ready: bool,
    plan: Option<CommitPlan>,
    writer: Option<ShardWriter>,
}

impl<S: ResponseCacheStore + ?Sized> CaptureTransaction<S> {
    pub fn feature(&self) -> &ResponseCachingFeature {
        &self.feature
    }

    pub fn base_key(&self) -> &str {
        &self.base_key
    }

    /// Whether the response is still on course to be stored.
    pub fn is_capturing(&self) -> bool {
        self.writer.is_some() && (!self.headers_ready || self.plan.is_some())
    }

    /// Call once, before the first body byte goes out. Decides cacheability, may add a
    /// `Date` header to the live response and writes or refreshes the vary rules.
    pub async fn on_headers_ready(&mut self, status: StatusCode, headers: &mut HeaderMap) {
        if self.headers_ready {
            return;
        }
        self.headers_ready = true;

        let caching = &self.caching;
        let response_time = (caching.clock)();

        if self.feature.is_disabled() {
            tracing::debug!(key = %printable(&self.base_key), "caching disabled by handler");
            self.writer = None;
            return;
        }
        if !caching
            .policy
            .response_is_cacheable(self.request.headers(), status, headers, response_time)
        {
            tracing::debug!(
                key = %printable(&self.base_key),
                status = status.as_u16(),
                "response not cacheable"
            );
            self.writer = None;
            return;
        }

        if !headers.contains_key(DATE) {
            insert_date(headers, response_time);
        }

        let cc = CacheControl::from_headers(headers);
        let ttl = cc
            .s_maxage
            .or(cc.max_age)
            .or_else(|| {
                valid_http_date(headers, &EXPIRES)
                    .and_then(|expires| expires.duration_since(response_time).ok())
            })
            .unwrap_or(caching.options.default_ttl);

        let vary_headers = normalize_names(header_list(headers, &VARY));
        let vary_query_keys = normalize_names(self.feature.vary_by_query_keys());

        let storage_key = if vary_headers.is_empty() && vary_query_keys.is_empty() {
            self.base_key.clone()
        } else {
            let rules = match self.vary_rules.take() {
                Some(rules) if rules.same_rules(&vary_headers, &vary_query_keys) => rules,
                _ => {
                    tracing::debug!(key = %printable(&self.base_key), "vary rules changed");
                    CachedVaryByRules::new(vary_headers, vary_query_keys)
                }
            };
            if let Err(err) = caching
                .store
                .set(&self.base_key, CacheEntry::VaryByRules(rules.clone()), ttl)
                .await
            {
                tracing::warn!(
                    key = %printable(&self.base_key),
                    error = %err,
                    "cache store set failed for vary rules"
                );
            }
            let key = caching.keys.vary_key(&self.request, Some(&rules));
            self.vary_rules = Some(rules);
            match key {
                Ok(key) => key,
                Err(err) => {
                    tracing::error!(error = %err, "vary key derivation failed");
                    self.writer = None;
                    return;
                }
            }
        };

        let date = valid_http_date(headers, &DATE).unwrap_or(response_time);
        let upstream_age = headers
            .get(AGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::ZERO);
        let created = date.checked_sub(upstream_age).unwrap_or(date);

        let mut snapshot = headers.clone();
        for name in &UNSTORED_HEADERS {
            snapshot.remove(name);
        }

        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        if content_length.is_some_and(|n| n > caching.options.maximum_body_size) {
            tracing::debug!(
                key = %printable(&storage_key),
                "declared body exceeds buffering limit"
            );
            self.writer = None;
        }

        self.plan = Some(CommitPlan {
            storage_key,
            ttl,
            status,
            headers: snapshot,
            created,
            content_length,
        });
    }

    /// Buffer a chunk of the outgoing body. Past the size limit the buffer is dropped and
    /// nothing will be stored; the live response is unaffected.
    pub fn write(&mut self, chunk: &[u8]) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        if writer.len() + chunk.len() as u64 > self.caching.options.maximum_body_size {
            tracing::debug!(
                key = %printable(&self.base_key),
                limit = self.caching.options.maximum_body_size,
                "body exceeds buffering limit"
            );
            self.writer = None;
            return;
        }
        writer.write(chunk);
    }

    /// Commit the captured response, if it still qualifies.
    pub async fn on_body_complete(self) -> Result<CommitOutcome, CacheError> {
        if !self.headers_ready {
            return Err(CacheError::HeadersNotFinalized);
        }
        let Some(plan) = self.plan else {
            return Ok(CommitOutcome::NotCacheable);
        };
        let Some(writer) = self.writer else {
            return Ok(CommitOutcome::BufferingDisabled);
        };

        let body = writer.finish();
        let mut headers = plan.headers;
        if let Some(declared) = plan.content_length {
            let head_without_body = body.is_empty() && self.request.method() == Method::HEAD;
            if head_without_body {
                headers.insert(CONTENT_LENGTH, HeaderValue::from(declared));
            } else if declared != body.len() {
                tracing::warn!(
                    key = %printable(&plan.storage_key),
                    declared,
                    buffered = body.len(),
                    "content-length mismatch, response not cached"
                );
                return Ok(CommitOutcome::ContentLengthMismatch);
            }
        }

        let entry = CachedResponse {
            created: plan.created,
            status: plan.status,
            headers,
            body,
        };
        let len = entry.body.len();
        match self
            .caching
            .store
            .set(&plan.storage_key, CacheEntry::Response(entry), plan.ttl)
            .await
        {
            Ok(()) => {
                tracing::debug!(
                    key = %printable(&plan.storage_key),
                    ttl_secs = plan.ttl.as_secs(),
                    bytes = len,
                    "response cached"
                );
                Ok(CommitOutcome::Committed)
            }
            Err(err) => {
                tracing::warn!(
                    key = %printable(&plan.storage_key),
                    error = %err,
                    "cache store set failed"
                );
                Ok(CommitOutcome::StoreFailed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::ALL_QUERY_KEYS;
    use crate::error::StoreError;
    use crate::memory::MemoryResponseStore;
    use async_trait::async_trait;
    use bytes::Bytes;

    const START: u64 = 1_700_000_000;

    struct TestClock(Arc<Mutex<SystemTime>>);

    impl TestClock {
        fn new() -> Self {
            Self(Arc::new(Mutex::new(SystemTime::UNIX_EPOCH + Duration::from_secs(START))))
        }

        fn advance(&self, secs: u64) {
            *self.0.lock() += Duration::from_secs(secs);
        }

        fn now(&self) -> SystemTime {
            *self.0.lock()
        }
    }

    fn caching(clock: &TestClock, options: CacheOptions) -> ResponseCaching<MemoryResponseStore> {
        let time = Arc::clone(&clock.0);
        ResponseCaching::new(Arc::new(MemoryResponseStore::new(1024)), options)
            .with_clock(move || *time.lock())
    }

    fn get(uri: &str, headers: &[(&'static str, &str)]) -> Request<()> {
        let mut req = Request::get(uri).body(()).unwrap();
        for (name, value) in headers {
            req.headers_mut()
                .append(*name, HeaderValue::from_str(value).unwrap());
        }
        req
    }

    fn response_headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (name, value) in pairs {
            h.append(*name, HeaderValue::from_str(value).unwrap());
        }
        h
    }

    /// Run the capture half of a miss with a single-chunk body.
    async fn respond<S: ResponseCacheStore + ?Sized>(
        lookup: CacheLookup<S>,
        headers: &[(&'static str, &str)],
        body: &[u8],
    ) -> CommitOutcome {
        let mut tx = match lookup {
            CacheLookup::Miss(tx) => tx,
            other => panic!("expected a miss, got {other:?}"),
        };
        let mut headers = response_headers(headers);
        tx.on_headers_ready(StatusCode::OK, &mut headers).await;
        tx.write(body);
        tx.on_body_complete().await.unwrap()
    }

    fn body_of(served: &ServedResponse) -> Bytes {
        served.body.to_bytes()
    }

    const CACHEABLE: (&str, &str) = ("cache-control", "public, max-age=10");

    #[tokio::test]
    async fn miss_commit_then_hit_with_age() {
        let clock = TestClock::new();
        let cache = caching(&clock, CacheOptions::default());

        let lookup = cache.lookup(&mut get("/x", &[])).await;
        let outcome = respond(lookup, &[CACHEABLE], b"hello").await;
        assert_eq!(outcome, CommitOutcome::Committed);

        let stored = cache.store().get("GET\x1f/X").await.unwrap();
        assert!(matches!(stored, Some(CacheEntry::Response(_))));

        clock.advance(3);
        let CacheLookup::Hit(served) = cache.lookup(&mut get("/x", &[])).await else {
            panic!("expected a hit");
        };
        assert_eq!(served.status, StatusCode::OK);
        assert_eq!(body_of(&served), Bytes::from_static(b"hello"));
        assert_eq!(served.headers[AGE], "3");
        assert_eq!(served.headers[CONTENT_LENGTH], "5");
        assert_eq!(
            served.headers[DATE],
            httpdate::fmt_http_date(SystemTime::UNIX_EPOCH + Duration::from_secs(START)).as_str()
        );
    }

    #[tokio::test]
    async fn stale_entries_are_misses_unless_max_stale_allows() {
        let clock = TestClock::new();
        let cache = caching(&clock, CacheOptions::default());
        respond(cache.lookup(&mut get("/x", &[])).await, &[CACHEABLE], b"hello").await;

        clock.advance(10);
        assert!(matches!(cache.lookup(&mut get("/x", &[])).await, CacheLookup::Hit(_)));
        clock.advance(1);
        assert!(matches!(cache.lookup(&mut get("/x", &[])).await, CacheLookup::Miss(_)));
        assert!(matches!(
            cache.lookup(&mut get("/x", &[("cache-control", "max-stale=5")])).await,
            CacheLookup::Hit(_)
        ));
    }

    #[tokio::test]
    async fn uncacheable_requests_bypass_but_get_the_feature() {
        let clock = TestClock::new();
        let cache = caching(&clock, CacheOptions::default());
        let mut req = get("/x", &[("authorization", "Bearer t")]);
        assert!(matches!(cache.lookup(&mut req).await, CacheLookup::Bypass));
        assert!(req.extensions().get::<ResponseCachingFeature>().is_some());

        let mut post = Request::post("/x").body(()).unwrap();
        assert!(matches!(cache.lookup(&mut post).await, CacheLookup::Bypass));
    }

    #[tokio::test]
    async fn only_if_cached_without_entry_is_gateway_timeout() {
        let clock = TestClock::new();
        let cache = caching(&clock, CacheOptions::default());
        let mut req = get("/x", &[("cache-control", "only-if-cached")]);
        assert!(matches!(cache.lookup(&mut req).await, CacheLookup::GatewayTimeout));
    }

    #[tokio::test]
    async fn vary_partitions_by_header() {
        let clock = TestClock::new();
        let cache = caching(&clock, CacheOptions::default());
        let en = [("accept-language", "en")];
        let fr = [("accept-language", "fr")];
        let vary = [CACHEABLE, ("vary", "Accept-Language")];

        respond(cache.lookup(&mut get("/x", &en)).await, &vary, b"hello").await;
        assert!(matches!(
            cache.store().get("GET\x1f/X").await.unwrap(),
            Some(CacheEntry::VaryByRules(_))
        ));
        respond(cache.lookup(&mut get("/x", &fr)).await, &vary, b"bonjour").await;

        let CacheLookup::Hit(a) = cache.lookup(&mut get("/x", &en)).await else {
            panic!("expected en hit");
        };
        let CacheLookup::Hit(b) = cache.lookup(&mut get("/x", &fr)).await else {
            panic!("expected fr hit");
        };
        assert_eq!(body_of(&a), Bytes::from_static(b"hello"));
        assert_eq!(body_of(&b), Bytes::from_static(b"bonjour"));
        assert!(matches!(
            cache.lookup(&mut get("/x", &[("accept-language", "de")])).await,
            CacheLookup::Miss(_)
        ));
    }

    #[tokio::test]
    async fn equivalent_vary_keeps_rule_prefix() {
        let clock = TestClock::new();
        let cache = caching(&clock, CacheOptions::default());
        let rules = |entry: Option<CacheEntry>| match entry {
            Some(CacheEntry::VaryByRules(r)) => r,
            other => panic!("expected vary rules, got {other:?}"),
        };

        let req = [("accept", "a")];
        let lookup = cache.lookup(&mut get("/x", &req)).await;
        respond(lookup, &[CACHEABLE, ("vary", "Accept, X-B")], b"1").await;
        let first = rules(cache.store().get("GET\x1f/X").await.unwrap());

        let other = [("accept", "b")];
        let lookup = cache.lookup(&mut get("/x", &other)).await;
        respond(lookup, &[CACHEABLE, ("vary", "x-b, ACCEPT")], b"2").await;
        let second = rules(cache.store().get("GET\x1f/X").await.unwrap());
        assert_eq!(first, second);

        let third_req = [("accept", "c")];
        let lookup = cache.lookup(&mut get("/x", &third_req)).await;
        respond(lookup, &[CACHEABLE, ("vary", "Accept")], b"3").await;
        let third = rules(cache.store().get("GET\x1f/X").await.unwrap());
        assert_ne!(first.key_prefix, third.key_prefix);
        assert_eq!(third.headers, vec!["ACCEPT"]);
    }

    #[tokio::test]
    async fn query_variance_declared_through_feature() {
        let clock = TestClock::new();
        let cache = caching(&clock, CacheOptions::default());

        for (uri, body) in [("/x?page=1", b"one"), ("/x?page=2", b"two")] {
            let mut req = get(uri, &[]);
            let lookup = cache.lookup(&mut req).await;
            req.extensions()
                .get::<ResponseCachingFeature>()
                .unwrap()
                .set_vary_by_query_keys([ALL_QUERY_KEYS]);
            respond(lookup, &[CACHEABLE], body).await;
        }

        let CacheLookup::Hit(one) = cache.lookup(&mut get("/x?PAGE=1", &[])).await else {
            panic!("expected hit");
        };
        assert_eq!(body_of(&one), Bytes::from_static(b"one"));
        let CacheLookup::Hit(two) = cache.lookup(&mut get("/x?page=2", &[])).await else {
            panic!("expected hit");
        };
        assert_eq!(body_of(&two), Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn etag_match_serves_not_modified() {
        let clock = TestClock::new();
        let cache = caching(&clock, CacheOptions::default());
        respond(
            cache.lookup(&mut get("/x", &[])).await,
            &[CACHEABLE, ("etag", "\"abc\""), ("x-other", "1"), ("vary", "accept")],
            b"hello",
        )
        .await;

        let lookup = cache.lookup(&mut get("/x", &[("if-none-match", "\"abc\"")])).await;
        let served = match lookup {
            CacheLookup::NotModified(served) => served,
            other => panic!("expected 304, got {other:?}"),
        };
        assert_eq!(served.status, StatusCode::NOT_MODIFIED);
        assert!(served.body.is_empty());
        assert_eq!(served.headers[ETAG], "\"abc\"");
        assert_eq!(served.headers[CACHE_CONTROL], "public, max-age=10");
        assert!(served.headers.contains_key(DATE));
        assert!(!served.headers.contains_key("x-other"));

        let lookup = cache.lookup(&mut get("/x", &[("if-none-match", "\"xyz\"")])).await;
        let served = match lookup {
            CacheLookup::Hit(served) => served,
            other => panic!("expected 200, got {other:?}"),
        };
        assert_eq!(body_of(&served), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn date_is_added_and_created_accounts_for_upstream_age() {
        let clock = TestClock::new();
        let cache = caching(&clock, CacheOptions::default());

        let CacheLookup::Miss(mut tx) = cache.lookup(&mut get("/x", &[])).await else {
            panic!("expected miss");
        };
        let mut headers =
            response_headers(&[("cache-control", "public, max-age=100"), ("age", "4")]);
        tx.on_headers_ready(StatusCode::OK, &mut headers).await;
        assert_eq!(headers[DATE], httpdate::fmt_http_date(clock.now()).as_str());
        tx.write(b"x");
        assert_eq!(tx.on_body_complete().await, Ok(CommitOutcome::Committed));

        let stored = cache.store().get("GET\x1f/X").await.unwrap();
        let Some(CacheEntry::Response(stored)) = stored else {
            panic!("expected a stored response");
        };
        assert_eq!(stored.created, clock.now() - Duration::from_secs(4));
        assert!(!stored.headers.contains_key(DATE));
        assert!(!stored.headers.contains_key(AGE));

        let CacheLookup::Hit(served) = cache.lookup(&mut get("/x", &[])).await else {
            panic!("expected hit");
        };
        assert_eq!(served.headers[AGE], "4");
    }

    #[tokio::test]
    async fn oversized_bodies_are_not_buffered() {
        let clock = TestClock::new();
        let options = CacheOptions {
            maximum_body_size: 8,
            shard_size: 4,
            ..CacheOptions::default()
        };
        let cache = caching(&clock, options);

        let CacheLookup::Miss(mut tx) = cache.lookup(&mut get("/x", &[])).await else {
            panic!("expected miss");
        };
        let mut headers = response_headers(&[CACHEABLE]);
        tx.on_headers_ready(StatusCode::OK, &mut headers).await;
        tx.write(b"12345678");
        assert!(tx.is_capturing());
        tx.write(b"9");
        assert!(!tx.is_capturing());
        assert_eq!(tx.on_body_complete().await, Ok(CommitOutcome::BufferingDisabled));

        let outcome = respond(
            cache.lookup(&mut get("/y", &[])).await,
            &[CACHEABLE, ("content-length", "100")],
            b"",
        )
        .await;
        assert_eq!(outcome, CommitOutcome::BufferingDisabled);
    }

    #[tokio::test]
    async fn content_length_mismatch_is_not_cached() {
        let clock = TestClock::new();
        let cache = caching(&clock, CacheOptions::default());
        let outcome = respond(
            cache.lookup(&mut get("/x", &[])).await,
            &[CACHEABLE, ("content-length", "9")],
            b"hello",
        )
        .await;
        assert_eq!(outcome, CommitOutcome::ContentLengthMismatch);
        assert!(matches!(cache.lookup(&mut get("/x", &[])).await, CacheLookup::Miss(_)));

        let outcome = respond(
            cache.lookup(&mut get("/x", &[])).await,
            &[CACHEABLE, ("content-length", "5")],
            b"hello",
        )
        .await;
        assert_eq!(outcome, CommitOutcome::Committed);
    }

    #[tokio::test]
    async fn head_responses_keep_declared_length() {
        let clock = TestClock::new();
        let cache = caching(&clock, CacheOptions::default());
        let mut head = Request::head("/x").body(()).unwrap();
        let lookup = cache.lookup(&mut head).await;
        let outcome = respond(lookup, &[CACHEABLE, ("content-length", "42")], b"").await;
        assert_eq!(outcome, CommitOutcome::Committed);

        let mut head = Request::head("/x").body(()).unwrap();
        let CacheLookup::Hit(served) = cache.lookup(&mut head).await else {
            panic!("expected hit");
        };
        assert_eq!(served.headers[CONTENT_LENGTH], "42");
    }

    #[tokio::test]
    async fn handler_can_disable_caching() {
        let clock = TestClock::new();
        let cache = caching(&clock, CacheOptions::default());
        let mut req = get("/x", &[]);
        let lookup = cache.lookup(&mut req).await;
        req.extensions().get::<ResponseCachingFeature>().unwrap().disable();
        assert_eq!(respond(lookup, &[CACHEABLE], b"hello").await, CommitOutcome::NotCacheable);
    }

    #[tokio::test]
    async fn uncacheable_response_is_not_stored() {
        let clock = TestClock::new();
        let cache = caching(&clock, CacheOptions::default());
        let outcome = respond(
            cache.lookup(&mut get("/x", &[])).await,
            &[("cache-control", "private, max-age=10")],
            b"hello",
        )
        .await;
        assert_eq!(outcome, CommitOutcome::NotCacheable);
        assert_eq!(cache.store().get("GET\x1f/X").await.unwrap(), None);
    }

    #[tokio::test]
    async fn body_complete_before_headers_is_a_contract_violation() {
        let clock = TestClock::new();
        let cache = caching(&clock, CacheOptions::default());
        let CacheLookup::Miss(tx) = cache.lookup(&mut get("/x", &[])).await else {
            panic!("expected miss");
        };
        assert_eq!(tx.on_body_complete().await, Err(CacheError::HeadersNotFinalized));
    }

    #[tokio::test]
    async fn default_ttl_applies_without_freshness_info() {
        let clock = TestClock::new();
        let options = CacheOptions {
            default_ttl: Duration::from_secs(1),
            ..CacheOptions::default()
        };
        let cache = caching(&clock, options);
        let lookup = cache.lookup(&mut get("/x", &[])).await;
        let outcome = respond(lookup, &[("cache-control", "public")], b"x").await;
        assert_eq!(outcome, CommitOutcome::Committed);
        assert!(matches!(cache.lookup(&mut get("/x", &[])).await, CacheLookup::Hit(_)));
    }

    struct FailingStore;

    #[async_trait]
    impl ResponseCacheStore for FailingStore {
        async fn get(&self, _: &str) -> Result<Option<CacheEntry>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn set(&self, _: &str, _: CacheEntry, _: Duration) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn remove(&self, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn store_failures_degrade_to_uncached() {
        let cache = ResponseCaching::new(Arc::new(FailingStore), CacheOptions::default());
        let lookup = cache.lookup(&mut get("/x", &[])).await;
        assert_eq!(respond(lookup, &[CACHEABLE], b"hello").await, CommitOutcome::StoreFailed);

        let failing: Arc<dyn ResponseCacheStore> = Arc::new(FailingStore);
        let dyn_cache = ResponseCaching::new(failing, CacheOptions::default());
        assert!(matches!(
            dyn_cache.lookup(&mut get("/x", &[("cache-control", "only-if-cached")])).await,
            CacheLookup::GatewayTimeout
        ));
    }
}
