//! Response caching as an axum middleware.
//!
//! Hits and `304`s are answered without calling the inner service. Misses run it and wrap
//! the response body in a [`CapturingBody`] that feeds every data frame to the capture
//! transaction and commits before handing out the last one. A client that goes away
//! mid-body drops the transaction with it, and nothing is stored.

use crate::telemetry::CacheCounters;
use arc_swap::ArcSwap;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use http_body::{Body as _, Frame, SizeHint};
use response_cache::{
    CacheError, CacheLookup, CaptureTransaction, CommitOutcome, ResponseCacheStore,
    ResponseCaching, ServedResponse,
};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

pub type Caching = ResponseCaching<dyn ResponseCacheStore>;

const X_CACHE: &str = "x-cache";

/// Shared by the middleware and the admin endpoints. The orchestrator sits behind an
/// `ArcSwap` so config reloads can replace it while requests are in flight.
pub struct CacheState {
    pub caching: ArcSwap<Caching>,
    pub counters: CacheCounters,
}

impl CacheState {
    pub fn new(caching: Caching) -> Self {
        Self {
            caching: ArcSwap::from_pointee(caching),
            counters: CacheCounters::default(),
        }
    }
}

pub async fn response_cache(
    State(cache): State<Arc<CacheState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let caching = cache.caching.load_full();
    let lookup = caching.lookup(&mut req).await;
    cache.counters.record_lookup(&lookup);

    match lookup {
        CacheLookup::Bypass => {
            let mut response = next.run(req).await;
            response
                .headers_mut()
                .insert(X_CACHE, HeaderValue::from_static("BYPASS"));
            response
        }
        CacheLookup::Hit(served) | CacheLookup::NotModified(served) => from_cache(served),
        CacheLookup::GatewayTimeout => {
            (StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout").into_response()
        }
        CacheLookup::Miss(mut tx) => {
            let (mut parts, body) = next.run(req).await.into_parts();
            // Finalize before X-Cache goes on so it isn't stored with the response.
            tx.on_headers_ready(parts.status, &mut parts.headers).await;
            parts
                .headers
                .insert(X_CACHE, HeaderValue::from_static("MISS"));

            if !tx.is_capturing() {
                let outcome = tx.on_body_complete().await;
                cache.counters.record_commit(&outcome);
                return Response::from_parts(parts, body);
            }
            let body = CapturingBody::new(body, tx, Arc::clone(&cache));
            Response::from_parts(parts, Body::new(body))
        }
    }
}

/// One frame per shard.
fn from_cache(served: ServedResponse) -> Response {
    let shards = served.body.reader().map(Ok::<_, Infallible>);
    let mut response = Response::new(Body::from_stream(futures_util::stream::iter(shards)));
    *response.status_mut() = served.status;
    *response.headers_mut() = served.headers;
    response
        .headers_mut()
        .insert(X_CACHE, HeaderValue::from_static("HIT"));
    response
}

type CommitFuture = BoxFuture<'static, Result<CommitOutcome, CacheError>>;

enum Phase {
    Streaming(CaptureTransaction<dyn ResponseCacheStore>),
    /// The inner body is exhausted. `last` is its final data frame, held back until the
    /// commit settles.
    Committing {
        commit: CommitFuture,
        last: Option<Frame<Bytes>>,
    },
    Done,
}

/// Passes the inner body through untouched while buffering it for the cache.
///
/// The commit finishes before the last frame is handed out, because an HTTP/1 server
/// that knows the body length stops polling once it has written that many bytes.
pub struct CapturingBody {
    inner: Body,
    phase: Phase,
    cache: Arc<CacheState>,
    declared: Option<u64>,
    seen: u64,
}

impl CapturingBody {
    fn new(
        inner: Body,
        tx: CaptureTransaction<dyn ResponseCacheStore>,
        cache: Arc<CacheState>,
    ) -> Self {
        let declared = inner.size_hint().exact();
        Self {
            inner,
            phase: Phase::Streaming(tx),
            cache,
            declared,
            seen: 0,
        }
    }

    fn inner_complete(&self) -> bool {
        self.inner.is_end_stream() || self.declared == Some(self.seen)
    }
}

impl http_body::Body for CapturingBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Self::Error>>> {
        let this = self.get_mut();
        loop {
            match std::mem::replace(&mut this.phase, Phase::Done) {
                Phase::Streaming(mut tx) => match Pin::new(&mut this.inner).poll_frame(cx) {
                    Poll::Pending => {
                        this.phase = Phase::Streaming(tx);
                        return Poll::Pending;
                    }
                    Poll::Ready(Some(Ok(frame))) => {
                        if let Some(data) = frame.data_ref() {
                            tx.write(data);
                            this.seen += data.len() as u64;
                        }
                        if !this.inner_complete() {
                            this.phase = Phase::Streaming(tx);
                            return Poll::Ready(Some(Ok(frame)));
                        }
                        this.phase = Phase::Committing {
                            commit: Box::pin(tx.on_body_complete()),
                            last: Some(frame),
                        };
                    }
                    Poll::Ready(Some(Err(err))) => {
                        tracing::debug!(
                            key = %tx.base_key().escape_debug(),
                            error = %err,
                            "response body failed, not caching"
                        );
                        return Poll::Ready(Some(Err(err)));
                    }
                    Poll::Ready(None) => {
                        this.phase = Phase::Committing {
                            commit: Box::pin(tx.on_body_complete()),
                            last: None,
                        };
                    }
                },
                Phase::Committing { mut commit, last } => match commit.as_mut().poll(cx) {
                    Poll::Pending => {
                        this.phase = Phase::Committing { commit, last };
                        return Poll::Pending;
                    }
                    Poll::Ready(outcome) => {
                        this.cache.counters.record_commit(&outcome);
                        return Poll::Ready(last.map(Ok));
                    }
                },
                Phase::Done => return Poll::Ready(None),
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        matches!(self.phase, Phase::Done)
    }

    fn size_hint(&self) -> SizeHint {
        match &self.phase {
            Phase::Streaming(_) => self.inner.size_hint(),
            Phase::Committing { last, .. } => {
                let held = last.as_ref().and_then(Frame::data_ref).map_or(0, |d| d.len());
                SizeHint::with_exact(held as u64)
            }
            Phase::Done => SizeHint::with_exact(0),
        }
    }
}

/// A body dropped after its last byte, but before anyone polled it to the end, still
/// commits. One dropped partway through stores nothing.
impl Drop for CapturingBody {
    fn drop(&mut self) {
        let commit = match std::mem::replace(&mut self.phase, Phase::Done) {
            Phase::Committing { commit, .. } => commit,
            Phase::Streaming(tx) if self.inner_complete() => Box::pin(tx.on_body_complete()),
            _ => return,
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let cache = Arc::clone(&self.cache);
        runtime.spawn(async move {
            let outcome = commit.await;
            cache.counters.record_commit(&outcome);
        });
    }
}
