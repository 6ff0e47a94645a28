use axum::body::Body;
use axum::extract::State;
use axum::http::header::{self, HeaderMap, HeaderName};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use response_cache::entry::ALL_QUERY_KEYS;
use response_cache::ResponseCachingFeature;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub type HttpClient = Client<HttpConnector, Body>;

/// Headers that describe a single connection and must not be forwarded.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

pub struct AppState {
    pub client: HttpClient,
    pub upstream_url: String,
    pub timeout: Duration,
}

/// Forwards the request upstream and streams the response back. Caching happens in the
/// middleware in front of this handler.
pub async fn proxy_handler(State(state): State<Arc<AppState>>, req: Request<Body>) -> Response {
    let start = Instant::now();
    let (parts, body) = req.into_parts();

    // The origin's resources are identified by path and query.
    if let Some(feature) = parts.extensions.get::<ResponseCachingFeature>() {
        feature.set_vary_by_query_keys([ALL_QUERY_KEYS]);
    }

    let upstream_uri = format!(
        "{}{}",
        state.upstream_url.trim_end_matches('/'),
        parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
    );

    let mut upstream_req = match Request::builder()
        .method(parts.method.clone())
        .uri(&upstream_uri)
        .body(body)
    {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(error = %e, "failed to build upstream request");
            return (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response();
        }
    };
    let mut forwarded = parts.headers;
    forwarded.remove(header::HOST);
    strip_hop_by_hop(&mut forwarded);
    *upstream_req.headers_mut() = forwarded;

    let upstream_resp =
        match tokio::time::timeout(state.timeout, state.client.request(upstream_req)).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                tracing::error!(error = %e, upstream = %upstream_uri, "upstream request failed");
                return (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response();
            }
            Err(_) => {
                tracing::warn!(
                    upstream = %upstream_uri,
                    timeout_ms = state.timeout.as_millis() as u64,
                    "upstream request timed out"
                );
                return (StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout").into_response();
            }
        };

    let (mut resp_parts, resp_body) = upstream_resp.into_parts();
    strip_hop_by_hop(&mut resp_parts.headers);

    tracing::debug!(
        method = %parts.method,
        upstream = %upstream_uri,
        status = resp_parts.status.as_u16(),
        latency_us = start.elapsed().as_micros() as u64,
        "forwarded"
    );

    Response::from_parts(resp_parts, Body::new(resp_body))
}

/// Drop hop-by-hop headers, including any the `Connection` header names.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use axum::routing::{any, get};
    use axum::Router;
    use http_body_util::BodyExt;
    use hyper_util::rt::TokioExecutor;
    use tower::ServiceExt;

    fn proxy(upstream_url: String, timeout: Duration) -> Router {
        let state = Arc::new(AppState {
            client: Client::builder(TokioExecutor::new()).build_http(),
            upstream_url,
            timeout,
        });
        Router::new()
            .route("/{*path}", any(proxy_handler))
            .with_state(state)
    }

    async fn spawn_origin(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn strips_connection_scoped_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("close, x-session"));
        headers.insert("x-session", HeaderValue::from_static("1"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(header::ETAG, HeaderValue::from_static("\"abc\""));

        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(header::ETAG));
    }

    #[tokio::test]
    async fn forwards_path_query_and_headers() {
        let origin = Router::new().route(
            "/echo",
            get(|req: Request<Body>| async move {
                let lang = req
                    .headers()
                    .get(header::ACCEPT_LANGUAGE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                let query = req.uri().query().unwrap_or("").to_string();
                ([(header::CACHE_CONTROL, "public, max-age=5")], format!("{lang}|{query}"))
            }),
        );
        let app = proxy(spawn_origin(origin).await, Duration::from_secs(5));

        let req = Request::get("/echo?page=2")
            .header(header::ACCEPT_LANGUAGE, "fr")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CACHE_CONTROL], "public, max-age=5");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "fr|page=2");
    }

    #[tokio::test]
    async fn cached_per_query_string() {
        use crate::cache_layer::{response_cache, CacheState};
        use axum::extract::Query;
        use response_cache::memory::MemoryResponseStore;
        use response_cache::{CacheOptions, ResponseCacheStore, ResponseCaching};
        use std::collections::HashMap;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let origin = Router::new().route(
            "/list",
            get(move |Query(q): Query<HashMap<String, String>>| {
                counted.fetch_add(1, Ordering::SeqCst);
                let page = q.get("page").cloned().unwrap_or_default();
                let body = format!("page {page}");
                async move { ([(header::CACHE_CONTROL, "public, max-age=60")], body) }
            }),
        );
        let upstream = spawn_origin(origin).await;

        let store: Arc<dyn ResponseCacheStore> = Arc::new(MemoryResponseStore::new(1024));
        let cache = Arc::new(CacheState::new(ResponseCaching::new(store, CacheOptions::default())));
        let app = proxy(upstream, Duration::from_secs(5)).layer(
            axum::middleware::from_fn_with_state(cache, response_cache),
        );

        let fetch = |uri: &'static str| {
            let app = app.clone();
            async move {
                let req = Request::get(uri).body(Body::empty()).unwrap();
                let response = app.oneshot(req).await.unwrap();
                let body = response.into_body().collect().await.unwrap().to_bytes();
                String::from_utf8(body.to_vec()).unwrap()
            }
        };

        assert_eq!(fetch("/list?page=1").await, "page 1");
        assert_eq!(fetch("/list?page=2").await, "page 2");
        assert_eq!(fetch("/list?page=1").await, "page 1");
        assert_eq!(fetch("/list").await, "page ");
        assert_eq!(fetch("/list?page=2").await, "page 2");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unreachable_upstream_is_bad_gateway() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let app = proxy(format!("http://{addr}"), Duration::from_secs(5));
        let req = Request::get("/x").body(Body::empty()).unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn slow_upstream_is_gateway_timeout() {
        let origin = Router::new().route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        );
        let app = proxy(spawn_origin(origin).await, Duration::from_millis(50));
        let req = Request::get("/slow").body(Body::empty()).unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
