use axum::extract::{Path, Query};
use axum::http::header::{ACCEPT_LANGUAGE, CACHE_CONTROL, ETAG, EXPIRES, LAST_MODIFIED, VARY};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, SystemTime};
use tracing_subscriber::EnvFilter;

/// Simulated origin latency, 5-20ms.
async fn work() -> u64 {
    let delay = rand::thread_rng().gen_range(5..=20);
    tokio::time::sleep(Duration::from_millis(delay)).await;
    delay
}

/// Cacheable for 30s, validated by ETag.
async fn get_item(Path(id): Path<u64>) -> impl IntoResponse {
    let delay = work().await;
    let etag = format!("\"item-{id}\"");
    (
        [
            (CACHE_CONTROL, "public, max-age=30".to_string()),
            (ETAG, etag),
            (LAST_MODIFIED, httpdate::fmt_http_date(SystemTime::UNIX_EPOCH)),
        ],
        Json(json!({
            "id": id,
            "name": format!("Item {id}"),
            "data": "x".repeat(256),
            "latency_ms": delay,
        })),
    )
}

/// Varies by `Accept-Language`.
async fn greeting(headers: HeaderMap) -> impl IntoResponse {
    work().await;
    let lang = headers
        .get(ACCEPT_LANGUAGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .unwrap_or_default();
    let text = if lang.starts_with("fr") {
        "bonjour"
    } else if lang.starts_with("de") {
        "hallo"
    } else {
        "hello"
    };
    (
        [(CACHE_CONTROL, "public, max-age=60"), (VARY, "Accept-Language")],
        text,
    )
}

#[derive(Deserialize)]
struct Page {
    page: Option<u32>,
}

const MAX_PAGE: u32 = 1000;

/// Freshness from `Expires` only, a minute out.
async fn listing(Query(q): Query<Page>) -> impl IntoResponse {
    work().await;
    let page = q.page.unwrap_or(1).clamp(1, MAX_PAGE);
    let expires = httpdate::fmt_http_date(SystemTime::now() + Duration::from_secs(60));
    (
        [(CACHE_CONTROL, "public".to_string()), (EXPIRES, expires)],
        Json(json!({ "page": page, "items": ((page - 1) * 10..page * 10).collect::<Vec<_>>() })),
    )
}

/// Never stored.
async fn session() -> impl IntoResponse {
    (
        [(CACHE_CONTROL, "private, no-store")],
        format!("session at {}", httpdate::fmt_http_date(SystemTime::now())),
    )
}

async fn health() -> &'static str {
    "ok"
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let app = Router::new()
        .route("/api/items/{id}", get(get_item))
        .route("/api/greeting", get(greeting))
        .route("/api/list", get(listing))
        .route("/api/session", get(session))
        .route("/health", get(health));

    let addr = "0.0.0.0:3000";
    tracing::info!(addr, "demo backend starting");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, addr, "failed to bind");
            return;
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "demo backend stopped");
    }
}
