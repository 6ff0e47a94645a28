mod cache_layer;
mod config;
mod proxy;
mod telemetry;

use axum::routing::{any, get};
use axum::Router;
use cache_layer::{response_cache, CacheState};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use metrics_exporter_prometheus::PrometheusBuilder;
use proxy::{proxy_handler, AppState};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// First argument, else `PROXY_CONFIG`, else `config.toml`.
fn config_path() -> PathBuf {
    std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os("PROXY_CONFIG"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"))
}

#[tokio::main]
async fn main() {
    telemetry::init_tracing();

    let path = config_path();
    let config = config::Config::load_or_default(&path);
    let cache = Arc::new(CacheState::new(config.cache.build_caching()));

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| {
            tracing::error!(error = %e, "prometheus recorder unavailable, /metrics will be empty")
        })
        .ok();

    let admin = Router::new()
        .route("/api/stats", get(telemetry::stats_handler))
        .route(
            "/metrics",
            get(move || {
                let rendered = prometheus.as_ref().map(|p| p.render()).unwrap_or_default();
                async move { rendered }
            }),
        )
        .with_state(Arc::clone(&cache));

    let upstream = Arc::new(AppState {
        client: Client::builder(TokioExecutor::new()).build_http(),
        upstream_url: config.upstream.url.clone(),
        timeout: Duration::from_millis(config.upstream.timeout_ms),
    });
    let front = Router::new()
        .route("/", any(proxy_handler))
        .route("/{*path}", any(proxy_handler))
        .with_state(upstream)
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&cache),
            response_cache,
        ))
        .layer(TraceLayer::new_for_http());

    tracing::info!(
        listen = %config.server.listen_addr,
        admin = %config.server.metrics_addr,
        upstream = %config.upstream.url,
        backend = ?config.cache.backend,
        capacity = config.cache.capacity,
        default_ttl_secs = config.cache.default_ttl_seconds,
        "caching proxy starting"
    );

    let listen_addr = config.server.listen_addr.clone();
    let admin_addr = config.server.metrics_addr.clone();
    // Dropping the watcher stops it, so it is held until shutdown.
    let _watcher = config::watch(path, config, Arc::clone(&cache));

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let result = tokio::try_join!(
        serve("proxy", &listen_addr, front, shutdown.clone()),
        serve("admin", &admin_addr, admin, shutdown.clone()),
    );
    if let Err(e) = result {
        tracing::error!(error = %e, "server stopped");
        shutdown.cancel();
    }

    tracing::info!("caching proxy shut down");
}

async fn serve(
    name: &'static str,
    addr: &str,
    router: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        std::io::Error::new(e.kind(), format!("failed to bind {name} listener to {addr}: {e}"))
    })?;
    tracing::info!(server = name, addr, "listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

/// SIGINT, or SIGTERM on unix.
async fn cancel_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM not available");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
        _ = token.cancelled() => return,
    }
    tracing::info!("shutdown signal received, draining connections");
    token.cancel();
}
