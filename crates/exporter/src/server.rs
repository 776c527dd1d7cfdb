//! HTTP server exposing the registry.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
    Router,
};
use cost::registry::CONTENT_TYPE;
use cost::MetricRegistry;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Build the HTTP router.
pub fn build_router(registry: Arc<MetricRegistry>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/metrics/", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

/// Serve until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the address cannot be bound or the server fails.
pub async fn run_server<F>(registry: Arc<MetricRegistry>, addr: SocketAddr, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(registry);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("Cost exporter listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")?;

    Ok(())
}

async fn metrics_handler(State(registry): State<Arc<MetricRegistry>>) -> impl IntoResponse {
    let body = registry.read_all().render();
    ([(header::CONTENT_TYPE, CONTENT_TYPE)], body)
}

async fn health_handler() -> &'static str {
    "OK"
}
