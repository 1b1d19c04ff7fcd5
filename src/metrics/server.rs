use super::MetricsRegistry;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub fn router(metrics: Arc<MetricsRegistry>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(metrics)
}

/// Serve `/metrics` and `/health` on an already-bound listener until shutdown.
pub async fn serve_metrics(
    listener: TcpListener,
    metrics: Arc<MetricsRegistry>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "Metrics server listening");
    axum::serve(listener, router(metrics))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

async fn metrics_handler(State(metrics): State<Arc<MetricsRegistry>>) -> impl IntoResponse {
    match metrics.encode_text() {
        Ok(buffer) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            buffer,
        )
            .into_response(),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "encoding error").into_response(),
    }
}
