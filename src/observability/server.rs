//! Metrics HTTP endpoint.
//!
//! - `GET /metrics`: per-target series, then the facade recorder output
//! - `GET /healthz`: liveness
//! - `GET /targets`: currently monitored targets as JSON

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::discovery::TargetId;
use crate::monitor::Registry;
use crate::observability::metrics::KeepaliveMetrics;

const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Shared state of the metrics endpoint.
#[derive(Clone)]
pub struct MetricsState {
    pub store: Arc<KeepaliveMetrics>,
    pub registry: Arc<Registry>,
    pub recorder: Option<PrometheusHandle>,
}

pub fn router(state: MetricsState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { "ok" }))
        .route("/targets", get(targets_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(listener: TcpListener, state: MetricsState, shutdown: CancellationToken) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(address = %addr, "Metrics server starting");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!("Metrics server stopped");
    Ok(())
}

async fn metrics_handler(State(state): State<MetricsState>) -> Response {
    let mut body = match state.store.render() {
        Ok(body) => body,
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metric series");
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };
    if let Some(recorder) = &state.recorder {
        body.push_str(&recorder.render());
    }
    ([(header::CONTENT_TYPE, TEXT_FORMAT)], body).into_response()
}

async fn targets_handler(State(state): State<MetricsState>) -> Json<Vec<TargetId>> {
    Json(state.registry.targets())
}
