//! HTTP health endpoint.
//!
//! - `GET /health` returns the [`HealthReport`] as JSON
//! - `GET /ready` returns `200` while the engine is running, `503` otherwise
//! - `GET /metrics` returns the engine's own counters in Prometheus text format
//!
//! The server stops gracefully when the engine's shutdown token fires.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::health::{HealthProbe, HealthReport, HealthStatus};

/// Routes serving `probe`.
pub fn router(probe: HealthProbe) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .with_state(probe)
}

async fn health(State(probe): State<HealthProbe>) -> Json<HealthReport> {
    Json(probe.report())
}

async fn ready(State(probe): State<HealthProbe>) -> (StatusCode, &'static str) {
    if probe.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn metrics(
    State(probe): State<HealthProbe>,
) -> ([(header::HeaderName, &'static str); 1], String) {
    let report = probe.report();
    let up = u8::from(report.ready && report.status != HealthStatus::Unhealthy);
    let mut body = format!(
        "# HELP collection_engine_up Whether the engine is running with a reachable target\n\
         # TYPE collection_engine_up gauge\n\
         collection_engine_up {up}\n\
         # HELP collection_engine_cycles_total Completed collection cycles\n\
         # TYPE collection_engine_cycles_total counter\n\
         collection_engine_cycles_total {}\n",
        report.cycles
    );
    body.push_str(&report.metrics.render_prometheus());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

/// Serve `probe` on `listener` until `shutdown` is cancelled.
pub fn spawn(listener: TcpListener, probe: HealthProbe, shutdown: CancellationToken) -> JoinHandle<()> {
    let local = listener.local_addr().ok();
    tokio::spawn(async move {
        tracing::info!(addr = ?local, "health endpoint listening");
        let server = axum::serve(listener, router(probe))
            .with_graceful_shutdown(shutdown.cancelled_owned());
        if let Err(error) = server.await {
            tracing::error!(%error, "health endpoint failed");
        }
        tracing::debug!("health endpoint stopped");
    })
}
