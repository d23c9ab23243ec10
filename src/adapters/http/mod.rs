//! HTTP observability endpoints: Prometheus exposition and health.

mod health;

pub use health::{HealthComposite, HealthReport};

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::ObservabilityConfig;
use crate::domain::foundation::{BridgeError, ErrorCode};
use crate::ports::HealthState;
use crate::telemetry;

/// Builds the observability router.
pub fn router(health: Arc<HealthComposite>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .with_state(health)
}

/// Binds the observability listener and serves until aborted.
pub async fn serve(
    config: &ObservabilityConfig,
    health: Arc<HealthComposite>,
) -> Result<JoinHandle<()>, BridgeError> {
    let addr = config.socket_addr().map_err(|e| {
        BridgeError::new(ErrorCode::InternalError, format!("bad observability address: {e}"))
    })?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        BridgeError::new(ErrorCode::InternalError, format!("observability bind failed: {e}"))
    })?;
    info!(addr = %addr, "observability endpoints listening");

    let app = router(health);
    Ok(tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!(error = %err, "observability server stopped");
        }
    }))
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        telemetry::gather(),
    )
}

async fn health_handler(State(health): State<Arc<HealthComposite>>) -> impl IntoResponse {
    let report = health.report().await;
    let status =
        StatusCode::from_u16(report.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(report))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readiness_handler(State(health): State<Arc<HealthComposite>>) -> impl IntoResponse {
    let report = health.report().await;
    let status = match report.status {
        HealthState::Healthy | HealthState::Degraded => StatusCode::OK,
        HealthState::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(report))
}
