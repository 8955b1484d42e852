//! HTTP API for health checks, Prometheus metrics and run control

use crate::runner::RunLauncher;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use reclaim_lib::{
    health::{ComponentStatus, HealthRegistry},
    observability::ReclaimerMetrics,
    RunTracker,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: ReclaimerMetrics,
    pub tracker: RunTracker,
    pub launcher: RunLauncher,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        metrics: ReclaimerMetrics,
        launcher: RunLauncher,
    ) -> Self {
        Self {
            health_registry,
            metrics,
            tracker: launcher.tracker().clone(),
            launcher,
        }
    }
}

/// Body returned by the run control endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ControlResponse {
    fn new(status: &str, message: Option<&str>) -> Self {
        Self {
            status: status.to_string(),
            message: message.map(str::to_string),
        }
    }
}

fn control(code: StatusCode, status: &str, message: Option<&str>) -> Response {
    (code, Json(ControlResponse::new(status, message))).into_response()
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        // A failed run leaves the agent usable
        ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    // Idle agents report the phase of their last run
    state.metrics.set_phase(state.tracker.current().await.phase);

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Live progress of the current (or most recent) run
async fn current_run(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.tracker.current().await)
}

/// Report or failure of the last finished run
async fn last_run(State(state): State<Arc<AppState>>) -> Response {
    match state.tracker.last().await {
        Some(record) => Json(record).into_response(),
        None => control(StatusCode::NOT_FOUND, "none", Some("no run has finished yet")),
    }
}

/// Start a run in the background - 202 when started, 409 while another is active
async fn start_run(State(state): State<Arc<AppState>>) -> Response {
    let Some(guard) = state.tracker.try_begin() else {
        return control(
            StatusCode::CONFLICT,
            "busy",
            Some("a reclamation run is already in progress"),
        );
    };

    match state.launcher.launch(guard).await {
        Ok(()) => control(StatusCode::ACCEPTED, "started", None),
        Err(e) => {
            error!(error = %e, "Failed to launch reclamation run");
            control(
                StatusCode::INTERNAL_SERVER_ERROR,
                "error",
                Some(&e.to_string()),
            )
        }
    }
}

/// Request cancellation - 202 when a run was signalled, 404 when idle
async fn cancel_run(State(state): State<Arc<AppState>>) -> Response {
    if state.tracker.request_cancel() {
        info!("Cancellation requested");
        control(StatusCode::ACCEPTED, "cancelling", None)
    } else {
        control(StatusCode::NOT_FOUND, "idle", Some("no run in progress"))
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/runs", post(start_run))
        .route("/api/v1/runs/current", get(current_run))
        .route("/api/v1/runs/last", get(last_run))
        .route("/api/v1/runs/cancel", post(cancel_run))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
