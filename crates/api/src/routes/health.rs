//! Health check endpoints.

use axum::{extract::State, http::StatusCode, Json};

use crate::response::HealthResponse;
use crate::state::AppState;

/// GET /health - Full health check with quota usage.
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let report = state.health.report();
    let usage = if state.health.store.is_healthy() {
        state.gate.all_usage().await
    } else {
        Vec::new()
    };

    Json(HealthResponse {
        status: report.status,
        broker_connected: state.health.broker.is_healthy(),
        store_connected: state.health.store.is_healthy(),
        components: report.components,
        usage,
        version: env!("CARGO_PKG_VERSION"),
        timestamp: chrono::Utc::now(),
    })
}

/// GET /health/ready - Readiness check (broker and store reachable).
pub async fn ready_handler(State(state): State<AppState>) -> StatusCode {
    if state.health.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// GET /health/live - Liveness check (service is running).
pub async fn live_handler(State(state): State<AppState>) -> StatusCode {
    if state.health.is_alive() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
