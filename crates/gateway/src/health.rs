//! HTTP health, readiness, and metrics surface.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use connector::HealthRegistry;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// State shared by the health routes.
pub struct HealthState {
    pub health: Arc<HealthRegistry>,
    pub prometheus: PrometheusHandle,
    pub inactivity_timeout: Duration,
}

pub fn create_health_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Liveness: the process is up.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now(),
    }))
}

/// Readiness: 200 when at least one upstream session is healthy.
async fn ready_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let exchanges = state.health.snapshot(state.inactivity_timeout);
    let ready = exchanges.iter().any(|e| e.healthy);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if ready { "ready" } else { "not_ready" },
            "timestamp": Utc::now(),
            "exchanges": exchanges,
        })),
    )
}

/// Prometheus exposition text.
async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus.render(),
    )
}
