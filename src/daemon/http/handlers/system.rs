//! System handlers: health, metrics

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};

use super::AppState;
use crate::daemon::http::types::*;

/// Health check endpoint
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let metrics = state.orchestrator.metrics();
    Json(HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
        parsers: state.orchestrator.environment().sources.names(),
        active_tasks: metrics.active_tasks.get(),
        queued_tasks: metrics.queued_tasks.get(),
    })
}

/// Prometheus metrics endpoint
pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    if !state.metrics_enabled {
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("METRICS_DISABLED", "Metrics are disabled")),
        )
            .into_response();
    }
    let fetch = state.orchestrator.environment().clients.stats();
    let body = state.orchestrator.metrics().to_prometheus(Some(&fetch));
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}
