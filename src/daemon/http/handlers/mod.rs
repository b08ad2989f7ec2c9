//! HTTP API Request Handlers
//!
//! Handlers that map HTTP requests to orchestrator operations.

mod outputs;
mod system;
mod tasks;

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};

use crate::daemon::jobs::{OrchestratorError, TaskOrchestrator};
use crate::daemon::outputs::OutputStore;

use super::types::ErrorResponse;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<TaskOrchestrator>,
    pub outputs: OutputStore,
    pub metrics_enabled: bool,
}

impl AppState {
    pub fn new(orchestrator: Arc<TaskOrchestrator>) -> Self {
        let outputs = OutputStore::new(orchestrator.environment().storage.clone());
        Self {
            orchestrator,
            outputs,
            metrics_enabled: true,
        }
    }
}

// Re-export all handlers
pub use outputs::{cleanup_outputs, delete_parsed, list_parsed, manga_chapters, manga_info};
pub use system::{health, prometheus_metrics};
pub use tasks::{
    batch_parse, build, cancel_task, clear_completed, get_task, list_tasks, parse, task_events_sse, task_logs,
};

/// Count every API request.
pub async fn count_requests(State(state): State<AppState>, request: Request, next: Next) -> Response {
    state.orchestrator.metrics().http_requests_total.inc();
    next.run(request).await
}

/// Parse a task ID string into a UUID, returning an error response on failure.
fn parse_task_id(task_id: &str) -> Result<uuid::Uuid, Response> {
    uuid::Uuid::parse_str(task_id.trim()).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("INVALID_TASK_ID", "Invalid task ID format")),
        )
            .into_response()
    })
}

/// Map an orchestrator error to its HTTP status and code.
fn error_response(err: OrchestratorError) -> Response {
    let (status, code) = match &err {
        OrchestratorError::UnsupportedParser(_) => (StatusCode::BAD_REQUEST, "UNSUPPORTED_PARSER"),
        OrchestratorError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
        OrchestratorError::TaskNotFound(_) => (StatusCode::NOT_FOUND, "TASK_NOT_FOUND"),
        OrchestratorError::AlreadyFinished(_) => (StatusCode::CONFLICT, "TASK_FINISHED"),
        OrchestratorError::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN"),
    };
    (status, Json(ErrorResponse::new(code, err.to_string()))).into_response()
}
