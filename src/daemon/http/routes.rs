//! HTTP API Route Definitions

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};

use super::handlers::{self, AppState};

/// Create the API router with all routes
pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::prometheus_metrics))
        // Submission
        .route("/parse", post(handlers::parse))
        .route("/parse/batch", post(handlers::batch_parse))
        .route("/batch-parse", post(handlers::batch_parse))
        .route("/batch-start", post(handlers::batch_parse))
        .route("/build", post(handlers::build))
        // Tasks
        .route("/tasks", get(handlers::list_tasks))
        .route("/tasks/clear-completed", post(handlers::clear_completed))
        .route("/tasks/:task_id", get(handlers::get_task))
        .route("/tasks/:task_id/logs", get(handlers::task_logs))
        .route("/tasks/:task_id/cancel", post(handlers::cancel_task))
        .route("/tasks/:task_id/events", get(handlers::task_events_sse))
        // Aliases
        .route("/status/:task_id", get(handlers::get_task))
        .route("/logs/:task_id", get(handlers::task_logs))
        .route("/logs/:task_id/stream", get(handlers::task_events_sse))
        // Stored output
        .route("/list-parsed", get(handlers::list_parsed))
        .route("/delete/:slug", delete(handlers::delete_parsed))
        .route("/maintenance/mangalib/cleanup", post(handlers::cleanup_outputs))
        .route("/manga-info/:slug", get(handlers::manga_info))
        .route("/manga-info/:slug/chapters-only", get(handlers::manga_chapters))
        .layer(middleware::from_fn_with_state(app_state.clone(), handlers::count_requests))
        .with_state(app_state)
}
