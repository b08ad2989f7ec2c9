//! Task handlers: submission, status, logs, cancel, cleanup, SSE events

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::StreamExt as _;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::super::types::*;
use super::{error_response, parse_task_id, AppState};
use crate::daemon::jobs::BuildRequest;
use crate::task::TaskStatus;

fn accepted(state: &AppState, task_id: Uuid) -> Response {
    let (status, message) = state
        .orchestrator
        .get(&task_id)
        .map(|s| (s.status, s.message))
        .unwrap_or((TaskStatus::Pending, String::new()));
    (
        StatusCode::ACCEPTED,
        Json(TaskAcceptedResponse {
            task_id,
            status,
            message,
        }),
    )
        .into_response()
}

/// Queue a single-slug parse
pub async fn parse(State(state): State<AppState>, Json(request): Json<ParseRequest>) -> Response {
    debug!("HTTP parse request: slug={}, parser={:?}", request.slug, request.parser);
    match state
        .orchestrator
        .submit_parse(&request.slug, request.parser.as_deref(), request.auto_import)
    {
        Ok(task_id) => accepted(&state, task_id),
        Err(e) => error_response(e),
    }
}

/// Queue a batch parse
pub async fn batch_parse(State(state): State<AppState>, Json(request): Json<BatchParseRequest>) -> Response {
    debug!("HTTP batch parse request: {} slugs", request.slugs.len());
    match state
        .orchestrator
        .submit_batch_parse(request.slugs, request.parser.as_deref(), request.auto_import)
    {
        Ok(task_id) => accepted(&state, task_id),
        Err(e) => error_response(e),
    }
}

/// Queue a build
pub async fn build(State(state): State<AppState>, Json(request): Json<BuildRequestBody>) -> Response {
    debug!(
        "HTTP build request: slug={}, type={:?}, branch={:?}",
        request.slug, request.build_type, request.branch_id
    );
    let request = BuildRequest {
        slug: request.slug,
        parser: request.parser,
        build_type: request.build_type,
        branch_id: request.branch_id,
        auto_import: request.auto_import,
        chapter_ids: request.chapter_ids,
        chapter_keys: request.chapter_keys,
    };
    match state.orchestrator.submit_build(request) {
        Ok(task_id) => accepted(&state, task_id),
        Err(e) => error_response(e),
    }
}

/// Summaries of every task, newest first
pub async fn list_tasks(State(state): State<AppState>) -> impl IntoResponse {
    let summaries: Vec<TaskSummary> = state.orchestrator.list().iter().map(TaskSummary::from).collect();
    Json(summaries)
}

/// Full status of one task plus its log tail
pub async fn get_task(State(state): State<AppState>, Path(task_id): Path<String>) -> Response {
    let id = match parse_task_id(&task_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let Some(task) = state.orchestrator.get(&id) else {
        return error_response(crate::daemon::jobs::OrchestratorError::TaskNotFound(id));
    };
    let logs = match state.orchestrator.logs(&id, None, None) {
        Ok(logs) => logs,
        Err(e) => return error_response(e),
    };
    Json(TaskStatusResponse { task, logs }).into_response()
}

/// Log lines, tailable with `?after=<sequence>`
pub async fn task_logs(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Response {
    let id = match parse_task_id(&task_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.orchestrator.logs(&id, query.after, query.limit) {
        Ok(logs) => {
            let last_sequence = logs.last().map(|e| e.sequence).or(query.after);
            Json(TaskLogsResponse {
                task_id: id,
                logs,
                last_sequence,
            })
            .into_response()
        }
        Err(e) => error_response(e),
    }
}

/// Cancel a queued or running task
pub async fn cancel_task(State(state): State<AppState>, Path(task_id): Path<String>) -> Response {
    let id = match parse_task_id(&task_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    debug!("HTTP cancel request: {}", id);
    match state.orchestrator.cancel(&id) {
        Ok(snapshot) => Json(TaskSummary::from(&snapshot)).into_response(),
        Err(e) => error_response(e),
    }
}

/// Remove every finished task
pub async fn clear_completed(State(state): State<AppState>) -> impl IntoResponse {
    let task_ids = state.orchestrator.clear_finished();
    Json(ClearTasksResponse {
        cleared: task_ids.len(),
        task_ids,
    })
}

/// SSE endpoint for live task events
pub async fn task_events_sse(State(state): State<AppState>, Path(task_id): Path<String>) -> Response {
    let id = match parse_task_id(&task_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let subscription = match state.orchestrator.subscribe(&id) {
        Ok(subscription) => {
            info!("SSE client connected for task {}", id);
            subscription
        }
        Err(e) => {
            warn!("SSE subscribe failed for task {}: {}", id, e);
            return error_response(e);
        }
    };

    let stream = subscription.filter_map(move |event| {
        let event_name = event.event_name();
        match serde_json::to_string(&event) {
            Ok(json) => Some(Ok::<_, Infallible>(Event::default().event(event_name).data(json))),
            Err(e) => {
                warn!("SSE serialization error for task {}: {}", id, e);
                None
            }
        }
    });

    Sse::new(stream)
        .keep_alive(KeepAlive::default().interval(Duration::from_secs(15)))
        .into_response()
}
