//! Stored output handlers: list, read, delete, cleanup

use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;
use tracing::{debug, error, info};

use super::super::types::*;
use super::AppState;
use crate::daemon::outputs::OutputError;

fn output_error_response(err: OutputError) -> Response {
    let (status, code) = match &err {
        OutputError::InvalidSlug(_) => (StatusCode::BAD_REQUEST, "INVALID_SLUG"),
        OutputError::Malformed { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "MALFORMED_TITLE"),
        OutputError::Io(_) | OutputError::Join(_) => {
            error!("Stored output operation failed: {}", err);
            (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR")
        }
    };
    (status, Json(ErrorResponse::new(code, err.to_string()))).into_response()
}

fn title_not_found(slug: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse::new("TITLE_NOT_FOUND", format!("Manga not found: {}", slug.trim()))),
    )
        .into_response()
}

/// Slugs with saved metadata
pub async fn list_parsed(State(state): State<AppState>) -> Response {
    match state.outputs.list_parsed().await {
        Ok(mangas) => Json(ParsedListResponse {
            count: mangas.len(),
            mangas,
        })
        .into_response(),
        Err(e) => output_error_response(e),
    }
}

/// Remove a title's metadata and pages
pub async fn delete_parsed(State(state): State<AppState>, Path(slug): Path<String>) -> Response {
    debug!("HTTP delete request: {}", slug);
    match state.outputs.delete(&slug).await {
        Ok(deleted) => {
            let message = if deleted {
                format!("Manga deleted successfully: {}", slug)
            } else {
                format!("Manga not found or already deleted: {}", slug)
            };
            Json(DeleteOutputResponse { deleted, message }).into_response()
        }
        Err(e) => output_error_response(e),
    }
}

/// Delete stored files older than the configured age, or `?maxAgeDays=`
pub async fn cleanup_outputs(State(state): State<AppState>, Query(query): Query<CleanupQuery>) -> Response {
    let days = query
        .max_age_days
        .unwrap_or(state.outputs.storage().cleanup_max_age_days);
    info!("Cleaning stored output older than {} days", days);
    match state.outputs.cleanup(Duration::from_secs(days * 86_400)).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => output_error_response(e),
    }
}

/// The saved title document as written by the parse task
pub async fn manga_info(State(state): State<AppState>, Path(slug): Path<String>) -> Response {
    match state.outputs.read_title(&slug).await {
        Ok(Some(title)) => Json(title).into_response(),
        Ok(None) => title_not_found(&slug),
        Err(e) => output_error_response(e),
    }
}

/// Only the chapter list of a saved title
pub async fn manga_chapters(State(state): State<AppState>, Path(slug): Path<String>) -> Response {
    match state.outputs.read_title(&slug).await {
        Ok(Some(mut title)) => {
            let chapters = match title.get_mut("chapters").map(Value::take) {
                Some(Value::Array(chapters)) => chapters,
                _ => Vec::new(),
            };
            Json(ChapterListResponse {
                total_chapters: chapters.len(),
                chapters,
            })
            .into_response()
        }
        Ok(None) => title_not_found(&slug),
        Err(e) => output_error_response(e),
    }
}
