//! HTTP API Request/Response Types
//!
//! JSON bodies use camelCase field names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::task::{TaskLogEntry, TaskSnapshot, TaskStatus, TaskType};

/// `POST /parse`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParseRequest {
    pub slug: String,
    pub parser: Option<String>,
    pub auto_import: bool,
}

/// `POST /parse/batch`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchParseRequest {
    pub slugs: Vec<String>,
    pub parser: Option<String>,
    pub auto_import: bool,
}

/// `POST /build`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildRequestBody {
    pub slug: String,
    pub parser: Option<String>,
    #[serde(rename = "type")]
    pub build_type: Option<String>,
    pub branch_id: Option<i64>,
    pub auto_import: bool,
    /// Chapter ids; accepts strings or numbers
    #[serde(deserialize_with = "ids_as_strings")]
    pub chapter_ids: Vec<String>,
    /// `volume:number` keys
    pub chapter_keys: Vec<String>,
}

fn ids_as_strings<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(i64),
    }

    let ids: Option<Vec<Id>> = Option::deserialize(deserializer)?;
    Ok(ids
        .unwrap_or_default()
        .into_iter()
        .map(|id| match id {
            Id::Text(s) => s,
            Id::Number(n) => n.to_string(),
        })
        .collect())
}

/// Query for `GET /tasks/:id/logs`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogsQuery {
    pub after: Option<u64>,
    pub limit: Option<usize>,
}

/// Returned by every submission endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAcceptedResponse {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub message: String,
}

/// Lightweight entry of `GET /tasks`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub task_id: Uuid,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub progress: u8,
    pub message: String,
    pub slug: Option<String>,
    pub current_slug: Option<String>,
    pub total_slugs: usize,
    pub completed_slugs: usize,
    pub failed_slugs: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&TaskSnapshot> for TaskSummary {
    fn from(snapshot: &TaskSnapshot) -> Self {
        Self {
            task_id: snapshot.id,
            task_type: snapshot.task_type,
            status: snapshot.status,
            progress: snapshot.progress,
            message: snapshot.message.clone(),
            slug: snapshot.slug().map(str::to_string),
            current_slug: snapshot.current_slug.clone(),
            total_slugs: snapshot.total_slugs,
            completed_slugs: snapshot.completed_slugs,
            failed_slugs: snapshot.failed_slugs,
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
        }
    }
}

/// `GET /tasks/:id`: the full snapshot plus the log tail
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusResponse {
    #[serde(flatten)]
    pub task: TaskSnapshot,
    pub logs: Vec<TaskLogEntry>,
}

/// `GET /tasks/:id/logs`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLogsResponse {
    pub task_id: Uuid,
    pub logs: Vec<TaskLogEntry>,
    /// Pass back as `after` to continue tailing
    pub last_sequence: Option<u64>,
}

/// `POST /tasks/clear-completed`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearTasksResponse {
    pub cleared: usize,
    pub task_ids: Vec<Uuid>,
}

/// `GET /list-parsed`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedListResponse {
    pub count: usize,
    pub mangas: Vec<String>,
}

/// `DELETE /delete/{slug}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOutputResponse {
    pub deleted: bool,
    pub message: String,
}

/// Query for `POST /maintenance/mangalib/cleanup`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupQuery {
    pub max_age_days: Option<u64>,
}

/// `GET /manga-info/{slug}/chapters-only`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterListResponse {
    pub total_chapters: usize,
    pub chapters: Vec<serde_json::Value>,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: String,
    pub parsers: Vec<String>,
    pub active_tasks: u64,
    pub queued_tasks: u64,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new("INTERNAL_ERROR", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new("BAD_REQUEST", message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_request_accepts_numeric_ids_and_type() {
        let body: BuildRequestBody = serde_json::from_str(
            r#"{"slug":"solo","type":"AUTO","branchId":12,"autoImport":true,"chapterIds":[5,"6"]}"#,
        )
        .unwrap();
        assert_eq!(body.build_type.as_deref(), Some("AUTO"));
        assert_eq!(body.branch_id, Some(12));
        assert!(body.auto_import);
        assert_eq!(body.chapter_ids, vec!["5", "6"]);
        assert!(body.chapter_keys.is_empty());
    }

    #[test]
    fn requests_default_missing_fields() {
        let parse: ParseRequest = serde_json::from_str(r#"{"slug":"solo"}"#).unwrap();
        assert!(parse.parser.is_none());
        assert!(!parse.auto_import);

        let build: BuildRequestBody = serde_json::from_str(r#"{"slug":"solo","chapterIds":null}"#).unwrap();
        assert!(build.chapter_ids.is_empty());
    }
}
