//! Task progress events
//!
//! Events pushed to per-task subscribers while a task runs. There is no replay:
//! a subscriber that connects late reads the current state from the status
//! endpoint and receives only what happens afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::{TaskLogEntry, TaskLogLevel, TaskSnapshot, TaskStatus};

/// Events emitted while a task runs.
///
/// Serialized as internally-tagged JSON (`"type": "progress"`) and sent as an
/// SSE `event:` with the matching name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ProgressEvent {
    /// Status, progress, or counters changed.
    Progress {
        task_id: Uuid,
        status: TaskStatus,
        progress: u8,
        message: String,
        current_slug: Option<String>,
        total_slugs: usize,
        completed_slugs: usize,
        failed_slugs: usize,
        updated_at: DateTime<Utc>,
    },

    /// A log line was appended.
    Log {
        task_id: Uuid,
        sequence: u64,
        level: TaskLogLevel,
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Terminal event; the channel closes after it.
    Completed {
        task_id: Uuid,
        status: TaskStatus,
        message: String,
        total_slugs: usize,
        completed_slugs: usize,
        failed_slugs: usize,
        error: Option<String>,
    },
}

impl ProgressEvent {
    pub fn progress(snapshot: &TaskSnapshot) -> Self {
        ProgressEvent::Progress {
            task_id: snapshot.id,
            status: snapshot.status,
            progress: snapshot.progress,
            message: snapshot.message.clone(),
            current_slug: snapshot.current_slug.clone(),
            total_slugs: snapshot.total_slugs,
            completed_slugs: snapshot.completed_slugs,
            failed_slugs: snapshot.failed_slugs,
            updated_at: snapshot.updated_at,
        }
    }

    pub fn log(task_id: Uuid, entry: &TaskLogEntry) -> Self {
        ProgressEvent::Log {
            task_id,
            sequence: entry.sequence,
            level: entry.level,
            message: entry.message.clone(),
            timestamp: entry.timestamp,
        }
    }

    pub fn completed(snapshot: &TaskSnapshot) -> Self {
        let error = match snapshot.status {
            TaskStatus::Failed => Some(snapshot.message.clone()),
            _ => None,
        };
        ProgressEvent::Completed {
            task_id: snapshot.id,
            status: snapshot.status,
            message: snapshot.message.clone(),
            total_slugs: snapshot.total_slugs,
            completed_slugs: snapshot.completed_slugs,
            failed_slugs: snapshot.failed_slugs,
            error,
        }
    }

    pub fn task_id(&self) -> Uuid {
        match self {
            ProgressEvent::Progress { task_id, .. }
            | ProgressEvent::Log { task_id, .. }
            | ProgressEvent::Completed { task_id, .. } => *task_id,
        }
    }

    /// Returns the SSE `event:` field name for this event.
    pub fn event_name(&self) -> &'static str {
        match self {
            ProgressEvent::Progress { .. } => "progress",
            ProgressEvent::Log { .. } => "log",
            ProgressEvent::Completed { .. } => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Completed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{ParserTask, TaskType};

    #[test]
    fn serializes_tagged_camel_case() {
        let task = ParserTask::new(TaskType::Parse, vec!["solo".into()]);
        let event = ProgressEvent::progress(&task.snapshot());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["status"], "PENDING");
        assert_eq!(json["totalSlugs"], 1);
        assert_eq!(event.event_name(), "progress");
        assert_eq!(event.task_id(), task.id());
    }

    #[test]
    fn completed_carries_error_only_on_failure() {
        let task = ParserTask::new(TaskType::Parse, vec!["solo".into()]);
        task.begin().unwrap();
        task.finish(TaskStatus::Failed, "metadata unavailable").unwrap();
        let event = ProgressEvent::completed(&task.snapshot());
        assert!(event.is_terminal());
        match event {
            ProgressEvent::Completed { error, failed_slugs, .. } => {
                assert_eq!(error.as_deref(), Some("metadata unavailable"));
                assert_eq!(failed_slugs, 1);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
