//! Task lifecycle state
//!
//! A [`ParserTask`] is written by the single worker driving it and read at any
//! time by status handlers and the progress broadcaster. Mutable fields live
//! behind one lock and are only handed out as a [`TaskSnapshot`] copy, so a
//! reader never observes a half-applied update. Logs sit behind their own lock
//! so appending never contends with a status poll.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::scraping::source::ChapterSelector;

/// Kind of work a task performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Parse,
    Build,
    BatchParse,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Parse => "PARSE",
            TaskType::Build => "BUILD",
            TaskType::BatchParse => "BATCH_PARSE",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task status
///
/// `PENDING → RUNNING → [IMPORTING_MANGA → IMPORTING_CHAPTERS] → COMPLETED | FAILED | CANCELLED`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    ImportingManga,
    ImportingChapters,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }

    /// Whether moving from `self` to `next` follows the lifecycle graph.
    /// Staying in the same state is always allowed.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        if *self == next {
            return true;
        }
        match self {
            Pending => next == Running,
            Running => next == ImportingManga || next.is_terminal(),
            ImportingManga => next == ImportingChapters || next.is_terminal(),
            ImportingChapters => next.is_terminal(),
            Completed | Failed | Cancelled => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::ImportingManga => "IMPORTING_MANGA",
            TaskStatus::ImportingChapters => "IMPORTING_CHAPTERS",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task model errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("Invalid status transition {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },
}

/// Outcome of one item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    Completed,
    Failed,
}

/// Per-item outcome. Keyed by slug for parse tasks and by chapter key for builds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub slug: String,
    /// Last step the item reached (`metadata`, `chapters`, `pages`, `import`, ...)
    pub step: String,
    pub status: ItemStatus,
    pub completed_at: DateTime<Utc>,
    pub metrics: BTreeMap<String, serde_json::Value>,
    pub error: Option<String>,
    pub imported: bool,
}

impl TaskResult {
    pub fn success(slug: impl Into<String>, step: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            step: step.into(),
            status: ItemStatus::Completed,
            completed_at: Utc::now(),
            metrics: BTreeMap::new(),
            error: None,
            imported: false,
        }
    }

    pub fn failure(slug: impl Into<String>, step: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            status: ItemStatus::Failed,
            error: Some(error.into()),
            ..Self::success(slug, step)
        }
    }

    pub fn with_metric(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metrics.insert(key.into(), value.into());
        self
    }

    pub fn with_imported(mut self, imported: bool) -> Self {
        self.imported = imported;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ItemStatus::Completed
    }
}

/// Severity of a task log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskLogLevel {
    Info,
    Warn,
    Error,
}

impl fmt::Display for TaskLogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        })
    }
}

/// One chronological log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLogEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub level: TaskLogLevel,
    pub message: String,
}

/// Options of a build request, reported back as `buildState`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildOptions {
    pub parser: String,
    pub build_type: Option<String>,
    pub branch_id: Option<i64>,
    pub auto_import: bool,
    #[serde(flatten)]
    pub selector: ChapterSelector,
}

#[derive(Debug)]
struct TaskState {
    status: TaskStatus,
    progress: u8,
    message: String,
    current_slug: Option<String>,
    total: usize,
    completed: usize,
    failed: usize,
    started_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    results: BTreeMap<String, TaskResult>,
    metrics: BTreeMap<String, serde_json::Value>,
}

impl TaskState {
    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn processed(&self) -> usize {
        self.completed + self.failed
    }

    /// Make room for one more processed item without breaking `processed <= total`.
    fn reserve_one(&mut self) {
        if self.processed() >= self.total {
            self.total = self.processed() + 1;
        }
    }
}

/// A parse, build, or batch task
#[derive(Debug)]
pub struct ParserTask {
    id: Uuid,
    task_type: TaskType,
    slugs: Vec<String>,
    created_at: DateTime<Utc>,
    build: Option<BuildOptions>,
    state: RwLock<TaskState>,
    logs: RwLock<Vec<TaskLogEntry>>,
}

impl ParserTask {
    pub fn new(task_type: TaskType, slugs: Vec<String>) -> Self {
        let now = Utc::now();
        let total = slugs.len();
        Self {
            id: Uuid::new_v4(),
            task_type,
            slugs,
            created_at: now,
            build: None,
            state: RwLock::new(TaskState {
                status: TaskStatus::Pending,
                progress: 0,
                message: "Task created".to_string(),
                current_slug: None,
                total,
                completed: 0,
                failed: 0,
                started_at: None,
                updated_at: now,
                completed_at: None,
                results: BTreeMap::new(),
                metrics: BTreeMap::new(),
            }),
            logs: RwLock::new(Vec::new()),
        }
    }

    pub fn with_build_options(mut self, options: BuildOptions) -> Self {
        self.build = Some(options);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    pub fn slugs(&self) -> &[String] {
        &self.slugs
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn build_options(&self) -> Option<&BuildOptions> {
        self.build.as_ref()
    }

    pub fn status(&self) -> TaskStatus {
        self.state.read().status
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn progress(&self) -> u8 {
        self.state.read().progress
    }

    /// Claim the task for execution. Fails unless the task is still pending.
    pub fn begin(&self) -> Result<(), TaskError> {
        let mut state = self.state.write();
        if state.status != TaskStatus::Pending {
            return Err(TaskError::InvalidTransition {
                from: state.status,
                to: TaskStatus::Running,
            });
        }
        let now = Utc::now();
        state.status = TaskStatus::Running;
        state.started_at = Some(now);
        state.updated_at = now;
        Ok(())
    }

    /// Cancel a task that never started, in one step. Returns `false` if the
    /// task had already been picked up.
    pub fn cancel_if_pending(&self, message: &str) -> bool {
        {
            let mut state = self.state.write();
            if state.status != TaskStatus::Pending {
                return false;
            }
            state.status = TaskStatus::Running;
            state.started_at = Some(Utc::now());
            self.finalize(&mut state, TaskStatus::Cancelled, message);
        }
        self.append_log(TaskLogLevel::Warn, message);
        true
    }

    /// Move to `next` along the lifecycle graph. Returns `Ok(false)` when the
    /// task is already in that state.
    pub fn set_status(&self, next: TaskStatus) -> Result<bool, TaskError> {
        let mut state = self.state.write();
        let from = state.status;
        if from == next {
            return Ok(false);
        }
        if !from.can_transition_to(next) {
            return Err(TaskError::InvalidTransition { from, to: next });
        }
        if next.is_terminal() {
            let message = state.message.clone();
            self.finalize(&mut state, next, &message);
        } else {
            state.status = next;
            state.touch();
        }
        Ok(true)
    }

    /// Set progress, clamped into 0..=100.
    pub fn set_progress(&self, value: i64) {
        let mut state = self.state.write();
        state.progress = value.clamp(0, 100) as u8;
        state.touch();
    }

    pub fn set_message(&self, message: impl Into<String>) {
        let mut state = self.state.write();
        state.message = message.into();
        state.touch();
    }

    pub fn set_current_slug(&self, slug: Option<String>) {
        let mut state = self.state.write();
        state.current_slug = slug;
        state.touch();
    }

    /// Set the number of items. Never drops below what was already processed.
    pub fn set_total(&self, total: usize) {
        let mut state = self.state.write();
        state.total = total.max(state.processed());
        state.touch();
    }

    /// Record a successful item; counter and result change together.
    pub fn record_success(&self, result: TaskResult) {
        let mut state = self.state.write();
        state.reserve_one();
        state.completed += 1;
        state.results.insert(result.slug.clone(), result);
        state.touch();
    }

    pub fn record_failure(&self, result: TaskResult) {
        let mut state = self.state.write();
        state.reserve_one();
        state.failed += 1;
        state.results.insert(result.slug.clone(), result);
        state.touch();
    }

    /// Insert or replace a result without touching counters.
    pub fn put_result(&self, result: TaskResult) {
        let mut state = self.state.write();
        state.results.insert(result.slug.clone(), result);
        state.touch();
    }

    /// Apply `f` to an existing result.
    pub fn update_result(&self, key: &str, f: impl FnOnce(&mut TaskResult)) -> bool {
        let mut state = self.state.write();
        let found = match state.results.get_mut(key) {
            Some(result) => {
                f(result);
                true
            }
            None => false,
        };
        if found {
            state.touch();
        }
        found
    }

    pub fn put_metric(&self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        let mut state = self.state.write();
        state.metrics.insert(key.into(), value.into());
        state.touch();
    }

    /// Append a log line with the next sequence number and mirror it to tracing.
    pub fn append_log(&self, level: TaskLogLevel, message: impl Into<String>) -> TaskLogEntry {
        let message = message.into();
        match level {
            TaskLogLevel::Info => info!(task_id = %self.id, "{}", message),
            TaskLogLevel::Warn => warn!(task_id = %self.id, "{}", message),
            TaskLogLevel::Error => error!(task_id = %self.id, "{}", message),
        }

        let entry = {
            let mut logs = self.logs.write();
            let entry = TaskLogEntry {
                sequence: logs.len() as u64 + 1,
                timestamp: Utc::now(),
                level,
                message,
            };
            logs.push(entry.clone());
            entry
        };
        self.state.write().touch();
        entry
    }

    /// Finish the task. Unprocessed items are counted as failed so that
    /// `completed + failed == total`; slugs that never produced a result get a
    /// failure entry carrying `message`.
    pub fn finish(&self, status: TaskStatus, message: impl Into<String>) -> Result<(), TaskError> {
        let message = message.into();
        {
            let mut state = self.state.write();
            let from = state.status;
            if !status.is_terminal() || from == status || !from.can_transition_to(status) {
                return Err(TaskError::InvalidTransition { from, to: status });
            }
            self.finalize(&mut state, status, &message);
        }
        if status == TaskStatus::Failed {
            self.append_log(TaskLogLevel::Error, format!("Task failed: {}", message));
        }
        Ok(())
    }

    fn finalize(&self, state: &mut TaskState, status: TaskStatus, message: &str) {
        if self.task_type != TaskType::Build {
            for slug in &self.slugs {
                if !state.results.contains_key(slug) {
                    let reason = match status {
                        TaskStatus::Cancelled => "cancelled",
                        _ => message,
                    };
                    state
                        .results
                        .insert(slug.clone(), TaskResult::failure(slug.clone(), "pending", reason));
                }
            }
        }
        let processed = state.processed();
        if processed < state.total {
            state.failed += state.total - processed;
        }

        let now = Utc::now();
        state.status = status;
        state.message = message.to_string();
        state.current_slug = None;
        if status == TaskStatus::Completed {
            state.progress = 100;
        }
        state.completed_at = Some(now);
        state.updated_at = now;
    }

    /// Log entries with a sequence greater than `after`, at most `limit` of them.
    /// Without `after`, the newest `limit` entries.
    pub fn logs(&self, after: Option<u64>, limit: usize) -> Vec<TaskLogEntry> {
        let logs = self.logs.read();
        match after {
            Some(after) => logs
                .iter()
                .filter(|e| e.sequence > after)
                .take(limit)
                .cloned()
                .collect(),
            None => {
                let start = logs.len().saturating_sub(limit);
                logs[start..].to_vec()
            }
        }
    }

    pub fn log_count(&self) -> usize {
        self.logs.read().len()
    }

    pub fn result(&self, key: &str) -> Option<TaskResult> {
        self.state.read().results.get(key).cloned()
    }

    /// A consistent copy of the whole task.
    pub fn snapshot(&self) -> TaskSnapshot {
        let state = self.state.read();
        TaskSnapshot {
            id: self.id,
            task_type: self.task_type,
            status: state.status,
            progress: state.progress,
            message: state.message.clone(),
            slugs: self.slugs.clone(),
            current_slug: state.current_slug.clone(),
            total_slugs: state.total,
            completed_slugs: state.completed,
            failed_slugs: state.failed,
            created_at: self.created_at,
            started_at: state.started_at,
            updated_at: state.updated_at,
            completed_at: state.completed_at,
            results: state.results.values().cloned().collect(),
            metrics: state.metrics.clone(),
            build_state: self.build.clone(),
        }
    }
}

/// Immutable copy of a task at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    #[serde(rename = "taskId")]
    pub id: Uuid,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub progress: u8,
    pub message: String,
    pub slugs: Vec<String>,
    pub current_slug: Option<String>,
    pub total_slugs: usize,
    pub completed_slugs: usize,
    pub failed_slugs: usize,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Sorted by key
    pub results: Vec<TaskResult>,
    pub metrics: BTreeMap<String, serde_json::Value>,
    pub build_state: Option<BuildOptions>,
}

impl TaskSnapshot {
    pub fn slug(&self) -> Option<&str> {
        self.slugs.first().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn batch(slugs: &[&str]) -> ParserTask {
        ParserTask::new(TaskType::BatchParse, slugs.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn new_task_is_pending() {
        let task = batch(&["a", "b"]);
        let snap = task.snapshot();
        assert_eq!(snap.status, TaskStatus::Pending);
        assert_eq!(snap.message, "Task created");
        assert_eq!(snap.total_slugs, 2);
        assert_eq!(snap.progress, 0);
        assert!(snap.started_at.is_none());
    }

    #[test]
    fn progress_is_clamped() {
        let task = batch(&["a"]);
        task.set_progress(150);
        assert_eq!(task.progress(), 100);
        task.set_progress(-5);
        assert_eq!(task.progress(), 0);
        task.set_progress(42);
        assert_eq!(task.progress(), 42);
    }

    #[test]
    fn transition_graph() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(ImportingManga));
        assert!(Running.can_transition_to(ImportingManga));
        assert!(!Running.can_transition_to(ImportingChapters));
        assert!(Running.can_transition_to(Failed));
        assert!(ImportingManga.can_transition_to(ImportingChapters));
        assert!(!ImportingChapters.can_transition_to(ImportingManga));
        assert!(!ImportingChapters.can_transition_to(Running));
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(Running));
            assert!(terminal.can_transition_to(terminal));
        }
    }

    #[test]
    fn pending_cannot_jump_to_terminal() {
        let task = batch(&["a"]);
        let err = task.finish(TaskStatus::Completed, "done").unwrap_err();
        assert_eq!(
            err,
            TaskError::InvalidTransition {
                from: TaskStatus::Pending,
                to: TaskStatus::Completed
            }
        );
        assert_eq!(task.status(), TaskStatus::Pending);
    }

    #[test]
    fn status_never_regresses() {
        let task = batch(&["a"]);
        task.begin().unwrap();
        assert!(task.set_status(TaskStatus::ImportingManga).unwrap());
        assert!(!task.set_status(TaskStatus::ImportingManga).unwrap());
        assert!(task.set_status(TaskStatus::Running).is_err());
        assert!(task.begin().is_err());
        assert_eq!(task.status(), TaskStatus::ImportingManga);
    }

    #[test]
    fn finish_balances_counters() {
        let task = batch(&["a", "b", "c"]);
        task.begin().unwrap();
        task.record_success(TaskResult::success("a", "chapters"));
        task.finish(TaskStatus::Cancelled, "Cancelled by user").unwrap();

        let snap = task.snapshot();
        assert_eq!(snap.status, TaskStatus::Cancelled);
        assert_eq!(snap.completed_slugs, 1);
        assert_eq!(snap.failed_slugs, 2);
        assert_eq!(snap.results.len(), 3);
        assert_eq!(snap.results[1].error.as_deref(), Some("cancelled"));
        assert!(snap.completed_at.is_some());
        assert_eq!(snap.current_slug, None);
    }

    #[test]
    fn completed_sets_full_progress_and_failed_logs() {
        let ok = batch(&["a"]);
        ok.begin().unwrap();
        ok.record_success(TaskResult::success("a", "chapters"));
        ok.finish(TaskStatus::Completed, "done").unwrap();
        assert_eq!(ok.progress(), 100);
        assert!(ok.finish(TaskStatus::Failed, "again").is_err());

        let bad = batch(&["a"]);
        bad.begin().unwrap();
        bad.finish(TaskStatus::Failed, "boom").unwrap();
        let last = bad.logs(None, 1).pop().unwrap();
        assert_eq!(last.message, "Task failed: boom");
        assert_eq!(last.level, TaskLogLevel::Error);
    }

    #[test]
    fn counters_never_exceed_total() {
        let task = ParserTask::new(TaskType::Build, vec!["a".into()]);
        task.begin().unwrap();
        task.set_total(2);
        task.record_success(TaskResult::success("1:1", "pages"));
        task.record_failure(TaskResult::failure("1:2", "pages", "404"));
        task.record_success(TaskResult::success("1:3", "pages"));
        let snap = task.snapshot();
        assert_eq!(snap.total_slugs, 3);
        task.set_total(1);
        assert_eq!(task.snapshot().total_slugs, 3);
    }

    #[test]
    fn cancel_if_pending_only_once() {
        let task = batch(&["a"]);
        assert!(task.cancel_if_pending("Cancelled before start"));
        assert_eq!(task.status(), TaskStatus::Cancelled);
        assert_eq!(task.snapshot().failed_slugs, 1);
        assert!(!task.cancel_if_pending("again"));

        let running = batch(&["a"]);
        running.begin().unwrap();
        assert!(!running.cancel_if_pending("late"));
    }

    #[test]
    fn log_sequence_contiguous_under_concurrency() {
        let task = Arc::new(batch(&["a"]));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let task = task.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        task.append_log(TaskLogLevel::Info, format!("{}-{}", t, i));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let logs = task.logs(Some(0), usize::MAX);
        assert_eq!(logs.len(), 800);
        for (i, entry) in logs.iter().enumerate() {
            assert_eq!(entry.sequence, i as u64 + 1);
        }
    }

    #[test]
    fn log_tail_and_after() {
        let task = batch(&["a"]);
        for i in 0..10 {
            task.append_log(TaskLogLevel::Info, format!("line {}", i));
        }
        let tail = task.logs(None, 3);
        assert_eq!(tail.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![8, 9, 10]);
        let after = task.logs(Some(4), 2);
        assert_eq!(after.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![5, 6]);
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let task = ParserTask::new(TaskType::Build, vec!["solo".into()]).with_build_options(BuildOptions {
            parser: "mangalib".into(),
            build_type: Some("AUTO".into()),
            branch_id: Some(12),
            auto_import: true,
            selector: ChapterSelector::new(vec!["5".to_string()], Vec::new()),
        });
        let json = serde_json::to_value(task.snapshot()).unwrap();
        assert_eq!(json["type"], "BUILD");
        assert_eq!(json["status"], "PENDING");
        assert_eq!(json["totalSlugs"], 1);
        assert_eq!(json["buildState"]["branchId"], 12);
        assert_eq!(json["buildState"]["chapterIds"][0], "5");
        assert!(json["taskId"].is_string());
    }
}
