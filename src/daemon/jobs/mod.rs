//! Task orchestration
//!
//! Submissions register a `PENDING` task and return its id at once. A single
//! dispatcher drains the submission queue in FIFO order and starts each task
//! as soon as one of `max_concurrent_tasks` permits is free, so excess work
//! waits instead of being rejected.

mod build;
mod context;
mod parse;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{OrchestratorConfig, StorageConfig};
use crate::scraping::fetcher::ClientFactory;
use crate::scraping::source::{is_safe_slug, ChapterSelector, SourceAdapter, SourceRegistry, DEFAULT_PARSER};
use crate::task::{
    BuildOptions, ParserTask, TaskLogEntry, TaskLogLevel, TaskRepository, TaskSnapshot, TaskStatus, TaskType,
};

use super::broadcaster::{ProgressBroadcaster, Subscription};
use super::collaborators::Collaborators;
use super::events::ProgressEvent;
use super::metrics::{OrchestratorMetrics, Timer};

pub use build::BuildExecutor;
pub use context::TaskContext;
pub use parse::ParseExecutor;

/// How long shutdown waits for running tasks to reach an item boundary
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Errors returned to callers of the orchestrator
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("Unsupported parser: {0}")]
    UnsupportedParser(String),
    #[error("{0}")]
    InvalidRequest(String),
    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),
    #[error("Task {0} has already finished")]
    AlreadyFinished(Uuid),
    #[error("Orchestrator is shutting down")]
    ShuttingDown,
}

/// How an executor ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed(String),
    Failed(String),
    Cancelled,
}

/// One executor per task type.
///
/// Per-item failures are recorded on the task and never returned; an `Err`
/// means the task could not run at all and fails it as a whole.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, ctx: &TaskContext) -> anyhow::Result<TaskOutcome>;
}

/// Everything an executor needs besides the task itself
pub struct TaskEnvironment {
    pub sources: SourceRegistry,
    pub clients: Arc<ClientFactory>,
    pub collaborators: Collaborators,
    pub storage: StorageConfig,
    pub metrics: Arc<OrchestratorMetrics>,
    pub settings: OrchestratorConfig,
}

/// A build submission
#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    pub slug: String,
    pub parser: Option<String>,
    pub build_type: Option<String>,
    pub branch_id: Option<i64>,
    pub auto_import: bool,
    pub chapter_ids: Vec<String>,
    pub chapter_keys: Vec<String>,
}

struct QueuedTask {
    task: Arc<ParserTask>,
    executor: Box<dyn TaskExecutor>,
}

struct Shared {
    repository: Arc<TaskRepository>,
    broadcaster: ProgressBroadcaster,
    env: Arc<TaskEnvironment>,
    tokens: DashMap<Uuid, CancellationToken>,
    root: CancellationToken,
    tracker: TaskTracker,
}

/// Accepts parse, batch, and build requests and runs them on a bounded pool
pub struct TaskOrchestrator {
    shared: Arc<Shared>,
    queue: mpsc::UnboundedSender<QueuedTask>,
}

impl TaskOrchestrator {
    /// Create the orchestrator and start its dispatcher. Must be called from
    /// within a Tokio runtime.
    pub fn new(env: TaskEnvironment) -> Self {
        let permits = env.settings.max_concurrent_tasks.max(1);
        let shared = Arc::new(Shared {
            repository: Arc::new(TaskRepository::new()),
            broadcaster: ProgressBroadcaster::new(),
            env: Arc::new(env),
            tokens: DashMap::new(),
            root: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });

        let (queue, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(rx, Arc::new(Semaphore::new(permits)), shared.clone()));
        info!("Task orchestrator started with {} workers", permits);

        Self { shared, queue }
    }

    pub fn repository(&self) -> Arc<TaskRepository> {
        self.shared.repository.clone()
    }

    pub fn broadcaster(&self) -> &ProgressBroadcaster {
        &self.shared.broadcaster
    }

    pub fn environment(&self) -> &TaskEnvironment {
        &self.shared.env
    }

    pub fn metrics(&self) -> Arc<OrchestratorMetrics> {
        self.shared.env.metrics.clone()
    }

    /// Queue a single-slug parse.
    pub fn submit_parse(&self, slug: &str, parser: Option<&str>, auto_import: bool) -> Result<Uuid, OrchestratorError> {
        self.ensure_running()?;
        let slug = require_slug(slug)?;
        let adapter = self.resolve_adapter(parser)?;

        let task = ParserTask::new(TaskType::Parse, vec![slug.clone()]);
        let executor = ParseExecutor::new(adapter, vec![slug.clone()], auto_import, 1);
        self.enqueue(task, Box::new(executor), format!("Parse queued ({})", slug))
    }

    /// Queue a batch parse. Slugs are trimmed and de-duplicated in order.
    pub fn submit_batch_parse(
        &self,
        slugs: Vec<String>,
        parser: Option<&str>,
        auto_import: bool,
    ) -> Result<Uuid, OrchestratorError> {
        self.ensure_running()?;
        let mut unique: Vec<String> = Vec::with_capacity(slugs.len());
        for slug in slugs {
            if slug.trim().is_empty() {
                continue;
            }
            let slug = require_slug(&slug)?;
            if !unique.contains(&slug) {
                unique.push(slug);
            }
        }
        if unique.is_empty() {
            return Err(OrchestratorError::InvalidRequest("slugs must not be empty".to_string()));
        }
        let adapter = self.resolve_adapter(parser)?;

        let count = unique.len();
        let concurrency = self.shared.env.settings.max_concurrent_tasks.max(1);
        let task = ParserTask::new(TaskType::BatchParse, unique.clone());
        let executor = ParseExecutor::new(adapter, unique, auto_import, concurrency);
        self.enqueue(task, Box::new(executor), format!("Batch task queued ({} slugs)", count))
    }

    /// Queue a build of one title.
    pub fn submit_build(&self, request: BuildRequest) -> Result<Uuid, OrchestratorError> {
        self.ensure_running()?;
        let slug = require_slug(&request.slug)?;
        let build_type = request
            .build_type
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .ok_or_else(|| OrchestratorError::InvalidRequest("type is required".to_string()))?;
        let adapter = self.resolve_adapter(request.parser.as_deref())?;

        let selector = ChapterSelector::new(request.chapter_ids, request.chapter_keys);
        let options = BuildOptions {
            parser: adapter.name().to_string(),
            build_type: Some(build_type.clone()),
            branch_id: request.branch_id,
            auto_import: request.auto_import,
            selector,
        };
        let task = ParserTask::new(TaskType::Build, vec![slug.clone()]).with_build_options(options.clone());
        if !options.selector.is_empty() {
            task.append_log(
                TaskLogLevel::Info,
                format!(
                    "Partial build configured: ids={}, keys={}",
                    options.selector.chapter_ids.len(),
                    options.selector.chapter_keys.len()
                ),
            );
        }
        let executor = BuildExecutor::new(adapter, slug, options);
        self.enqueue(task, Box::new(executor), format!("Build queued ({})", build_type))
    }

    fn ensure_running(&self) -> Result<(), OrchestratorError> {
        if self.shared.root.is_cancelled() {
            Err(OrchestratorError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    fn resolve_adapter(&self, parser: Option<&str>) -> Result<Arc<dyn SourceAdapter>, OrchestratorError> {
        self.shared.env.sources.resolve(parser).ok_or_else(|| {
            OrchestratorError::UnsupportedParser(parser.unwrap_or(DEFAULT_PARSER).trim().to_string())
        })
    }

    fn enqueue(
        &self,
        task: ParserTask,
        executor: Box<dyn TaskExecutor>,
        message: String,
    ) -> Result<Uuid, OrchestratorError> {
        let task = self.shared.repository.save(Arc::new(task));
        let id = task.id();
        task.set_message(message.clone());
        task.append_log(TaskLogLevel::Info, message);
        self.shared.tokens.insert(id, self.shared.root.child_token());

        let metrics = &self.shared.env.metrics;
        metrics.tasks_submitted.inc();
        metrics.queued_tasks.inc();

        if self.queue.send(QueuedTask { task: task.clone(), executor }).is_err() {
            metrics.queued_tasks.dec();
            self.shared.tokens.remove(&id);
            task.cancel_if_pending("Orchestrator is shutting down");
            return Err(OrchestratorError::ShuttingDown);
        }
        info!("Queued {} task {} for {} slug(s)", task.task_type(), id, task.slugs().len());
        Ok(id)
    }

    pub fn task(&self, id: &Uuid) -> Option<Arc<ParserTask>> {
        self.shared.repository.find_by_id(id)
    }

    pub fn get(&self, id: &Uuid) -> Option<TaskSnapshot> {
        self.task(id).map(|t| t.snapshot())
    }

    /// Snapshots of every task, newest first.
    pub fn list(&self) -> Vec<TaskSnapshot> {
        self.shared.repository.find_all().iter().map(|t| t.snapshot()).collect()
    }

    /// Log lines after sequence `after`, or the newest ones when `after` is absent.
    pub fn logs(&self, id: &Uuid, after: Option<u64>, limit: Option<usize>) -> Result<Vec<TaskLogEntry>, OrchestratorError> {
        let task = self.task(id).ok_or(OrchestratorError::TaskNotFound(*id))?;
        let limit = limit.unwrap_or(self.shared.env.settings.log_tail_limit).max(1);
        Ok(task.logs(after, limit))
    }

    /// Cancel a queued or running task.
    pub fn cancel(&self, id: &Uuid) -> Result<TaskSnapshot, OrchestratorError> {
        let task = self.task(id).ok_or(OrchestratorError::TaskNotFound(*id))?;
        if task.is_terminal() {
            return Err(OrchestratorError::AlreadyFinished(*id));
        }

        if task.cancel_if_pending("Cancelled before start") {
            info!("Task {} cancelled while queued", id);
            self.shared.tokens.remove(id);
            self.shared.env.metrics.tasks_cancelled.inc();
            announce_finished(&self.shared.broadcaster, &task);
        } else if let Some(token) = self.shared.tokens.get(id) {
            token.cancel();
            let entry = task.append_log(TaskLogLevel::Warn, "Cancellation requested");
            self.shared.broadcaster.publish(ProgressEvent::log(*id, &entry));
        } else if task.is_terminal() {
            return Err(OrchestratorError::AlreadyFinished(*id));
        }
        Ok(task.snapshot())
    }

    /// Remove every finished task and return the removed ids.
    pub fn clear_finished(&self) -> Vec<Uuid> {
        let removed = self.shared.repository.remove_finished();
        for id in &removed {
            self.shared.tokens.remove(id);
            self.shared.broadcaster.close(*id);
        }
        if !removed.is_empty() {
            info!("Cleared {} finished tasks", removed.len());
        }
        removed
    }

    /// Subscribe to a task's events. A finished task yields its `completed`
    /// event and then ends.
    pub fn subscribe(&self, id: &Uuid) -> Result<Subscription, OrchestratorError> {
        let task = self.task(id).ok_or(OrchestratorError::TaskNotFound(*id))?;
        let subscription = self.shared.broadcaster.subscribe(*id);
        if task.is_terminal() {
            announce_finished(&self.shared.broadcaster, &task);
        }
        Ok(subscription)
    }

    /// Wait until a task reaches a terminal state.
    pub async fn wait_for(&self, id: &Uuid) -> Result<TaskSnapshot, OrchestratorError> {
        loop {
            let mut subscription = self.subscribe(id)?;
            while subscription.recv().await.is_some() {}
            let snapshot = self.get(id).ok_or(OrchestratorError::TaskNotFound(*id))?;
            if snapshot.status.is_terminal() {
                return Ok(snapshot);
            }
        }
    }

    /// Stop accepting work, cancel queued and running tasks, and wait briefly
    /// for workers to wind down.
    pub async fn shutdown(&self) {
        info!("Shutting down task orchestrator");
        self.shared.root.cancel();
        for task in self.shared.repository.find_all() {
            if task.cancel_if_pending("Cancelled by shutdown") {
                self.shared.env.metrics.tasks_cancelled.inc();
                announce_finished(&self.shared.broadcaster, &task);
            }
        }
        self.shared.tracker.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.shared.tracker.wait()).await.is_err() {
            warn!("Running tasks did not stop within {:?}", SHUTDOWN_GRACE);
        }
    }
}

/// Trim a slug and reject anything that could leave the storage directory or
/// alter an API path.
pub(crate) fn require_slug(slug: &str) -> Result<String, OrchestratorError> {
    let slug = slug.trim();
    if slug.is_empty() {
        Err(OrchestratorError::InvalidRequest("slug is required".to_string()))
    } else if !is_safe_slug(slug) {
        Err(OrchestratorError::InvalidRequest(format!("invalid slug: {}", slug)))
    } else {
        Ok(slug.to_string())
    }
}

/// Push the final progress and `completed` events, then close the channels.
fn announce_finished(broadcaster: &ProgressBroadcaster, task: &ParserTask) {
    let snapshot = task.snapshot();
    broadcaster.publish(ProgressEvent::progress(&snapshot));
    broadcaster.publish(ProgressEvent::completed(&snapshot));
    broadcaster.close(snapshot.id);
}

async fn dispatch(mut rx: mpsc::UnboundedReceiver<QueuedTask>, permits: Arc<Semaphore>, shared: Arc<Shared>) {
    loop {
        let job = tokio::select! {
            biased;
            _ = shared.root.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let permit = tokio::select! {
            biased;
            _ = shared.root.cancelled() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        shared.env.metrics.queued_tasks.dec();

        if job.task.is_terminal() {
            debug!("Skipping task {} finished while queued", job.task.id());
            continue;
        }

        let worker = shared.clone();
        shared.tracker.spawn(async move {
            run_task(worker, job).await;
            drop(permit);
        });
    }
    debug!("Task dispatcher stopped");
}

async fn run_task(shared: Arc<Shared>, job: QueuedTask) {
    let QueuedTask { task, executor } = job;
    let id = task.id();
    if task.begin().is_err() {
        debug!("Task {} was no longer pending", id);
        return;
    }

    let metrics = shared.env.metrics.clone();
    metrics.active_tasks.inc();
    let timer = Timer::start();

    let token = shared
        .tokens
        .get(&id)
        .map(|t| t.clone())
        .unwrap_or_else(|| shared.root.child_token());
    let ctx = TaskContext::new(task.clone(), shared.broadcaster.clone(), shared.env.clone(), token)
        .with_webhook(&shared.tracker);
    ctx.info(format!("Task started ({})", task.task_type()));
    ctx.publish_progress();

    let outcome = if ctx.is_cancelled() {
        Ok(TaskOutcome::Cancelled)
    } else {
        executor.execute(&ctx).await
    };
    let (status, message) = match outcome {
        Ok(TaskOutcome::Completed(message)) => (TaskStatus::Completed, message),
        Ok(TaskOutcome::Failed(message)) => (TaskStatus::Failed, message),
        Ok(TaskOutcome::Cancelled) => (TaskStatus::Cancelled, "Task cancelled".to_string()),
        Err(e) => (TaskStatus::Failed, format!("{:#}", e)),
    };
    ctx.finish(status, message);

    let snapshot = task.snapshot();
    match snapshot.status {
        TaskStatus::Completed => metrics.tasks_completed.inc(),
        TaskStatus::Failed => metrics.tasks_failed.inc(),
        TaskStatus::Cancelled => metrics.tasks_cancelled.inc(),
        _ => {}
    }
    metrics.items_completed.add(snapshot.completed_slugs as u64);
    metrics.items_failed.add(snapshot.failed_slugs as u64);
    let elapsed = timer.record(&metrics.task_duration);
    metrics.active_tasks.dec();
    shared.tokens.remove(&id);

    info!(
        "Task {} finished as {} in {:.1}s ({} ok, {} failed)",
        id,
        snapshot.status,
        elapsed.as_secs_f64(),
        snapshot.completed_slugs,
        snapshot.failed_slugs
    );
}

/// Write `data` to `target` through a temporary file so readers never see a
/// partial file.
pub(crate) async fn write_atomic(temp_dir: &Path, target: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::create_dir_all(temp_dir).await?;
    let temp = temp_dir.join(format!("{}.part", Uuid::new_v4()));
    tokio::fs::write(&temp, data).await?;

    if tokio::fs::rename(&temp, target).await.is_err() {
        // temp and target may sit on different filesystems
        let copied = tokio::fs::copy(&temp, target).await;
        let _ = tokio::fs::remove_file(&temp).await;
        copied?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_atomic_creates_parents_and_cleans_temp() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("tmp");
        let target = dir.path().join("out/archives/solo/ch_1.0/001.jpg");

        write_atomic(&temp, &target, b"jpeg").await.unwrap();
        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"jpeg");
        assert_eq!(std::fs::read_dir(&temp).unwrap().count(), 0);

        write_atomic(&temp, &target, b"newer").await.unwrap();
        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"newer");
    }

    #[test]
    fn slug_is_required() {
        assert_eq!(require_slug("  solo ").unwrap(), "solo");
        assert_eq!(
            require_slug("   ").unwrap_err(),
            OrchestratorError::InvalidRequest("slug is required".to_string())
        );
    }

    #[test]
    fn slug_cannot_escape_storage() {
        for slug in ["../../escaped", "a/b", "..", "/tmp/abs", "C:\\x", "a?b", "a#b", "a%2F", "a\nb"] {
            assert!(
                matches!(require_slug(slug), Err(OrchestratorError::InvalidRequest(_))),
                "accepted {:?}",
                slug
            );
        }
        assert_eq!(require_slug("7580--solo-leveling").unwrap(), "7580--solo-leveling");
    }
}
