//! Executor-facing handle on a running task
//!
//! Every mutation goes through here so that it is mirrored to subscribers and,
//! when enabled, to the progress webhook.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use uuid::Uuid;

use crate::daemon::broadcaster::ProgressBroadcaster;
use crate::daemon::collaborators::{CatalogService, ProgressReport};
use crate::daemon::events::ProgressEvent;
use crate::task::{ParserTask, TaskError, TaskLogLevel, TaskResult, TaskStatus};

use super::TaskEnvironment;

pub struct TaskContext {
    task: Arc<ParserTask>,
    broadcaster: ProgressBroadcaster,
    env: Arc<TaskEnvironment>,
    cancel: CancellationToken,
    webhook: Option<watch::Sender<Option<ProgressReport>>>,
}

impl TaskContext {
    pub fn new(
        task: Arc<ParserTask>,
        broadcaster: ProgressBroadcaster,
        env: Arc<TaskEnvironment>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            task,
            broadcaster,
            env,
            cancel,
            webhook: None,
        }
    }

    /// Send progress reports to the catalog webhook from a single worker so
    /// they arrive in order. Reports queued behind a slow request collapse
    /// into the newest one; the worker ends after delivering the last report
    /// once the context is dropped.
    pub fn with_webhook(mut self, tracker: &TaskTracker) -> Self {
        if self.env.settings.progress_webhook_enabled {
            let (tx, rx) = watch::channel(None);
            tracker.spawn(forward_reports(self.env.collaborators.catalog.clone(), self.task.id(), rx));
            self.webhook = Some(tx);
        }
        self
    }

    pub fn id(&self) -> Uuid {
        self.task.id()
    }

    pub fn env(&self) -> &TaskEnvironment {
        &self.env
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run `fut` unless the task is cancelled first; `None` on cancellation.
    pub async fn cancellable<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            out = fut => Some(out),
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(TaskLogLevel::Info, message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(TaskLogLevel::Warn, message.into());
    }

    fn log(&self, level: TaskLogLevel, message: String) {
        let entry = self.task.append_log(level, message);
        self.broadcaster.publish(ProgressEvent::log(self.task.id(), &entry));
    }

    pub fn set_status(&self, status: TaskStatus) -> Result<(), TaskError> {
        if self.task.set_status(status)? {
            self.info(format!("Status changed to {}", status));
            self.publish_progress();
        }
        Ok(())
    }

    pub fn set_progress(&self, progress: i64) {
        self.task.set_progress(progress);
        self.publish_progress();
    }

    pub fn set_message(&self, message: impl Into<String>) {
        self.task.set_message(message);
        self.publish_progress();
    }

    pub fn set_current_slug(&self, slug: Option<&str>) {
        self.task.set_current_slug(slug.map(str::to_string));
    }

    pub fn set_total(&self, total: usize) {
        self.task.set_total(total);
        self.publish_progress();
    }

    pub fn record_success(&self, result: TaskResult) {
        self.task.record_success(result);
        self.publish_progress();
    }

    pub fn record_failure(&self, result: TaskResult) {
        self.task.record_failure(result);
        self.publish_progress();
    }

    pub fn update_result(&self, key: &str, f: impl FnOnce(&mut TaskResult)) {
        self.task.update_result(key, f);
    }

    pub fn put_metric(&self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.task.put_metric(key, value);
    }

    /// Push the current state to subscribers and the webhook.
    pub fn publish_progress(&self) {
        let snapshot = self.task.snapshot();
        self.broadcaster.publish(ProgressEvent::progress(&snapshot));

        let Some(webhook) = &self.webhook else {
            return;
        };
        let report = ProgressReport {
            status: snapshot.status.to_string(),
            progress: snapshot.progress,
            message: snapshot.message.clone(),
            error: match snapshot.status {
                TaskStatus::Failed => Some(snapshot.message.clone()),
                _ => None,
            },
        };
        webhook.send_replace(Some(report));
    }

    /// Move to a terminal state and notify subscribers, closing their channels.
    pub(super) fn finish(&self, status: TaskStatus, message: String) {
        let logged = self.task.log_count() as u64;
        if let Err(e) = self.task.finish(status, message) {
            debug!("Task {} already finished: {}", self.task.id(), e);
            return;
        }
        for entry in self.task.logs(Some(logged), usize::MAX) {
            self.broadcaster.publish(ProgressEvent::log(self.task.id(), &entry));
        }
        self.publish_progress();

        let snapshot = self.task.snapshot();
        self.broadcaster.publish(ProgressEvent::completed(&snapshot));
        self.broadcaster.close(snapshot.id);
    }
}

async fn forward_reports(
    catalog: Arc<dyn CatalogService>,
    task_id: Uuid,
    mut reports: watch::Receiver<Option<ProgressReport>>,
) {
    let task_id = task_id.to_string();
    while reports.changed().await.is_ok() {
        let latest = reports.borrow_and_update().clone();
        let Some(report) = latest else {
            continue;
        };
        if let Err(e) = catalog.report_progress(&task_id, &report).await {
            debug!("Progress webhook for {} failed: {}", task_id, e);
        }
    }
}
