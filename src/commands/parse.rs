use anyhow::{Context, Result};
use manga_parser::{
    config::Config,
    daemon::{build_orchestrator, ProgressEvent},
    task::TaskStatus,
};
use tracing::info;

/// Parse one or more slugs without starting the HTTP server, printing the
/// task log as it happens and the final snapshot as JSON.
pub async fn run_parse(config: Config, slugs: Vec<String>, parser: Option<String>, auto_import: bool) -> Result<()> {
    let (orchestrator, _proxies) = build_orchestrator(&config)?;

    let task_id = if slugs.len() == 1 {
        orchestrator.submit_parse(&slugs[0], parser.as_deref(), auto_import)?
    } else {
        orchestrator.submit_batch_parse(slugs, parser.as_deref(), auto_import)?
    };
    info!("Submitted task {}", task_id);

    let mut subscription = orchestrator.subscribe(&task_id)?;
    while let Some(event) = subscription.recv().await {
        match event {
            ProgressEvent::Log { level, message, .. } => eprintln!("[{}] {}", level, message),
            ProgressEvent::Completed { .. } => break,
            ProgressEvent::Progress { .. } => {}
        }
    }

    let snapshot = orchestrator.wait_for(&task_id).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&snapshot).context("Failed to serialize task")?
    );
    orchestrator.shutdown().await;

    if snapshot.status == TaskStatus::Completed {
        Ok(())
    } else {
        anyhow::bail!("Task {} finished with status {}: {}", task_id, snapshot.status, snapshot.message)
    }
}
