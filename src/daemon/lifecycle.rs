//! Daemon Lifecycle Management
//!
//! Wires configuration into the orchestrator, runs the HTTP server, and
//! handles signal-driven shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::scraping::fetcher::ClientFactory;
use crate::scraping::proxy::ProxyManager;
use crate::scraping::source::{MangaLibAdapter, SourceRegistry};

use super::collaborators::Collaborators;
use super::http::{AppState, HttpServer};
use super::jobs::{TaskEnvironment, TaskOrchestrator};
use super::metrics::OrchestratorMetrics;

/// Build the orchestrator and everything it depends on from configuration.
///
/// Shared by the daemon and the one-shot CLI commands.
pub fn build_orchestrator(config: &Config) -> Result<(Arc<TaskOrchestrator>, Arc<ProxyManager>)> {
    for dir in [&config.storage.base_path, &config.storage.temp_path] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create storage directory {}", dir.display()))?;
    }

    let proxies = Arc::new(ProxyManager::from_config(&config.proxy));
    let clients = Arc::new(ClientFactory::from_config(config, proxies.clone()));
    let sources = SourceRegistry::new().with(Arc::new(MangaLibAdapter::new(config.sources.mangalib.clone())));
    let collaborators = Collaborators::http(config).context("Failed to create collaborator clients")?;

    let env = TaskEnvironment {
        sources,
        clients,
        collaborators,
        storage: config.storage.clone(),
        metrics: OrchestratorMetrics::shared(),
        settings: config.orchestrator.clone(),
    };

    Ok((Arc::new(TaskOrchestrator::new(env)), proxies))
}

/// Daemon instance managing all components
pub struct Daemon {
    config: Config,
    orchestrator: Arc<TaskOrchestrator>,
    proxies: Arc<ProxyManager>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Daemon {
    /// Start the daemon
    pub async fn start(config: Config) -> Result<Self> {
        info!("Starting manga parser daemon");

        let (orchestrator, proxies) = build_orchestrator(&config)?;
        let (shutdown_tx, _) = broadcast::channel(16);

        info!("Daemon initialized");
        info!("Output directory: {}", config.storage.base_path.display());
        info!("Temp directory: {}", config.storage.temp_path.display());
        info!(
            "Legacy tool: {} (root {})",
            config.legacy.command,
            config.legacy.root.display()
        );
        info!(
            "Parsers: {}, max concurrent tasks: {}",
            orchestrator.environment().sources.names().join(", "),
            config.orchestrator.max_concurrent_tasks
        );

        Ok(Self {
            config,
            orchestrator,
            proxies,
            shutdown_tx,
        })
    }

    /// Run the daemon until a signal or shutdown request arrives
    pub async fn run(&self) -> Result<()> {
        info!("Daemon running");

        let shutdown_rx = self.shutdown_tx.subscribe();

        // Reload the proxy file on SIGHUP
        let proxies = self.proxies.clone();
        let mut shutdown_rx_reload = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = Self::wait_for_sighup() => {
                        match proxies.reload() {
                            Ok(count) => info!("Reloaded proxy pool ({} proxies)", count),
                            Err(e) => warn!("Proxy reload failed: {:#}", e),
                        }
                    }
                    _ = shutdown_rx_reload.recv() => break,
                }
            }
        });

        let http_handle = if self.config.http.enabled {
            let http_config = self.config.http.clone();
            let mut state = AppState::new(self.orchestrator.clone());
            state.metrics_enabled = self.config.metrics.enabled;
            let shutdown_rx_http = self.shutdown_tx.subscribe();

            info!("Starting HTTP API server on: {}", http_config.listen_addr);

            let http_server = HttpServer::new(http_config, state);
            let shutdown_tx = self.shutdown_tx.clone();
            Some(tokio::spawn(async move {
                match http_server.run(shutdown_rx_http).await {
                    Ok(()) => info!("HTTP server shut down cleanly"),
                    Err(e) => {
                        error!("HTTP server failed: {:#}", e);
                        let _ = shutdown_tx.send(());
                    }
                }
            }))
        } else {
            warn!("HTTP API disabled; the daemon will only run until interrupted");
            None
        };

        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
            }
            _ = Self::wait_for_sigterm() => {
                info!("Received SIGTERM, shutting down");
            }
            _ = Self::wait_for_shutdown(shutdown_rx) => {
                info!("Shutdown requested");
            }
        }

        let _ = self.shutdown_tx.send(());

        if let Some(http_handle) = http_handle {
            let http_abort = http_handle.abort_handle();
            if tokio::time::timeout(Duration::from_secs(5), http_handle).await.is_err() {
                warn!("HTTP server did not shut down within 5s, aborting");
                http_abort.abort();
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Cancel running work and wait for tasks to settle
    pub async fn shutdown(&self) {
        info!("Shutting down daemon");
        self.orchestrator.shutdown().await;
        info!("Daemon shutdown complete");
    }

    /// Ask a running daemon to stop
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub fn orchestrator(&self) -> Arc<TaskOrchestrator> {
        self.orchestrator.clone()
    }

    #[cfg(unix)]
    async fn wait_for_sigterm() {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {}. Falling back to pending future.", e);
                std::future::pending::<()>().await;
            }
        }
    }

    #[cfg(not(unix))]
    async fn wait_for_sigterm() {
        std::future::pending::<()>().await
    }

    #[cfg(unix)]
    async fn wait_for_sighup() {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::hangup()) {
            Ok(mut sighup) => {
                sighup.recv().await;
            }
            Err(e) => {
                warn!("Failed to register SIGHUP handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }

    #[cfg(not(unix))]
    async fn wait_for_sighup() {
        std::future::pending::<()>().await
    }

    async fn wait_for_shutdown(mut rx: broadcast::Receiver<()>) {
        let _ = rx.recv().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.storage.base_path = dir.path().join("output");
        config.storage.temp_path = dir.path().join("temp");
        config.storage.logs_path = dir.path().join("logs");
        config.proxy.enabled = false;
        config.http.enabled = false;
        config
    }

    #[tokio::test]
    async fn build_orchestrator_creates_storage_dirs() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (orchestrator, proxies) = build_orchestrator(&config).unwrap();

        assert!(config.storage.base_path.is_dir());
        assert!(config.storage.temp_path.is_dir());
        assert_eq!(orchestrator.environment().sources.names(), vec!["mangalib".to_string()]);
        assert!(proxies.proxies().is_empty());
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn run_returns_after_shutdown_request() {
        let dir = TempDir::new().unwrap();
        let daemon = Arc::new(Daemon::start(test_config(&dir)).await.unwrap());

        let runner = daemon.clone();
        let handle = tokio::spawn(async move { runner.run().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        daemon.request_shutdown();

        let result = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
