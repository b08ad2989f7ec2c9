//! HTTP API Server
//!
//! Axum-based HTTP server for the parser REST API.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::http::Method;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::HttpConfig;

use super::handlers::AppState;
use super::routes::create_router;

/// HTTP API server
pub struct HttpServer {
    config: HttpConfig,
    state: AppState,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: HttpConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Run the HTTP server
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let addr: SocketAddr = self
            .config
            .listen_addr
            .parse()
            .context("Invalid HTTP listen address")?;

        let mut app = create_router(self.state.clone());

        if self.config.cors_enabled {
            let cors = CorsLayer::new()
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers(Any)
                .allow_origin(Any);
            app = app.layer(cors);
        }

        app = app.layer(TraceLayer::new_for_http());

        let listener = TcpListener::bind(&addr)
            .await
            .context("Failed to bind HTTP server")?;

        info!("HTTP API server listening on http://{}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                info!("HTTP server shutting down");
            })
            .await
            .context("HTTP server error")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::daemon::build_orchestrator;
    use std::time::Duration;

    #[tokio::test]
    async fn run_validates_addr_and_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.base_path = dir.path().join("output");
        config.storage.temp_path = dir.path().join("temp");
        config.proxy.enabled = false;
        let (orchestrator, _) = build_orchestrator(&config).unwrap();
        let state = AppState::new(orchestrator.clone());
        let (tx, _) = broadcast::channel(1);

        let bad = HttpServer::new(
            HttpConfig {
                listen_addr: "not-an-addr".to_string(),
                ..HttpConfig::default()
            },
            state.clone(),
        );
        let err = bad.run(tx.subscribe()).await.unwrap_err();
        assert!(err.to_string().contains("Invalid HTTP listen address"));

        let server = HttpServer::new(
            HttpConfig {
                listen_addr: "127.0.0.1:0".to_string(),
                cors_enabled: true,
                ..HttpConfig::default()
            },
            state,
        );
        let rx = tx.subscribe();
        let handle = tokio::spawn(async move { server.run(rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(result.is_ok());
        orchestrator.shutdown().await;
    }
}
