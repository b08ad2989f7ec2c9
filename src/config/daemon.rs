//! Orchestrator, HTTP API, and metrics configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Task orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Number of task bodies allowed to run at once; extra submissions queue
    pub max_concurrent_tasks: usize,
    /// Upper bound for one network operation including its retries
    pub command_timeout_secs: u64,
    /// POST progress updates to the catalog service
    pub progress_webhook_enabled: bool,
    /// Number of log lines included in a status response
    pub log_tail_limit: usize,
}

impl OrchestratorConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 2,
            command_timeout_secs: 30 * 60,
            progress_webhook_enabled: true,
            log_tail_limit: 200,
        }
    }
}

/// HTTP API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Enable HTTP API server
    pub enabled: bool,
    /// Listen address for HTTP server (e.g., "0.0.0.0:8084")
    pub listen_addr: String,
    /// Enable CORS (useful for browser-based clients)
    pub cors_enabled: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "0.0.0.0:8084".to_string(),
            cors_enabled: false,
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable Prometheus /metrics endpoint
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}
