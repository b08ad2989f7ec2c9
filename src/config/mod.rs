//! Configuration for the parser service

mod daemon;
mod logging;
mod scraping;
mod storage;

pub use daemon::{HttpConfig, MetricsConfig, OrchestratorConfig};
pub use logging::{LogFormat, LogLevel, LoggingConfig};
pub use scraping::{HttpClientConfig, MangaLibConfig, ProxyConfig, RetryConfig, SourcesConfig};
pub use storage::{LegacyConfig, ServicesConfig, StorageConfig};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default user agent for outbound scraping requests
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Main configuration for the parser service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Storage layout
    #[serde(default)]
    pub storage: StorageConfig,
    /// Legacy tool invocation
    #[serde(default)]
    pub legacy: LegacyConfig,
    /// Task orchestration
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Retry and backoff for outbound requests
    #[serde(default)]
    pub retry: RetryConfig,
    /// Outbound HTTP client settings
    #[serde(default)]
    pub http_client: HttpClientConfig,
    /// Egress proxy pool
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// Source site settings
    #[serde(default)]
    pub sources: SourcesConfig,
    /// Collaborator service URLs
    #[serde(default)]
    pub services: ServicesConfig,
    /// HTTP API server configuration
    #[serde(default)]
    pub http: HttpConfig,
    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file and validate it.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file '{}': {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Load the file when it exists, otherwise fall back to validated defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Validate all configuration fields.
    ///
    /// Collects all validation errors and reports them together.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        // Orchestrator validation
        if self.orchestrator.max_concurrent_tasks == 0 {
            errors.push("max_concurrent_tasks must be positive".to_string());
        }
        if self.orchestrator.command_timeout_secs == 0 {
            errors.push("command_timeout_secs must be positive".to_string());
        }

        // Retry validation
        let retry = &self.retry;
        if retry.max_attempts == 0 {
            errors.push("retry max_attempts must be positive".to_string());
        }
        if retry.backoff_factor < 1.0 {
            errors.push("retry backoff_factor must be >= 1.0".to_string());
        }
        if retry.jitter_min <= 0.0 || retry.jitter_min > retry.jitter_max {
            errors.push("retry jitter must satisfy 0 < jitter_min <= jitter_max".to_string());
        }
        if retry.initial_delay_ms > retry.max_delay_ms {
            errors.push("retry initial_delay_ms must be <= max_delay_ms".to_string());
        }

        // HTTP client validation
        if self.http_client.request_timeout_ms == 0 {
            errors.push("request_timeout_ms must be positive".to_string());
        }
        if self.http_client.request_timeout_ms / 1000 > self.orchestrator.command_timeout_secs {
            errors.push("request_timeout_ms must not exceed command_timeout_secs".to_string());
        }

        // Proxy validation
        for proxy in &self.proxy.servers {
            if proxy.host.trim().is_empty() {
                errors.push("proxy host must not be empty".to_string());
            }
            if proxy.port == 0 {
                errors.push(format!("proxy {} has port 0", proxy.host));
            }
        }

        // Service URL validation
        for (name, value) in [
            ("manga_service_url", &self.services.manga_service_url),
            ("chapter_service_url", &self.services.chapter_service_url),
            ("image_storage_url", &self.services.image_storage_url),
            ("mangalib api_base", &self.sources.mangalib.api_base),
        ] {
            if url::Url::parse(value).is_err() {
                errors.push(format!("{} is not a valid URL: '{}'", name, value));
            }
        }

        // Legacy tool validation
        if self.legacy.command.trim().is_empty() {
            errors.push("legacy command must not be empty".to_string());
        }

        // HTTP config validation
        if self.http.enabled && !self.http.listen_addr.is_empty() {
            if let Some(port_str) = self.http.listen_addr.rsplit(':').next() {
                if let Ok(port) = port_str.parse::<u32>() {
                    if port == 0 || port > 65535 {
                        errors.push(format!(
                            "HTTP listen port must be between 1 and 65535, got {}",
                            port
                        ));
                    }
                }
            }
        }

        // Storage validation
        if self.storage.base_path.as_os_str().is_empty() {
            errors.push("storage base_path must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scraping::proxy::ProxyServer;
    use std::path::PathBuf;

    // ========================================================================
    // Helper: build a valid default config for mutation-based testing
    // ========================================================================

    fn valid_config() -> Config {
        Config::default()
    }

    // ========================================================================
    // Config::validate – happy path
    // ========================================================================

    #[test]
    fn default_config_passes_validation() {
        let cfg = valid_config();
        assert!(cfg.validate().is_ok(), "default config should be valid");
    }

    #[test]
    fn defaults_match_service_properties() {
        let cfg = valid_config();
        assert_eq!(cfg.orchestrator.max_concurrent_tasks, 2);
        assert_eq!(cfg.orchestrator.command_timeout_secs, 1800);
        assert!(cfg.orchestrator.progress_webhook_enabled);
        assert!(cfg.proxy.enabled);
        assert_eq!(cfg.storage.base_path, PathBuf::from("/app/output"));
        assert_eq!(cfg.legacy.command, "python3");
        assert_eq!(cfg.services.manga_service_url, "http://manga-service:8081");
        assert_eq!(cfg.sources.mangalib.site_id, "1");
    }

    // ========================================================================
    // Config::validate – orchestrator errors
    // ========================================================================

    #[test]
    fn validate_rejects_zero_concurrency() {
        let mut cfg = valid_config();
        cfg.orchestrator.max_concurrent_tasks = 0;
        let err = cfg.validate().unwrap_err();
        assert!(
            err.to_string().contains("max_concurrent_tasks must be positive"),
            "unexpected error message: {}",
            err
        );
    }

    #[test]
    fn validate_rejects_zero_command_timeout() {
        let mut cfg = valid_config();
        cfg.orchestrator.command_timeout_secs = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("command_timeout_secs must be positive"));
    }

    #[test]
    fn validate_rejects_request_timeout_above_command_timeout() {
        let mut cfg = valid_config();
        cfg.orchestrator.command_timeout_secs = 5;
        cfg.http_client.request_timeout_ms = 60_000;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("must not exceed command_timeout_secs"));
    }

    // ========================================================================
    // Config::validate – retry errors
    // ========================================================================

    #[test]
    fn validate_rejects_zero_attempts() {
        let mut cfg = valid_config();
        cfg.retry.max_attempts = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("max_attempts must be positive"));
    }

    #[test]
    fn validate_rejects_inverted_jitter() {
        let mut cfg = valid_config();
        cfg.retry.jitter_min = 1.5;
        cfg.retry.jitter_max = 1.0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("jitter_min <= jitter_max"));
    }

    #[test]
    fn validate_rejects_shrinking_backoff() {
        let mut cfg = valid_config();
        cfg.retry.backoff_factor = 0.5;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("backoff_factor must be >= 1.0"));
    }

    // ========================================================================
    // Config::validate – URLs, proxies, HTTP port
    // ========================================================================

    #[test]
    fn validate_rejects_bad_service_url() {
        let mut cfg = valid_config();
        cfg.services.chapter_service_url = "not a url".to_string();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("chapter_service_url is not a valid URL"));
    }

    #[test]
    fn validate_rejects_proxy_without_port() {
        let mut cfg = valid_config();
        cfg.proxy.servers.push(ProxyServer::new("10.0.0.1", 0));
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("has port 0"));
    }

    #[test]
    fn validate_rejects_http_port_too_large() {
        let mut cfg = valid_config();
        cfg.http.listen_addr = "0.0.0.0:70000".to_string();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("HTTP listen port must be between 1 and 65535"));
    }

    #[test]
    fn validate_skips_http_port_check_when_disabled() {
        let mut cfg = valid_config();
        cfg.http.enabled = false;
        cfg.http.listen_addr = "0.0.0.0:0".to_string();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_reports_all_errors_together() {
        let mut cfg = valid_config();
        cfg.orchestrator.max_concurrent_tasks = 0;
        cfg.retry.max_attempts = 0;
        cfg.legacy.command = " ".to_string();
        let msg = cfg.validate().unwrap_err().to_string();
        assert!(msg.starts_with("Configuration validation failed:"));
        assert!(msg.contains("max_concurrent_tasks"));
        assert!(msg.contains("max_attempts"));
        assert!(msg.contains("legacy command"));
    }

    // ========================================================================
    // Config::load
    // ========================================================================

    #[test]
    fn load_parses_partial_file_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parser.toml");
        std::fs::write(
            &path,
            r#"
[orchestrator]
max_concurrent_tasks = 4

[[proxy.servers]]
host = "proxy.local"
port = 3128
login = "user"
password = "secret"
"#,
        )
        .unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.orchestrator.max_concurrent_tasks, 4);
        assert_eq!(cfg.orchestrator.log_tail_limit, 200);
        assert_eq!(cfg.proxy.servers.len(), 1);
        assert_eq!(cfg.proxy.servers[0].username.as_deref(), Some("user"));
        assert_eq!(cfg.retry.initial_delay_ms, 2000);
    }

    #[test]
    fn load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parser.toml");
        std::fs::write(&path, "[orchestrator]\nmax_concurrent_tasks = 0\n").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn load_or_default_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load_or_default(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(cfg.orchestrator.max_concurrent_tasks, 2);
    }
}
