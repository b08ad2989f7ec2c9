//! Outbound HTTP, retry, proxy, and source site configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::scraping::proxy::ProxyServer;

use super::DEFAULT_USER_AGENT;

/// Settings applied to every outbound HTTP client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpClientConfig {
    /// User agent string
    pub user_agent: String,
    /// TCP connect timeout (milliseconds)
    pub connect_timeout_ms: u64,
    /// Response timeout for a single request (milliseconds)
    pub request_timeout_ms: u64,
}

impl HttpClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            connect_timeout_ms: 2_000,
            request_timeout_ms: 8_000,
        }
    }
}

/// Capped exponential backoff for transient upstream failures
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per request, including the first
    pub max_attempts: u32,
    /// Delay before the first retry (milliseconds)
    pub initial_delay_ms: u64,
    /// Multiplier applied per attempt
    pub backoff_factor: f64,
    /// Lower bound of the random jitter multiplier
    pub jitter_min: f64,
    /// Upper bound of the random jitter multiplier
    pub jitter_max: f64,
    /// Cap for a single delay (milliseconds)
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 2_000,
            backoff_factor: 2.0,
            jitter_min: 0.85,
            jitter_max: 1.25,
            max_delay_ms: 45_000,
        }
    }
}

/// Egress proxy pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Route outbound scraping traffic through the pool
    pub enabled: bool,
    /// Optional JSON file (`{"enabled": true, "proxies": [...]}`) merged with `servers`
    pub file: Option<PathBuf>,
    /// Inline proxy list
    pub servers: Vec<ProxyServer>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            file: None,
            servers: Vec::new(),
        }
    }
}

/// Per-site source settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    pub mangalib: MangaLibConfig,
}

/// MangaLib API access
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MangaLibConfig {
    /// API root, without trailing slash
    pub api_base: String,
    /// Site domain used for the Origin header
    pub site_domain: String,
    /// Referer header value
    pub referer: String,
    /// API token; a missing `Bearer ` prefix is added automatically
    pub token: String,
    /// Value of the `Site-Id` header
    pub site_id: String,
    /// Preferred image server id from `/constants`
    pub image_server: String,
}

impl Default for MangaLibConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.cdnlibs.org/api".to_string(),
            site_domain: "mangalib.me".to_string(),
            referer: "https://mangalib.me/".to_string(),
            token: String::new(),
            site_id: "1".to_string(),
            image_server: "main".to_string(),
        }
    }
}
