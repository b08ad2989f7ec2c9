//! Egress proxy rotation
//!
//! The pool is an owned list plus an atomic cursor. Each call to
//! [`ProxyProvider::next_proxy`] hands out the next entry; an empty pool yields
//! `None`, which callers treat as "connect directly".

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;

/// A single egress proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyServer {
    pub host: String,
    pub port: u16,
    #[serde(default, alias = "login", skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ProxyServer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Proxy URL without credentials, e.g. `http://10.0.0.1:3128`
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn has_credentials(&self) -> bool {
        self.username.as_deref().is_some_and(|u| !u.is_empty())
    }
}

impl std::fmt::Display for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Source of proxies for new outbound clients.
pub trait ProxyProvider: Send + Sync {
    /// Next proxy to use, or `None` for a direct connection.
    fn next_proxy(&self) -> Option<ProxyServer>;

    /// Number of proxies currently available.
    fn pool_size(&self) -> usize;
}

/// On-disk proxy list format
#[derive(Debug, Deserialize)]
struct ProxyFile {
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    proxies: Vec<ProxyServer>,
}

fn default_enabled() -> bool {
    true
}

/// Round-robin proxy pool
pub struct ProxyManager {
    enabled: bool,
    inline: Vec<ProxyServer>,
    file: Option<PathBuf>,
    pool: RwLock<Vec<ProxyServer>>,
    cursor: AtomicUsize,
}

impl ProxyManager {
    /// Create a manager over a fixed list.
    pub fn new(proxies: Vec<ProxyServer>) -> Self {
        Self {
            enabled: true,
            inline: proxies.clone(),
            file: None,
            pool: RwLock::new(proxies),
            cursor: AtomicUsize::new(0),
        }
    }

    /// A manager that always yields direct connections.
    pub fn direct() -> Self {
        Self::new(Vec::new())
    }

    /// Build the pool from configuration, reading the proxy file if one is set.
    ///
    /// A missing or unreadable file is logged and leaves the inline list in place.
    pub fn from_config(config: &ProxyConfig) -> Self {
        let manager = Self {
            enabled: config.enabled,
            inline: config.servers.clone(),
            file: config.file.clone(),
            pool: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
        };
        if let Err(e) = manager.reload() {
            warn!("Failed to load proxy list: {:#}", e);
            manager.replace_pool(manager.inline_pool());
        }
        manager
    }

    /// Re-read the proxy file and swap in the merged list.
    pub fn reload(&self) -> Result<usize> {
        let mut proxies = self.inline_pool();
        if self.enabled {
            if let Some(path) = &self.file {
                proxies.extend(load_proxy_file(path)?);
            }
        }
        let count = proxies.len();
        self.replace_pool(proxies);
        info!("Proxy pool loaded: {} proxies (enabled: {})", count, self.enabled);
        Ok(count)
    }

    /// Replace the pool contents and restart rotation.
    pub fn replace_pool(&self, proxies: Vec<ProxyServer>) {
        let mut pool = self.pool.write();
        *pool = proxies;
        self.cursor.store(0, Ordering::Relaxed);
    }

    /// Copy of the current pool
    pub fn proxies(&self) -> Vec<ProxyServer> {
        self.pool.read().clone()
    }

    fn inline_pool(&self) -> Vec<ProxyServer> {
        if self.enabled {
            self.inline.clone()
        } else {
            Vec::new()
        }
    }
}

impl ProxyProvider for ProxyManager {
    fn next_proxy(&self) -> Option<ProxyServer> {
        let pool = self.pool.read();
        if pool.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % pool.len();
        let proxy = pool[index].clone();
        debug!("Selected proxy {} ({}/{})", proxy, index + 1, pool.len());
        Some(proxy)
    }

    fn pool_size(&self) -> usize {
        self.pool.read().len()
    }
}

fn load_proxy_file(path: &Path) -> Result<Vec<ProxyServer>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read proxy file '{}'", path.display()))?;
    let file: ProxyFile = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse proxy file '{}'", path.display()))?;
    if !file.enabled {
        return Ok(Vec::new());
    }
    Ok(file
        .proxies
        .into_iter()
        .filter(|p| !p.host.trim().is_empty() && p.port != 0)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_of(n: u16) -> Vec<ProxyServer> {
        (1..=n).map(|i| ProxyServer::new(format!("10.0.0.{}", i), 3000 + i)).collect()
    }

    #[test]
    fn rotates_in_order_and_wraps() {
        let manager = ProxyManager::new(pool_of(3));
        let hosts: Vec<String> = (0..7)
            .map(|_| manager.next_proxy().unwrap().host)
            .collect();
        assert_eq!(
            hosts,
            vec!["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.1"]
        );
    }

    #[test]
    fn empty_pool_means_direct() {
        let manager = ProxyManager::direct();
        assert_eq!(manager.pool_size(), 0);
        assert!(manager.next_proxy().is_none());
    }

    #[test]
    fn replace_pool_restarts_rotation() {
        let manager = ProxyManager::new(pool_of(2));
        manager.next_proxy();
        manager.replace_pool(vec![ProxyServer::new("fresh", 8080)]);
        assert_eq!(manager.next_proxy().unwrap().host, "fresh");
        assert_eq!(manager.next_proxy().unwrap().host, "fresh");
    }

    #[test]
    fn concurrent_rotation_spreads_evenly() {
        let manager = std::sync::Arc::new(ProxyManager::new(pool_of(4)));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = manager.clone();
                std::thread::spawn(move || {
                    (0..100).map(|_| m.next_proxy().unwrap().port).collect::<Vec<_>>()
                })
            })
            .collect();
        let mut counts = std::collections::HashMap::new();
        for h in handles {
            for port in h.join().unwrap() {
                *counts.entry(port).or_insert(0) += 1;
            }
        }
        assert_eq!(counts.len(), 4);
        assert!(counts.values().all(|&c| c == 100));
    }

    #[test]
    fn loads_file_with_login_alias() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxies.json");
        std::fs::write(
            &path,
            r#"{"enabled": true, "proxies": [
                {"host": "1.2.3.4", "port": 8000, "login": "u", "password": "p"},
                {"host": "", "port": 8001}
            ]}"#,
        )
        .unwrap();

        let manager = ProxyManager::from_config(&ProxyConfig {
            enabled: true,
            file: Some(path),
            servers: vec![ProxyServer::new("inline", 9000)],
        });
        let proxies = manager.proxies();
        assert_eq!(proxies.len(), 2);
        assert_eq!(proxies[0].host, "inline");
        assert!(proxies[1].has_credentials());
    }

    #[test]
    fn disabled_toggle_yields_empty_pool() {
        let manager = ProxyManager::from_config(&ProxyConfig {
            enabled: false,
            file: None,
            servers: pool_of(2),
        });
        assert!(manager.next_proxy().is_none());
    }

    #[test]
    fn missing_file_falls_back_to_inline() {
        let manager = ProxyManager::from_config(&ProxyConfig {
            enabled: true,
            file: Some(PathBuf::from("/nonexistent/proxies.json")),
            servers: pool_of(1),
        });
        assert_eq!(manager.pool_size(), 1);
    }
}
