//! Proxy-backed HTTP clients for source sites
//!
//! [`ClientFactory`] builds one [`ScrapeClient`] per unit of work, taking the next
//! proxy from the pool (or connecting directly when the pool is empty). Every
//! request made through a client goes through [`retry_with_backoff`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use thiserror::Error;
use tracing::debug;

use crate::config::{Config, HttpClientConfig};

use super::proxy::{ProxyProvider, ProxyServer};
use super::retry::{is_retryable_status, retry_with_backoff, RetryPolicy};

/// Errors that can occur during fetching
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },
    #[error("Timeout after {0:?}")]
    Timeout(Duration),
    #[error("Unexpected response: {0}")]
    Parse(String),
    #[error("Failed to parse URL: {0}")]
    InvalidUrl(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Status { status, .. } => is_retryable_status(*status),
            FetchError::Timeout(_) => true,
            FetchError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().is_some_and(|s| is_retryable_status(s.as_u16()))
            }
            FetchError::Parse(_) | FetchError::InvalidUrl(_) | FetchError::Io(_) => false,
        }
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Status { status, .. } => Some(*status),
            FetchError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Outbound request statistics shared by every client from one factory
#[derive(Debug, Default)]
pub struct FetchStats {
    requests: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
    proxied_clients: AtomicU64,
    direct_clients: AtomicU64,
}

impl FetchStats {
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn proxied_clients(&self) -> u64 {
        self.proxied_clients.load(Ordering::Relaxed)
    }

    pub fn direct_clients(&self) -> u64 {
        self.direct_clients.load(Ordering::Relaxed)
    }
}

/// Builds proxy-backed clients
pub struct ClientFactory {
    config: HttpClientConfig,
    policy: RetryPolicy,
    proxies: Arc<dyn ProxyProvider>,
    stats: Arc<FetchStats>,
}

impl ClientFactory {
    pub fn new(config: HttpClientConfig, policy: RetryPolicy, proxies: Arc<dyn ProxyProvider>) -> Self {
        Self {
            config,
            policy,
            proxies,
            stats: Arc::new(FetchStats::default()),
        }
    }

    pub fn from_config(config: &Config, proxies: Arc<dyn ProxyProvider>) -> Self {
        let policy = RetryPolicy::from_config(&config.retry, config.orchestrator.command_timeout());
        Self::new(config.http_client.clone(), policy, proxies)
    }

    pub fn stats(&self) -> Arc<FetchStats> {
        self.stats.clone()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Build a client routed through the next proxy, or directly when the pool is empty.
    pub fn build(&self) -> Result<ScrapeClient, FetchError> {
        let proxy = self.proxies.next_proxy();
        self.build_with(proxy)
    }

    /// Build a client that never uses a proxy.
    pub fn direct(&self) -> Result<ScrapeClient, FetchError> {
        self.build_with(None)
    }

    fn build_with(&self, proxy: Option<ProxyServer>) -> Result<ScrapeClient, FetchError> {
        let timeout = self.config.request_timeout().min(self.policy.budget);
        let mut builder = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(timeout)
            .connect_timeout(self.config.connect_timeout())
            .redirect(reqwest::redirect::Policy::limited(10))
            .user_agent(&self.config.user_agent)
            .gzip(true)
            .brotli(true);

        match &proxy {
            Some(server) => {
                let mut rp = reqwest::Proxy::all(server.url())
                    .map_err(|e| FetchError::InvalidUrl(format!("proxy {}: {}", server, e)))?;
                if server.has_credentials() {
                    rp = rp.basic_auth(
                        server.username.as_deref().unwrap_or_default(),
                        server.password.as_deref().unwrap_or_default(),
                    );
                }
                builder = builder.proxy(rp);
                self.stats.proxied_clients.fetch_add(1, Ordering::Relaxed);
                debug!("Building HTTP client via proxy {}", server);
            }
            None => {
                builder = builder.no_proxy();
                self.stats.direct_clients.fetch_add(1, Ordering::Relaxed);
                debug!("Building direct HTTP client");
            }
        }

        Ok(ScrapeClient {
            http: builder.build()?,
            proxy,
            policy: self.policy.clone(),
            stats: self.stats.clone(),
        })
    }
}

/// HTTP client bound to one proxy (or none) with retry built in
#[derive(Clone)]
pub struct ScrapeClient {
    http: reqwest::Client,
    proxy: Option<ProxyServer>,
    policy: RetryPolicy,
    stats: Arc<FetchStats>,
}

impl ScrapeClient {
    pub fn proxy(&self) -> Option<&ProxyServer> {
        self.proxy.as_ref()
    }

    pub fn is_direct(&self) -> bool {
        self.proxy.is_none()
    }

    /// GET a JSON document.
    pub async fn get_json(&self, url: &str, headers: &HeaderMap) -> Result<serde_json::Value, FetchError> {
        let retried = retry_with_backoff(&self.policy, url, move || async move {
            let response = self.send_once(url, headers).await?;
            response
                .json::<serde_json::Value>()
                .await
                .map_err(|e| FetchError::Parse(format!("{}: {}", url, e)))
        })
        .await;
        self.record(retried.retries(), retried.result.is_err());
        retried.into_result()
    }

    /// GET a binary body (page images).
    pub async fn get_bytes(&self, url: &str, headers: &HeaderMap) -> Result<Bytes, FetchError> {
        let retried = retry_with_backoff(&self.policy, url, move || async move {
            let response = self.send_once(url, headers).await?;
            Ok(response.bytes().await?)
        })
        .await;
        self.record(retried.retries(), retried.result.is_err());
        retried.into_result()
    }

    async fn send_once(&self, url: &str, headers: &HeaderMap) -> Result<reqwest::Response, FetchError> {
        let parsed = url::Url::parse(url).map_err(|e| FetchError::InvalidUrl(format!("{}: {}", url, e)))?;
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        let response = self.http.get(parsed).headers(headers.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response)
    }

    fn record(&self, retries: u32, failed: bool) {
        self.stats.retries.fetch_add(retries as u64, Ordering::Relaxed);
        if failed {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scraping::proxy::ProxyManager;

    fn factory(proxies: Vec<ProxyServer>) -> ClientFactory {
        ClientFactory::new(
            HttpClientConfig::default(),
            RetryPolicy::default(),
            Arc::new(ProxyManager::new(proxies)),
        )
    }

    #[test]
    fn empty_pool_builds_direct_client() {
        let factory = factory(Vec::new());
        let client = factory.build().expect("direct client should build");
        assert!(client.is_direct());
        assert_eq!(factory.stats().direct_clients(), 1);
        assert_eq!(factory.stats().proxied_clients(), 0);
    }

    #[test]
    fn each_client_takes_next_proxy() {
        let factory = factory(vec![
            ProxyServer::new("10.0.0.1", 3128),
            ProxyServer::new("10.0.0.2", 3128).with_credentials("user", "pass"),
        ]);
        let first = factory.build().unwrap();
        let second = factory.build().unwrap();
        let third = factory.build().unwrap();
        assert_eq!(first.proxy().unwrap().host, "10.0.0.1");
        assert_eq!(second.proxy().unwrap().host, "10.0.0.2");
        assert_eq!(third.proxy().unwrap().host, "10.0.0.1");
        assert_eq!(factory.stats().proxied_clients(), 3);
    }

    #[test]
    fn transient_classification() {
        let s = |status| FetchError::Status { status, url: String::new() };
        assert!(s(429).is_transient());
        assert!(s(502).is_transient());
        assert!(!s(404).is_transient());
        assert!(FetchError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!FetchError::Parse("x".into()).is_transient());
        assert_eq!(s(503).status(), Some(503));
    }

    #[tokio::test]
    async fn invalid_url_is_permanent() {
        let client = factory(Vec::new()).direct().unwrap();
        let err = client.get_json("not a url", &HeaderMap::new()).await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl(_)));
    }
}
