//! Outbound scraping: proxies, retrying HTTP clients, and source adapters
//!
//! Key components:
//! - `ProxyManager`: round-robin proxy pool with direct fallback
//! - `ClientFactory` / `ScrapeClient`: per-task HTTP clients with retry built in
//! - `SourceAdapter`: site-specific metadata, chapter, and page retrieval

pub mod fetcher;
pub mod proxy;
pub mod retry;
pub mod source;

pub use fetcher::{ClientFactory, FetchError, FetchStats, ScrapeClient};
pub use proxy::{ProxyManager, ProxyProvider, ProxyServer};
pub use retry::{is_retryable_status, retry_with_backoff, RetryPolicy};
pub use source::{
    ChapterInfo, ChapterSelector, MangaLibAdapter, MangaMetadata, PageInfo, SlugParts, SourceAdapter,
    SourceRegistry,
};
