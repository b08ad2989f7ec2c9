//! Manga parser service
//!
//! Scrapes manga titles, chapter lists, and page images from source sites and
//! runs them as observable background tasks:
//! - Parse, batch parse, and build tasks on a bounded FIFO worker pool
//! - Per-task status, counters, results, and an append-only log
//! - Live progress over SSE and an optional webhook
//! - Round-robin egress proxies with retry and jittered backoff
//! - Optional import into the catalog, chapter, and image services

pub mod config;
pub mod daemon;
pub mod scraping;
pub mod task;

pub use config::Config;
