//! Source site adapters
//!
//! Each supported aggregator implements [`SourceAdapter`]: it knows how to build
//! request URLs for its API and turn responses into [`MangaMetadata`],
//! [`ChapterInfo`], and [`PageInfo`]. All network access goes through the
//! [`ScrapeClient`] handed in by the caller, so proxy choice and retry stay
//! outside the adapter.

pub mod mangalib;
pub mod selection;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};

use super::fetcher::{FetchError, ScrapeClient};

pub use mangalib::MangaLibAdapter;
pub use selection::{
    chapter_dir_name, chapter_key, format_number, is_safe_slug, select_branch, BranchChoice, ChapterSelector,
    SlugParts,
};

/// Parser used when a request does not name one
pub const DEFAULT_PARSER: &str = "mangalib";

/// Title-level metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MangaMetadata {
    /// Numeric title id on the source site
    pub id: Option<i64>,
    pub slug: String,
    pub title: String,
    pub english_title: Option<String>,
    pub summary: String,
    pub status: String,
    pub kind: String,
    pub release_year: Option<i32>,
    pub cover_url: Option<String>,
    pub genres: Vec<String>,
    pub tags: Vec<String>,
    pub authors: Vec<String>,
}

impl MangaMetadata {
    /// Branch the source treats as primary for this title.
    pub fn default_branch(&self) -> Option<i64> {
        self.id.map(|id| id * 10)
    }
}

/// One chapter entry (per translation branch)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterInfo {
    pub id: String,
    pub number: f64,
    pub volume: Option<i32>,
    pub title: String,
    pub is_paid: bool,
    pub branch_id: Option<i64>,
}

impl ChapterInfo {
    pub fn new(id: impl Into<String>, number: f64, volume: Option<i32>) -> Self {
        Self {
            id: id.into(),
            number,
            volume,
            title: String::new(),
            is_paid: false,
            branch_id: None,
        }
    }

    /// `volume:number` key used by build selectors
    pub fn key(&self) -> String {
        chapter_key(self.volume, self.number)
    }
}

/// One page image of a chapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    /// 1-based page index
    pub index: u32,
    pub url: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Site-specific request building and response parsing.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Parser name used in requests, lowercase
    fn name(&self) -> &str;

    async fn fetch_metadata(&self, client: &ScrapeClient, slug: &str) -> Result<MangaMetadata, FetchError>;

    async fn fetch_chapters(&self, client: &ScrapeClient, slug: &str) -> Result<Vec<ChapterInfo>, FetchError>;

    async fn fetch_pages(
        &self,
        client: &ScrapeClient,
        manga: &MangaMetadata,
        chapter: &ChapterInfo,
    ) -> Result<Vec<PageInfo>, FetchError>;

    async fn download_page(&self, client: &ScrapeClient, page: &PageInfo) -> Result<Bytes, FetchError> {
        client.get_bytes(&page.url, &HeaderMap::new()).await
    }
}

/// Adapters by parser name
#[derive(Clone, Default)]
pub struct SourceRegistry {
    adapters: HashMap<String, Arc<dyn SourceAdapter>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.insert(adapter.name().to_lowercase(), adapter);
    }

    /// Look up a parser by name, case-insensitively. `None` or blank selects
    /// [`DEFAULT_PARSER`].
    pub fn resolve(&self, parser: Option<&str>) -> Option<Arc<dyn SourceAdapter>> {
        let name = parser
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_PARSER)
            .to_lowercase();
        self.adapters.get(&name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MangaLibConfig;

    #[test]
    fn registry_resolves_case_insensitively_with_default() {
        let registry = SourceRegistry::new().with(Arc::new(MangaLibAdapter::new(MangaLibConfig::default())));
        assert!(registry.resolve(Some("MangaLib")).is_some());
        assert!(registry.resolve(Some("  mangalib ")).is_some());
        assert!(registry.resolve(None).is_some());
        assert!(registry.resolve(Some("")).is_some());
        assert!(registry.resolve(Some("mangabuff")).is_none());
        assert_eq!(registry.names(), vec!["mangalib".to_string()]);
    }

    #[test]
    fn default_branch_derives_from_title_id() {
        let meta = MangaMetadata {
            id: Some(7580),
            ..MangaMetadata::default()
        };
        assert_eq!(meta.default_branch(), Some(75800));
        assert_eq!(MangaMetadata::default().default_branch(), None);
    }
}
