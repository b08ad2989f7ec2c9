//! Stored parse output
//!
//! Title metadata lives in `titles/{slug}.json` and page images in
//! `archives/{slug}/` under the storage root. Directory walks run on the
//! blocking pool.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::StorageConfig;
use crate::scraping::source::{is_safe_slug, SlugParts};

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("invalid slug: {0}")]
    InvalidSlug(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Malformed title file {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// What an age-based cleanup removed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub deleted_files: usize,
    pub deleted_directories: usize,
    pub freed_bytes: u64,
}

/// List, read, and remove what parse and build tasks wrote
#[derive(Debug, Clone)]
pub struct OutputStore {
    storage: StorageConfig,
}

impl OutputStore {
    pub fn new(storage: StorageConfig) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &StorageConfig {
        &self.storage
    }

    /// File-form slug (`7580--solo` → `solo`), rejecting unsafe input.
    fn file_slug(slug: &str) -> Result<String, OutputError> {
        let slug = slug.trim();
        if !is_safe_slug(slug) {
            return Err(OutputError::InvalidSlug(slug.to_string()));
        }
        Ok(SlugParts::parse(slug).file)
    }

    /// Slugs that have a saved title file, sorted.
    pub async fn list_parsed(&self) -> Result<Vec<String>, OutputError> {
        let dir = self.storage.titles_dir();
        Ok(tokio::task::spawn_blocking(move || list_titles(&dir)).await??)
    }

    /// The saved title document, or `None` if the slug was never parsed.
    pub async fn read_title(&self, slug: &str) -> Result<Option<Value>, OutputError> {
        let path = self.storage.title_file(&Self::file_slug(slug)?);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| OutputError::Malformed { path, source })
    }

    /// Remove a title's metadata and page archive. `false` when neither existed.
    pub async fn delete(&self, slug: &str) -> Result<bool, OutputError> {
        let file = Self::file_slug(slug)?;
        let title = self.storage.title_file(&file);
        let archive = self.storage.archive_dir(&file);

        let deleted = tokio::task::spawn_blocking(move || -> io::Result<bool> {
            let removed_title = ignore_missing(fs::remove_file(&title))?;
            let removed_archive = ignore_missing(fs::remove_dir_all(&archive))?;
            Ok(removed_title || removed_archive)
        })
        .await??;

        if deleted {
            info!("Deleted stored output for {}", file);
        } else {
            debug!("No stored output for {}", file);
        }
        Ok(deleted)
    }

    /// Delete files not modified within `max_age`, then any directory left
    /// empty. The storage root itself is kept.
    pub async fn cleanup(&self, max_age: Duration) -> Result<CleanupReport, OutputError> {
        let root = self.storage.base_path.clone();
        let cutoff = SystemTime::now().checked_sub(max_age).unwrap_or(SystemTime::UNIX_EPOCH);

        let report = tokio::task::spawn_blocking(move || -> io::Result<CleanupReport> {
            let mut report = CleanupReport::default();
            if root.is_dir() {
                sweep(&root, cutoff, &mut report)?;
            }
            Ok(report)
        })
        .await??;

        info!(
            "Cleanup removed {} files and {} directories ({} bytes)",
            report.deleted_files, report.deleted_directories, report.freed_bytes
        );
        Ok(report)
    }
}

/// `Ok(true)` if something was removed, `Ok(false)` if it was already gone.
fn ignore_missing(result: io::Result<()>) -> io::Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn list_titles(dir: &Path) -> io::Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut slugs = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() || path.extension().map_or(true, |ext| ext != "json") {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            slugs.push(stem.to_string());
        }
    }
    slugs.sort();
    Ok(slugs)
}

/// Returns whether `dir` is empty afterwards.
fn sweep(dir: &Path, cutoff: SystemTime, report: &mut CleanupReport) -> io::Result<bool> {
    let mut empty = true;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = entry.metadata()?;

        if meta.is_dir() {
            // a concurrent write may have refilled it
            if sweep(&path, cutoff, report)? && fs::remove_dir(&path).is_ok() {
                report.deleted_directories += 1;
            } else {
                empty = false;
            }
        } else if meta.modified()? < cutoff {
            if ignore_missing(fs::remove_file(&path))? {
                report.deleted_files += 1;
                report.freed_bytes += meta.len();
            }
        } else {
            empty = false;
        }
    }
    Ok(empty)
}
