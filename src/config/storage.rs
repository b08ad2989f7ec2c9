//! Filesystem layout, legacy tool, and collaborator service configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Where parsed metadata, archives, temp files, and logs live
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root for `titles/` and `archives/`
    pub base_path: PathBuf,
    /// Scratch space for partially written files
    pub temp_path: PathBuf,
    /// Rolling log file directory
    pub logs_path: PathBuf,
    /// Files older than this are removed by the cleanup endpoint
    pub cleanup_max_age_days: u64,
}

impl StorageConfig {
    /// `{base}/titles`
    pub fn titles_dir(&self) -> PathBuf {
        self.base_path.join("titles")
    }

    /// `{base}/titles/{slug}.json`
    pub fn title_file(&self, slug: &str) -> PathBuf {
        self.titles_dir().join(format!("{}.json", slug))
    }

    /// `{base}/archives/{slug}`
    pub fn archive_dir(&self, slug: &str) -> PathBuf {
        self.base_path.join("archives").join(slug)
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_path
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("/app/output"),
            temp_path: PathBuf::from("/app/temp"),
            logs_path: PathBuf::from("/app/output/logs"),
            cleanup_max_age_days: 30,
        }
    }
}

/// External legacy tool invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LegacyConfig {
    /// Working directory of the legacy tool
    pub root: PathBuf,
    /// Interpreter or executable used to invoke it
    pub command: String,
}

impl Default for LegacyConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/app"),
            command: "python3".to_string(),
        }
    }
}

/// Base URLs of the platform services this process calls into
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    /// Catalog service: manga import and progress webhook receiver
    pub manga_service_url: String,
    /// Chapter registration
    pub chapter_service_url: String,
    /// Page image uploads
    pub image_storage_url: String,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            manga_service_url: "http://manga-service:8081".to_string(),
            chapter_service_url: "http://chapter-service:8082".to_string(),
            image_storage_url: "http://image-storage-service:8083".to_string(),
        }
    }
}
