//! Clients for the platform services a task hands its results to
//!
//! - catalog service: title import and the progress webhook
//! - chapter service: chapter registration
//! - image storage: page uploads
//!
//! Each is a trait so tests can swap in in-memory fakes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::{Config, ServicesConfig};
use crate::scraping::source::{ChapterInfo, MangaMetadata};

/// Errors from collaborating services
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{service} returned HTTP {status}")]
    Status { service: &'static str, status: u16 },
    #[error("{service} response is missing `{field}`")]
    MissingField { service: &'static str, field: &'static str },
}

/// Body of the progress webhook
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressReport {
    pub status: String,
    pub progress: u8,
    pub message: String,
    pub error: Option<String>,
}

/// Body of a chapter creation request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterDraft {
    pub manga_id: i64,
    pub chapter_number: f64,
    pub volume_number: Option<i32>,
    pub original_chapter_number: f64,
    pub title: String,
}

impl ChapterDraft {
    /// Chapter numbers are made unique across volumes: volume 2 chapter 5 becomes 2005.
    pub fn new(manga_id: i64, chapter: &ChapterInfo) -> Self {
        let chapter_number = match chapter.volume {
            Some(volume) if volume > 0 => volume as f64 * 1000.0 + chapter.number,
            _ => chapter.number,
        };
        let title = if chapter.title.trim().is_empty() {
            format!("Chapter {}", crate::scraping::source::format_number(chapter.number))
        } else {
            chapter.title.clone()
        };
        Self {
            manga_id,
            chapter_number,
            volume_number: chapter.volume,
            original_chapter_number: chapter.number,
            title,
        }
    }
}

#[async_trait]
pub trait CatalogService: Send + Sync {
    /// Import a parsed title; returns the catalog id of the manga.
    async fn import_manga(&self, slug: &str, metadata: &MangaMetadata) -> Result<i64, CollaboratorError>;

    async fn report_progress(&self, task_id: &str, report: &ProgressReport) -> Result<(), CollaboratorError>;
}

#[async_trait]
pub trait ChapterService: Send + Sync {
    /// Register a chapter; returns its id.
    async fn create_chapter(&self, draft: &ChapterDraft) -> Result<i64, CollaboratorError>;
}

#[async_trait]
pub trait ImageStorage: Send + Sync {
    async fn upload_page(&self, chapter_id: i64, page_number: u32, image: Bytes) -> Result<(), CollaboratorError>;
}

/// The three collaborators as one bundle
#[derive(Clone)]
pub struct Collaborators {
    pub catalog: Arc<dyn CatalogService>,
    pub chapters: Arc<dyn ChapterService>,
    pub images: Arc<dyn ImageStorage>,
}

impl Collaborators {
    /// HTTP clients for every service in `[services]`.
    pub fn http(config: &Config) -> Result<Self, CollaboratorError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.http_client.connect_timeout())
            .timeout(Duration::from_secs(120))
            .build()?;
        let services = HttpServices::new(client, &config.services);
        let services = Arc::new(services);
        Ok(Self {
            catalog: services.clone(),
            chapters: services.clone(),
            images: services,
        })
    }
}

/// reqwest-backed implementation of all collaborator traits
pub struct HttpServices {
    client: reqwest::Client,
    manga_service_url: String,
    chapter_service_url: String,
    image_storage_url: String,
}

impl HttpServices {
    pub fn new(client: reqwest::Client, services: &ServicesConfig) -> Self {
        Self {
            client,
            manga_service_url: services.manga_service_url.trim_end_matches('/').to_string(),
            chapter_service_url: services.chapter_service_url.trim_end_matches('/').to_string(),
            image_storage_url: services.image_storage_url.trim_end_matches('/').to_string(),
        }
    }
}

fn check_status(service: &'static str, response: &reqwest::Response) -> Result<(), CollaboratorError> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(CollaboratorError::Status {
            service,
            status: status.as_u16(),
        })
    }
}

/// Pull a numeric id out of a JSON body: `id`, `mangaId`, or `data.id`.
fn extract_id(body: &Value) -> Option<i64> {
    let as_id = |v: &Value| v.as_i64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()));
    body.get("id")
        .and_then(as_id)
        .or_else(|| body.get("mangaId").and_then(as_id))
        .or_else(|| body.get("data").and_then(|d| d.get("id")).and_then(as_id))
}

#[async_trait]
impl CatalogService for HttpServices {
    async fn import_manga(&self, slug: &str, _metadata: &MangaMetadata) -> Result<i64, CollaboratorError> {
        let url = format!("{}/parser/import/{}", self.manga_service_url, slug);
        debug!("Importing manga via {}", url);
        let response = self.client.post(&url).send().await?;
        check_status("manga-service", &response)?;
        let body: Value = response.json().await?;
        extract_id(&body).ok_or(CollaboratorError::MissingField {
            service: "manga-service",
            field: "id",
        })
    }

    async fn report_progress(&self, task_id: &str, report: &ProgressReport) -> Result<(), CollaboratorError> {
        let url = format!("{}/api/parser/progress/{}", self.manga_service_url, task_id);
        let response = self.client.post(&url).json(report).send().await?;
        check_status("manga-service", &response)
    }
}

#[async_trait]
impl ChapterService for HttpServices {
    async fn create_chapter(&self, draft: &ChapterDraft) -> Result<i64, CollaboratorError> {
        let url = format!("{}/api/chapters", self.chapter_service_url);
        let response = self.client.post(&url).json(draft).send().await?;
        check_status("chapter-service", &response)?;
        let body: Value = response.json().await?;
        extract_id(&body).ok_or(CollaboratorError::MissingField {
            service: "chapter-service",
            field: "id",
        })
    }
}

#[async_trait]
impl ImageStorage for HttpServices {
    async fn upload_page(&self, chapter_id: i64, page_number: u32, image: Bytes) -> Result<(), CollaboratorError> {
        let url = format!(
            "{}/api/images/chapter/{}/page/{}",
            self.image_storage_url, chapter_id, page_number
        );
        let part = reqwest::multipart::Part::stream(image)
            .file_name(format!("{:03}.jpg", page_number))
            .mime_str("image/jpeg")?;
        let form = reqwest::multipart::Form::new().part("file", part);
        let response = self.client.post(&url).multipart(form).send().await?;
        check_status("image-storage-service", &response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chapter_draft_offsets_by_volume() {
        let mut chapter = ChapterInfo::new("1", 5.0, Some(2));
        let draft = ChapterDraft::new(7, &chapter);
        assert_eq!(draft.chapter_number, 2005.0);
        assert_eq!(draft.original_chapter_number, 5.0);
        assert_eq!(draft.title, "Chapter 5");

        chapter.volume = None;
        chapter.title = "Arise".into();
        let draft = ChapterDraft::new(7, &chapter);
        assert_eq!(draft.chapter_number, 5.0);
        assert_eq!(draft.title, "Arise");

        let json = serde_json::to_value(&draft).unwrap();
        assert_eq!(json["mangaId"], 7);
        assert_eq!(json["originalChapterNumber"], 5.0);
    }

    #[test]
    fn ids_are_found_in_common_shapes() {
        assert_eq!(extract_id(&json!({"id": 5})), Some(5));
        assert_eq!(extract_id(&json!({"mangaId": "12"})), Some(12));
        assert_eq!(extract_id(&json!({"data": {"id": 9}})), Some(9));
        assert_eq!(extract_id(&json!({"ok": true})), None);
    }

    #[test]
    fn progress_report_is_camel_case() {
        let report = ProgressReport {
            status: "RUNNING".into(),
            progress: 40,
            message: "Parsing".into(),
            error: None,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["progress"], 40);
        assert!(json["error"].is_null());
    }
}
