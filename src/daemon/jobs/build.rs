//! Build execution: download chapter pages and optionally import them

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use bytes::Bytes;

use crate::daemon::collaborators::ChapterDraft;
use crate::scraping::fetcher::ScrapeClient;
use crate::scraping::source::{
    chapter_dir_name, select_branch, ChapterInfo, MangaMetadata, SlugParts, SourceAdapter,
};
use crate::task::{BuildOptions, TaskResult, TaskStatus};

use super::{write_atomic, TaskContext, TaskExecutor, TaskOutcome};

enum ChapterError {
    Cancelled,
    Failed { step: &'static str, message: String },
}

impl ChapterError {
    fn failed(step: &'static str, error: impl fmt::Display) -> Self {
        ChapterError::Failed {
            step,
            message: error.to_string(),
        }
    }
}

struct BuiltChapter {
    pages: usize,
    imported: bool,
}

pub struct BuildExecutor {
    adapter: Arc<dyn SourceAdapter>,
    slug: String,
    options: BuildOptions,
}

impl BuildExecutor {
    pub fn new(adapter: Arc<dyn SourceAdapter>, slug: String, options: BuildOptions) -> Self {
        Self { adapter, slug, options }
    }

    /// Resolve the chapters to build: branch first, then the selector, then
    /// drop paid chapters and repeated keys.
    fn plan(&self, ctx: &TaskContext, metadata: &MangaMetadata, chapters: Vec<ChapterInfo>) -> Vec<ChapterInfo> {
        let listed = chapters.len();
        let (chapters, choice) = select_branch(chapters, self.options.branch_id, metadata.default_branch());
        ctx.info(format!("Using {}: {} of {} chapter entries", choice, chapters.len(), listed));

        let selector = &self.options.selector;
        let chapters = if selector.is_empty() {
            chapters
        } else {
            let selected = selector.apply(chapters);
            ctx.info(format!("Partial build: {} chapters selected", selected.len()));
            selected
        };

        // one chapter per key: results and page directories are keyed by it
        let mut seen = HashSet::new();
        chapters
            .into_iter()
            .filter(|chapter| {
                let key = chapter.key();
                if chapter.is_paid {
                    ctx.info(format!("Skipping paid chapter {}", key));
                    false
                } else if !seen.insert(key.clone()) {
                    ctx.warn(format!("Skipping duplicate chapter {} (id {})", key, chapter.id));
                    false
                } else {
                    true
                }
            })
            .collect()
    }

    async fn build_chapter(
        &self,
        ctx: &TaskContext,
        client: &ScrapeClient,
        metadata: &MangaMetadata,
        parts: &SlugParts,
        chapter: &ChapterInfo,
        manga_id: Option<i64>,
    ) -> Result<BuiltChapter, ChapterError> {
        let pages = ctx
            .cancellable(self.adapter.fetch_pages(client, metadata, chapter))
            .await
            .ok_or(ChapterError::Cancelled)?
            .map_err(|e| ChapterError::failed("pages", e))?;
        if pages.is_empty() {
            return Err(ChapterError::failed("pages", "chapter has no pages"));
        }

        let storage = &ctx.env().storage;
        let dir = storage
            .archive_dir(&parts.file)
            .join(chapter_dir_name(chapter.volume, chapter.number));
        let mut images: Vec<(u32, Bytes)> = Vec::new();

        for page in &pages {
            if ctx.is_cancelled() {
                return Err(ChapterError::Cancelled);
            }
            let image = ctx
                .cancellable(self.adapter.download_page(client, page))
                .await
                .ok_or(ChapterError::Cancelled)?
                .map_err(|e| ChapterError::failed("download", format!("page {}: {}", page.index, e)))?;
            let target = dir.join(format!("{:03}.jpg", page.index));
            write_atomic(storage.temp_dir(), &target, &image)
                .await
                .map_err(|e| ChapterError::failed("save", format!("{}: {}", target.display(), e)))?;
            ctx.env().metrics.pages_downloaded.inc();
            if manga_id.is_some() {
                images.push((page.index, image));
            }
        }

        let Some(manga_id) = manga_id else {
            return Ok(BuiltChapter {
                pages: pages.len(),
                imported: false,
            });
        };

        let collaborators = &ctx.env().collaborators;
        let chapter_id = collaborators
            .chapters
            .create_chapter(&ChapterDraft::new(manga_id, chapter))
            .await
            .map_err(|e| ChapterError::failed("import", e))?;
        for (index, image) in images {
            if ctx.is_cancelled() {
                return Err(ChapterError::Cancelled);
            }
            collaborators
                .images
                .upload_page(chapter_id, index, image)
                .await
                .map_err(|e| ChapterError::failed("upload", format!("page {}: {}", index, e)))?;
        }
        Ok(BuiltChapter {
            pages: pages.len(),
            imported: true,
        })
    }
}

#[async_trait]
impl TaskExecutor for BuildExecutor {
    async fn execute(&self, ctx: &TaskContext) -> anyhow::Result<TaskOutcome> {
        let parts = SlugParts::parse(&self.slug);
        ctx.set_current_slug(Some(&self.slug));
        ctx.set_message(format!("Fetching chapter list for {}", self.slug));

        let client = ctx.env().clients.build().context("Failed to build HTTP client")?;
        let Some(fetched) = ctx
            .cancellable(async {
                let metadata = self.adapter.fetch_metadata(&client, &parts.api).await?;
                let chapters = self.adapter.fetch_chapters(&client, &parts.api).await?;
                Ok::<_, crate::scraping::fetcher::FetchError>((metadata, chapters))
            })
            .await
        else {
            return Ok(TaskOutcome::Cancelled);
        };
        let (metadata, chapters) = fetched.with_context(|| format!("Failed to load {}", self.slug))?;

        let chapters = self.plan(ctx, &metadata, chapters);
        if chapters.is_empty() {
            return Ok(TaskOutcome::Failed(format!("No chapters to build for {}", self.slug)));
        }
        let total = chapters.len();
        ctx.set_total(total);
        ctx.put_metric("chapters", total);

        let mut manga_id = None;
        if self.options.auto_import {
            ctx.set_status(TaskStatus::ImportingManga)?;
            ctx.set_message(format!("Importing {} into the catalog", self.slug));
            match ctx.env().collaborators.catalog.import_manga(&parts.api, &metadata).await {
                Ok(id) => {
                    ctx.info(format!("Imported {} as manga {}", self.slug, id));
                    ctx.put_metric("mangaId", id);
                    manga_id = Some(id);
                    ctx.set_status(TaskStatus::ImportingChapters)?;
                }
                Err(e) => {
                    ctx.warn(format!(
                        "Import of {} failed, building {} chapters locally without import: {}",
                        self.slug, total, e
                    ));
                    ctx.put_metric("mangaImported", false);
                }
            }
        }
        let scope = if self.options.auto_import && manga_id.is_none() {
            " locally"
        } else {
            ""
        };

        let mut built = 0usize;
        for (i, chapter) in chapters.iter().enumerate() {
            if ctx.is_cancelled() {
                return Ok(TaskOutcome::Cancelled);
            }
            let key = chapter.key();
            ctx.set_message(format!("Building chapter {}{} ({}/{})", key, scope, i + 1, total));

            match self.build_chapter(ctx, &client, &metadata, &parts, chapter, manga_id).await {
                Ok(done) => {
                    built += 1;
                    ctx.info(format!("Chapter {}: {} pages", key, done.pages));
                    ctx.record_success(
                        TaskResult::success(key.as_str(), "pages")
                            .with_metric("pages", done.pages)
                            .with_imported(done.imported),
                    );
                }
                Err(ChapterError::Cancelled) => return Ok(TaskOutcome::Cancelled),
                Err(ChapterError::Failed { step, message }) => {
                    ctx.warn(format!("Chapter {} failed at {}: {}", key, step, message));
                    ctx.record_failure(TaskResult::failure(key.as_str(), step, message));
                }
            }
            ctx.set_progress(((i + 1) * 100 / total) as i64);
        }

        ctx.put_metric("builtChapters", built);
        if built == 0 {
            Ok(TaskOutcome::Failed(format!("All {} chapters failed", total)))
        } else {
            Ok(TaskOutcome::Completed(format!(
                "Built {} of {} chapters ({} failed)",
                built,
                total,
                total - built
            )))
        }
    }
}
