//! Parse and batch-parse execution
//!
//! Each slug is fetched (metadata plus chapter list) and saved as
//! `titles/{slug}.json`. Slugs run up to `concurrency` at a time but results are
//! recorded in input order. A slug failure never stops its siblings; the task
//! fails only when every slug failed.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;

use crate::daemon::collaborators::ChapterDraft;
use crate::scraping::source::{select_branch, ChapterInfo, MangaMetadata, SlugParts, SourceAdapter};
use crate::task::{TaskResult, TaskStatus};

use super::{write_atomic, TaskContext, TaskExecutor, TaskOutcome};

/// Why one slug failed, and at which step
#[derive(Debug)]
struct ItemFailure {
    step: &'static str,
    message: String,
}

impl ItemFailure {
    fn new(step: &'static str, error: impl fmt::Display) -> Self {
        Self {
            step,
            message: error.to_string(),
        }
    }
}

impl fmt::Display for ItemFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.step, self.message)
    }
}

struct ParsedTitle {
    slug: String,
    metadata: MangaMetadata,
    chapters: Vec<ChapterInfo>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TitleFile<'a> {
    slug: &'a str,
    parser: &'a str,
    parsed_at: chrono::DateTime<Utc>,
    metadata: &'a MangaMetadata,
    chapters: &'a [ChapterInfo],
}

pub struct ParseExecutor {
    adapter: Arc<dyn SourceAdapter>,
    slugs: Vec<String>,
    auto_import: bool,
    concurrency: usize,
}

impl ParseExecutor {
    pub fn new(adapter: Arc<dyn SourceAdapter>, slugs: Vec<String>, auto_import: bool, concurrency: usize) -> Self {
        Self {
            adapter,
            slugs,
            auto_import,
            concurrency: concurrency.max(1),
        }
    }

    async fn parse_one(&self, ctx: &TaskContext, slug: &str) -> Result<ParsedTitle, ItemFailure> {
        let parts = SlugParts::parse(slug);
        ctx.set_current_slug(Some(slug));
        ctx.info(format!("Parsing {}", slug));

        let client = ctx.env().clients.build().map_err(|e| ItemFailure::new("client", e))?;
        let metadata = self
            .adapter
            .fetch_metadata(&client, &parts.api)
            .await
            .map_err(|e| ItemFailure::new("metadata", e))?;
        let chapters = self
            .adapter
            .fetch_chapters(&client, &parts.api)
            .await
            .map_err(|e| ItemFailure::new("chapters", e))?;

        let file = TitleFile {
            slug: &parts.api,
            parser: self.adapter.name(),
            parsed_at: Utc::now(),
            metadata: &metadata,
            chapters: &chapters,
        };
        let json = serde_json::to_vec_pretty(&file).map_err(|e| ItemFailure::new("save", e))?;
        let storage = &ctx.env().storage;
        write_atomic(storage.temp_dir(), &storage.title_file(&parts.file), &json)
            .await
            .map_err(|e| ItemFailure::new("save", e))?;

        Ok(ParsedTitle {
            slug: slug.to_string(),
            metadata,
            chapters,
        })
    }

    /// Hand parsed titles to the catalog and chapter services. Failures here
    /// are logged and leave `imported = false`.
    async fn import(&self, ctx: &TaskContext, parsed: &[ParsedTitle]) -> anyhow::Result<Option<TaskOutcome>> {
        ctx.set_status(TaskStatus::ImportingManga)?;
        ctx.set_message(format!("Importing {} title(s) into the catalog", parsed.len()));

        let collaborators = ctx.env().collaborators.clone();
        let mut imported = Vec::with_capacity(parsed.len());
        for title in parsed {
            if ctx.is_cancelled() {
                return Ok(Some(TaskOutcome::Cancelled));
            }
            ctx.set_current_slug(Some(&title.slug));
            match collaborators.catalog.import_manga(&title.slug, &title.metadata).await {
                Ok(manga_id) => {
                    ctx.info(format!("Imported {} as manga {}", title.slug, manga_id));
                    ctx.update_result(&title.slug, |r| {
                        r.metrics.insert("mangaId".to_string(), manga_id.into());
                    });
                    imported.push((title, manga_id));
                }
                Err(e) => ctx.warn(format!("Import of {} failed: {}", title.slug, e)),
            }
        }
        ctx.set_progress(90);

        ctx.set_status(TaskStatus::ImportingChapters)?;
        for (title, manga_id) in imported {
            if ctx.is_cancelled() {
                return Ok(Some(TaskOutcome::Cancelled));
            }
            ctx.set_current_slug(Some(&title.slug));
            let (chapters, _) = select_branch(title.chapters.clone(), None, title.metadata.default_branch());
            let mut created = 0usize;
            let mut failed = 0usize;
            for chapter in chapters.iter().filter(|c| !c.is_paid) {
                match collaborators.chapters.create_chapter(&ChapterDraft::new(manga_id, chapter)).await {
                    Ok(_) => created += 1,
                    Err(e) => {
                        failed += 1;
                        ctx.warn(format!("{}: chapter {} not registered: {}", title.slug, chapter.key(), e));
                    }
                }
            }
            ctx.info(format!("{}: registered {} chapters ({} failed)", title.slug, created, failed));
            ctx.update_result(&title.slug, |r| {
                r.step = "import".to_string();
                r.imported = failed == 0;
                r.metrics.insert("chaptersImported".to_string(), created.into());
            });
        }
        Ok(None)
    }
}

#[async_trait]
impl TaskExecutor for ParseExecutor {
    async fn execute(&self, ctx: &TaskContext) -> anyhow::Result<TaskOutcome> {
        let total = self.slugs.len();
        ctx.set_total(total);
        ctx.set_message(format!("Parsing {} slug(s)", total));

        let mut parsed = Vec::new();
        let mut last_error = None;
        let mut processed = 0usize;

        let mut results = stream::iter(self.slugs.iter().cloned())
            .map(|slug| async move {
                let outcome = ctx.cancellable(self.parse_one(ctx, &slug)).await;
                (slug, outcome)
            })
            .buffered(self.concurrency);

        while let Some((slug, outcome)) = results.next().await {
            let outcome = match outcome {
                Some(outcome) => outcome,
                None => return Ok(TaskOutcome::Cancelled),
            };
            processed += 1;
            match outcome {
                Ok(title) => {
                    ctx.info(format!(
                        "Parsed {}: \"{}\" with {} chapter entries",
                        slug,
                        title.metadata.title,
                        title.chapters.len()
                    ));
                    ctx.record_success(
                        TaskResult::success(slug.as_str(), "chapters").with_metric("chapters", title.chapters.len()),
                    );
                    parsed.push(title);
                }
                Err(failure) => {
                    ctx.warn(format!("Failed to parse {}: {}", slug, failure));
                    ctx.record_failure(TaskResult::failure(slug.as_str(), failure.step, failure.message.clone()));
                    last_error = Some(failure);
                }
            }
            ctx.set_progress((processed * 100 / total.max(1)) as i64);
            if ctx.is_cancelled() {
                return Ok(TaskOutcome::Cancelled);
            }
        }
        drop(results);

        let failed = total - parsed.len();
        ctx.put_metric("parsedSlugs", parsed.len());
        ctx.put_metric("failedSlugs", failed);

        if parsed.is_empty() {
            let message = match (total, last_error) {
                (1, Some(failure)) => failure.to_string(),
                _ => format!("All {} slugs failed", total),
            };
            return Ok(TaskOutcome::Failed(message));
        }

        if self.auto_import {
            if let Some(outcome) = self.import(ctx, &parsed).await? {
                return Ok(outcome);
            }
        }

        Ok(TaskOutcome::Completed(if total == 1 {
            format!("Parsed {}", parsed[0].slug)
        } else {
            format!("Parsed {} of {} slugs ({} failed)", parsed.len(), total, failed)
        }))
    }
}
