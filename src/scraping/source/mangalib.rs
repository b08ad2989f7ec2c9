//! MangaLib API adapter

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, ORIGIN, REFERER};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, warn};
use url::Url;

use crate::config::MangaLibConfig;
use crate::scraping::fetcher::{FetchError, ScrapeClient};

use super::selection::format_number;
use super::{ChapterInfo, MangaMetadata, PageInfo, SourceAdapter};

const METADATA_FIELDS: &str =
    "fields[]=summary&fields[]=background&fields[]=authors&fields[]=genres&fields[]=tags&fields[]=releaseDate";

/// Adapter for the MangaLib JSON API
pub struct MangaLibAdapter {
    config: MangaLibConfig,
    image_server: OnceCell<String>,
}

impl MangaLibAdapter {
    pub fn new(config: MangaLibConfig) -> Self {
        Self {
            config,
            image_server: OnceCell::new(),
        }
    }

    fn api_base(&self) -> &str {
        self.config.api_base.trim_end_matches('/')
    }

    /// Headers expected by the API: token, site id, and browser-like origin.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json, text/plain, */*"));
        if let Some(token) = normalize_token(&self.config.token) {
            insert_header(&mut headers, AUTHORIZATION, &token);
        }
        insert_header(&mut headers, HeaderName::from_static("site-id"), &self.config.site_id);
        insert_header(&mut headers, ORIGIN, &format!("https://{}", self.config.site_domain));
        insert_header(&mut headers, REFERER, &self.config.referer);
        headers
    }

    async fn resolve_image_server(&self, client: &ScrapeClient) -> Result<String, FetchError> {
        self.image_server
            .get_or_try_init(|| async {
                let url = format!("{}/constants?fields[]=imageServers", self.api_base());
                let root = client.get_json(&url, &self.headers()).await?;
                let server = pick_image_server(&root, &self.config.image_server, &self.config.site_id)?;
                debug!("Resolved MangaLib image server: {}", server);
                Ok(server)
            })
            .await
            .cloned()
    }
}

fn insert_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(v) => {
            headers.insert(name, v);
        }
        Err(_) => warn!("Skipping invalid value for header {}", name),
    }
}

#[async_trait]
impl SourceAdapter for MangaLibAdapter {
    fn name(&self) -> &str {
        "mangalib"
    }

    async fn fetch_metadata(&self, client: &ScrapeClient, slug: &str) -> Result<MangaMetadata, FetchError> {
        let mut url = api_url(self.api_base(), &["manga", slug])?;
        url.set_query(Some(METADATA_FIELDS));
        let root = client.get_json(url.as_str(), &self.headers()).await?;
        parse_metadata(slug, &root)
    }

    async fn fetch_chapters(&self, client: &ScrapeClient, slug: &str) -> Result<Vec<ChapterInfo>, FetchError> {
        let url = api_url(self.api_base(), &["manga", slug, "chapters"])?;
        let root = client.get_json(url.as_str(), &self.headers()).await?;
        parse_chapters(&root)
    }

    async fn fetch_pages(
        &self,
        client: &ScrapeClient,
        manga: &MangaMetadata,
        chapter: &ChapterInfo,
    ) -> Result<Vec<PageInfo>, FetchError> {
        let variants = chapter_url_variants(self.api_base(), &manga.slug, chapter, manga.default_branch())?;
        let image_server = self.resolve_image_server(client).await?;
        let headers = self.headers();
        let mut last_error = None;

        for url in &variants {
            match client.get_json(url, &headers).await {
                Ok(root) => {
                    let pages = parse_pages(&root, &image_server);
                    if !pages.is_empty() {
                        return Ok(pages);
                    }
                    last_error = Some(FetchError::Parse(format!("no pages returned by {}", url)));
                }
                Err(e) => {
                    debug!("Chapter variant {} failed: {}", url, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            FetchError::Parse(format!("no request variants for chapter {}", chapter.id))
        }))
    }

    async fn download_page(&self, client: &ScrapeClient, page: &PageInfo) -> Result<Bytes, FetchError> {
        let mut headers = HeaderMap::new();
        insert_header(&mut headers, REFERER, &self.config.referer);
        client.get_bytes(&page.url, &headers).await
    }
}

/// Append `segments` to the API base path, percent-encoding each one.
pub fn api_url(api_base: &str, segments: &[&str]) -> Result<Url, FetchError> {
    let mut url = Url::parse(api_base.trim_end_matches('/'))
        .map_err(|e| FetchError::InvalidUrl(format!("{}: {}", api_base, e)))?;
    url.path_segments_mut()
        .map_err(|_| FetchError::InvalidUrl(api_base.to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Prefix a raw token with `Bearer ` unless it already has one.
pub fn normalize_token(token: &str) -> Option<String> {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        None
    } else if trimmed.to_lowercase().starts_with("bearer ") {
        Some(trimmed.to_string())
    } else {
        Some(format!("Bearer {}", trimmed))
    }
}

fn text(node: &Value, key: &str) -> Option<String> {
    match node.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn number(node: &Value, key: &str) -> Option<f64> {
    match node.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn names(node: &Value, key: &str) -> Vec<String> {
    node.get(key)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(|i| text(i, "name")).collect())
        .unwrap_or_default()
}

/// Parse `GET /manga/{slug}`.
pub fn parse_metadata(slug: &str, root: &Value) -> Result<MangaMetadata, FetchError> {
    let data = root
        .get("data")
        .filter(|d| d.is_object())
        .ok_or_else(|| FetchError::Parse(format!("metadata for {} has no data object", slug)))?;

    let english = text(data, "name");
    let title = text(data, "rus_name")
        .filter(|t| !t.is_empty())
        .or_else(|| english.clone())
        .ok_or_else(|| FetchError::Parse(format!("metadata for {} has no title", slug)))?;

    Ok(MangaMetadata {
        id: data.get("id").and_then(Value::as_i64),
        slug: slug.to_string(),
        title,
        english_title: english,
        summary: text(data, "summary").unwrap_or_default(),
        status: data
            .get("status")
            .and_then(|s| text(s, "label").or_else(|| text(s, "name")))
            .unwrap_or_else(|| "Unknown".to_string()),
        kind: data
            .get("type")
            .and_then(|t| text(t, "label").or_else(|| text(t, "name")))
            .unwrap_or_default(),
        release_year: number(data, "releaseDate").map(|y| y as i32),
        cover_url: data.get("cover").and_then(|c| text(c, "default")),
        genres: names(data, "genres"),
        tags: names(data, "tags"),
        authors: names(data, "authors"),
    })
}

/// Parse `GET /manga/{slug}/chapters`, one entry per translation branch,
/// sorted by volume and number.
pub fn parse_chapters(root: &Value) -> Result<Vec<ChapterInfo>, FetchError> {
    let items = root
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| FetchError::Parse("chapter list has no data array".to_string()))?;

    let mut chapters = Vec::with_capacity(items.len());
    for item in items {
        let Some(id) = text(item, "id") else {
            continue;
        };
        let base = ChapterInfo {
            id,
            number: number(item, "number").unwrap_or(0.0),
            volume: number(item, "volume").map(|v| v as i32),
            title: text(item, "name").unwrap_or_default(),
            is_paid: item.get("is_paid").and_then(Value::as_bool).unwrap_or(false),
            branch_id: None,
        };

        let branches: Vec<&Value> = item
            .get("branches")
            .and_then(Value::as_array)
            .map(|b| b.iter().collect())
            .unwrap_or_default();

        if branches.is_empty() {
            chapters.push(ChapterInfo {
                branch_id: item.get("branch_id").and_then(Value::as_i64),
                ..base
            });
            continue;
        }
        for branch in branches {
            let restricted = branch
                .get("restricted_view")
                .and_then(|r| r.get("is_open"))
                .and_then(Value::as_bool)
                .map(|open| !open)
                .unwrap_or(false);
            chapters.push(ChapterInfo {
                branch_id: branch.get("branch_id").and_then(Value::as_i64),
                is_paid: base.is_paid || restricted,
                ..base.clone()
            });
        }
    }

    chapters.sort_by(|a, b| {
        a.volume
            .unwrap_or(0)
            .cmp(&b.volume.unwrap_or(0))
            .then(a.number.total_cmp(&b.number))
    });
    Ok(chapters)
}

/// Choose the image host from `GET /constants?fields[]=imageServers`.
///
/// Servers not serving `site_id` are ignored; the preferred id wins, otherwise
/// the first usable server.
pub fn pick_image_server(root: &Value, preferred: &str, site_id: &str) -> Result<String, FetchError> {
    let servers = root
        .get("data")
        .and_then(|d| d.get("imageServers"))
        .and_then(Value::as_array)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| FetchError::Parse("image server list is empty".to_string()))?;

    let site: Option<i64> = site_id.trim().parse().ok();
    let mut fallback = None;
    for server in servers {
        let Some(url) = text(server, "url").filter(|u| !u.trim().is_empty()) else {
            continue;
        };
        let supports_site = match (site, server.get("site_ids").and_then(Value::as_array)) {
            (Some(site), Some(ids)) => ids.iter().any(|id| id.as_i64() == Some(site)),
            _ => true,
        };
        if !supports_site {
            continue;
        }
        let url = if url.ends_with('/') { url } else { format!("{}/", url) };
        if text(server, "id").as_deref() == Some(preferred) {
            return Ok(url);
        }
        fallback.get_or_insert(url);
    }
    fallback.ok_or_else(|| FetchError::Parse("no image server supports this site".to_string()))
}

/// Parse a chapter response (`pages` at the root or under `data`) into absolute page URLs.
pub fn parse_pages(root: &Value, image_server: &str) -> Vec<PageInfo> {
    let pages = root
        .get("pages")
        .or_else(|| root.get("data").and_then(|d| d.get("pages")))
        .and_then(Value::as_array);
    let Some(pages) = pages else {
        return Vec::new();
    };

    let mut result = Vec::with_capacity(pages.len());
    for page in pages {
        let Some(relative) = text(page, "url").filter(|u| !u.trim().is_empty()) else {
            continue;
        };
        let sanitized = relative.replace(' ', "%20");
        let url = if sanitized.starts_with("http://") || sanitized.starts_with("https://") {
            sanitized
        } else {
            format!("{}{}", image_server, sanitized.trim_start_matches('/'))
        };
        result.push(PageInfo {
            index: result.len() as u32 + 1,
            url,
            width: page.get("width").and_then(Value::as_u64).map(|w| w as u32),
            height: page.get("height").and_then(Value::as_u64).map(|h| h as u32),
        });
    }
    result
}

/// All request URLs worth trying for one chapter, most specific first.
///
/// The API accepts several addressing schemes depending on title age, so each is
/// tried with the branch parameter and then without it. A missing volume is sent
/// as `1`. The branch is omitted when it equals the title's default branch.
pub fn chapter_url_variants(
    api_base: &str,
    slug: &str,
    chapter: &ChapterInfo,
    default_branch: Option<i64>,
) -> Result<Vec<String>, FetchError> {
    let base = api_url(api_base, &["manga", slug, "chapter"])?;
    let number = format_number(chapter.number);
    let volume = chapter.volume.map(|v| v.to_string()).unwrap_or_else(|| "1".to_string());
    let id = Some(chapter.id.trim()).filter(|id| !id.is_empty());
    let by_id = match id {
        Some(id) => Some(api_url(api_base, &["manga", slug, "chapter", id])?),
        None => None,
    };
    let branch = chapter
        .branch_id
        .filter(|b| Some(*b) != default_branch)
        .map(|b| b.to_string());

    let mut variants = Vec::new();
    for branch in [branch.as_deref(), None] {
        variants.push(with_query(
            &base,
            &[("number", Some(&number)), ("volume", Some(&volume)), ("branch_id", branch)],
        ));
        if let (Some(id), Some(by_id)) = (id, by_id.as_ref()) {
            variants.push(with_query(
                by_id,
                &[("branch_id", branch), ("volume", Some(&volume)), ("number", Some(&number))],
            ));
            variants.push(with_query(
                &base,
                &[
                    ("chapter_id", Some(id)),
                    ("branch_id", branch),
                    ("volume", Some(&volume)),
                    ("number", Some(&number)),
                ],
            ));
            variants.push(with_query(
                &base,
                &[
                    ("id", Some(id)),
                    ("branch_id", branch),
                    ("volume", Some(&volume)),
                    ("number", Some(&number)),
                ],
            ));
        }
        variants.push(with_query(
            &base,
            &[
                ("branch_id", branch),
                ("id", id),
                ("volume", Some(&volume)),
                ("number", Some(&number)),
            ],
        ));
    }

    let mut seen = std::collections::HashSet::new();
    variants.retain(|v| seen.insert(v.clone()));
    Ok(variants)
}

fn with_query(base: &Url, params: &[(&str, Option<&str>)]) -> String {
    let mut url = base.clone();
    url.query_pairs_mut()
        .extend_pairs(params.iter().filter_map(|(k, v)| v.filter(|v| !v.is_empty()).map(|v| (*k, v))));
    if url.query().is_some_and(str::is_empty) {
        url.set_query(None);
    }
    url.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn token_gets_bearer_prefix_once() {
        assert_eq!(normalize_token("abc").as_deref(), Some("Bearer abc"));
        assert_eq!(normalize_token("Bearer abc").as_deref(), Some("Bearer abc"));
        assert_eq!(normalize_token("bearer abc").as_deref(), Some("bearer abc"));
        assert_eq!(normalize_token("  "), None);
    }

    #[test]
    fn headers_carry_site_and_origin() {
        let adapter = MangaLibAdapter::new(MangaLibConfig {
            token: "t0k".to_string(),
            ..MangaLibConfig::default()
        });
        let headers = adapter.headers();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer t0k");
        assert_eq!(headers.get("site-id").unwrap(), "1");
        assert_eq!(headers.get(ORIGIN).unwrap(), "https://mangalib.me");
    }

    #[test]
    fn metadata_prefers_russian_title() {
        let root = json!({"data": {
            "id": 7580,
            "name": "Solo Leveling",
            "rus_name": "Поднятие уровня в одиночку",
            "summary": "Hunters",
            "status": {"id": 2, "label": "Завершён"},
            "type": {"label": "Манхва"},
            "releaseDate": "2018",
            "cover": {"default": "https://cover.test/1.jpg"},
            "genres": [{"name": "Action"}, {"name": "Fantasy"}],
            "authors": [{"name": "Chugong"}]
        }});
        let meta = parse_metadata("7580--solo-leveling", &root).unwrap();
        assert_eq!(meta.id, Some(7580));
        assert_eq!(meta.title, "Поднятие уровня в одиночку");
        assert_eq!(meta.english_title.as_deref(), Some("Solo Leveling"));
        assert_eq!(meta.release_year, Some(2018));
        assert_eq!(meta.genres, vec!["Action", "Fantasy"]);
        assert_eq!(meta.status, "Завершён");
        assert!(meta.tags.is_empty());
    }

    #[test]
    fn metadata_without_data_is_parse_error() {
        let err = parse_metadata("x", &json!({"message": "not found"})).unwrap_err();
        assert!(matches!(err, FetchError::Parse(_)));
    }

    #[test]
    fn chapters_expand_branches_and_sort() {
        let root = json!({"data": [
            {"id": 3, "number": "2", "volume": "1", "name": "B",
             "branches": [{"branch_id": 75800}, {"branch_id": 12, "restricted_view": {"is_open": false}}]},
            {"id": 2, "number": "1.5", "volume": "1", "name": "A", "branches": []},
            {"number": "9"}
        ]});
        let chapters = parse_chapters(&root).unwrap();
        assert_eq!(chapters.len(), 3);
        assert_eq!(chapters[0].id, "2");
        assert_eq!(chapters[0].number, 1.5);
        assert_eq!(chapters[1].branch_id, Some(75800));
        assert!(!chapters[1].is_paid);
        assert_eq!(chapters[2].branch_id, Some(12));
        assert!(chapters[2].is_paid);
    }

    #[test]
    fn empty_chapter_list_is_valid() {
        assert!(parse_chapters(&json!({"data": []})).unwrap().is_empty());
        assert!(parse_chapters(&json!({})).is_err());
    }

    #[test]
    fn image_server_prefers_configured_id_for_site() {
        let root = json!({"data": {"imageServers": [
            {"id": "main", "url": "https://img-other.test", "site_ids": [2]},
            {"id": "secondary", "url": "https://img2.test/", "site_ids": [1]},
            {"id": "main", "url": "https://img-main.test", "site_ids": [1, 2]}
        ]}});
        assert_eq!(pick_image_server(&root, "main", "1").unwrap(), "https://img-main.test/");
        assert_eq!(pick_image_server(&root, "compress", "1").unwrap(), "https://img2.test/");
        assert!(pick_image_server(&json!({"data": {"imageServers": []}}), "main", "1").is_err());
    }

    #[test]
    fn pages_join_relative_urls() {
        let root = json!({"data": {"pages": [
            {"url": "/manga/solo/chapters/1/01 a.jpg", "width": 800, "height": 1200},
            {"url": ""},
            {"url": "https://cdn.test/02.jpg"}
        ]}});
        let pages = parse_pages(&root, "https://img.test/");
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].url, "https://img.test/manga/solo/chapters/1/01%20a.jpg");
        assert_eq!(pages[0].width, Some(800));
        assert_eq!(pages[1].index, 2);
        assert_eq!(pages[1].url, "https://cdn.test/02.jpg");
    }

    #[test]
    fn url_variants_with_and_without_branch() {
        let chapter = ChapterInfo {
            branch_id: Some(12),
            ..ChapterInfo::new("555", 10.0, None)
        };
        let variants = chapter_url_variants("https://api.test/api", "solo", &chapter, Some(75800)).unwrap();
        assert_eq!(
            variants[0],
            "https://api.test/api/manga/solo/chapter?number=10&volume=1&branch_id=12"
        );
        assert_eq!(
            variants[1],
            "https://api.test/api/manga/solo/chapter/555?branch_id=12&volume=1&number=10"
        );
        assert!(variants.contains(&"https://api.test/api/manga/solo/chapter?number=10&volume=1".to_string()));
        assert!(variants.contains(&"https://api.test/api/manga/solo/chapter?chapter_id=555&volume=1&number=10".to_string()));
        // the branchless fallback repeats the `id=` variant
        assert_eq!(variants.len(), 9);
    }

    #[test]
    fn url_variants_skip_default_branch_and_dedupe() {
        let chapter = ChapterInfo {
            branch_id: Some(75800),
            ..ChapterInfo::new("", 2.5, Some(3))
        };
        let variants = chapter_url_variants("https://api.test/api/", "solo", &chapter, Some(75800)).unwrap();
        assert_eq!(
            variants,
            vec!["https://api.test/api/manga/solo/chapter?number=2.5&volume=3".to_string(),
                 "https://api.test/api/manga/solo/chapter?volume=3&number=2.5".to_string()]
        );
    }

    #[test]
    fn api_url_encodes_each_segment() {
        let url = api_url("https://api.test/api/", &["manga", "a?b#c", "chapters"]).unwrap();
        assert_eq!(url.as_str(), "https://api.test/api/manga/a%3Fb%23c/chapters");
        assert!(api_url("not a url", &["manga"]).is_err());

        let chapter = ChapterInfo::new("9/9", 1.0, Some(1));
        let variants = chapter_url_variants("https://api.test/api", "solo", &chapter, None).unwrap();
        assert!(variants.contains(&"https://api.test/api/manga/solo/chapter/9%2F9?volume=1&number=1".to_string()));
    }
}
