//! Chapter, branch, and slug helpers shared by all adapters

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::ChapterInfo;

/// A slug as given by the caller, split into its API and file forms.
///
/// Source sites address titles as `7580--solo-leveling`; files on disk use the
/// bare `solo-leveling`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlugParts {
    /// Slug used in API paths (unchanged input)
    pub api: String,
    /// Slug without the numeric id prefix
    pub file: String,
    /// Numeric id from the prefix, if present
    pub title_id: Option<i64>,
}

impl SlugParts {
    pub fn parse(slug: &str) -> Self {
        let api = slug.trim().to_string();
        if let Some((prefix, rest)) = api.split_once("--") {
            if !prefix.is_empty() && prefix.bytes().all(|b| b.is_ascii_digit()) && !rest.is_empty() {
                return Self {
                    file: rest.to_string(),
                    title_id: prefix.parse().ok(),
                    api,
                };
            }
        }
        Self {
            file: api.clone(),
            title_id: None,
            api,
        }
    }
}

/// Whether a trimmed slug can be used as a file name and an API path segment
/// without escaping either.
pub fn is_safe_slug(slug: &str) -> bool {
    let unsafe_char = |c: char| matches!(c, '/' | '\\' | '?' | '#' | '%') || c.is_control();
    !slug.is_empty() && !slug.contains("..") && !slug.chars().any(unsafe_char) && !Path::new(slug).is_absolute()
}

/// `1.0` → `"1"`, `12.5` → `"12.5"`
pub fn format_number(number: f64) -> String {
    if number.fract() == 0.0 && number.abs() < 1e15 {
        format!("{}", number as i64)
    } else {
        format!("{}", number)
    }
}

/// Composite `volume:number` key; a missing volume encodes as `0`.
pub fn chapter_key(volume: Option<i32>, number: f64) -> String {
    format!("{}:{}", volume.unwrap_or(0), format_number(number))
}

/// Directory name for a chapter's pages: `v2_ch_10.0` or `ch_10.5`.
pub fn chapter_dir_name(volume: Option<i32>, number: f64) -> String {
    match volume {
        Some(v) if v != 0 => format!("v{}_ch_{:.1}", v, number),
        _ => format!("ch_{:.1}", number),
    }
}

/// Partial-build selection: explicit chapter ids and/or `volume:number` keys.
///
/// An empty selector selects every chapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterSelector {
    pub chapter_ids: Vec<String>,
    pub chapter_keys: Vec<String>,
}

impl ChapterSelector {
    /// Build a selector, trimming and de-duplicating while keeping order.
    pub fn new<I, K>(ids: I, keys: K) -> Self
    where
        I: IntoIterator<Item = String>,
        K: IntoIterator<Item = String>,
    {
        Self {
            chapter_ids: dedup_trimmed(ids),
            chapter_keys: dedup_trimmed(keys),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chapter_ids.is_empty() && self.chapter_keys.is_empty()
    }

    pub fn matches(&self, chapter: &ChapterInfo) -> bool {
        self.is_empty()
            || self.chapter_ids.iter().any(|id| *id == chapter.id)
            || self.chapter_keys.iter().any(|key| *key == chapter.key())
    }

    pub fn apply(&self, chapters: Vec<ChapterInfo>) -> Vec<ChapterInfo> {
        if self.is_empty() {
            return chapters;
        }
        chapters.into_iter().filter(|c| self.matches(c)).collect()
    }
}

fn dedup_trimmed(values: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && seen.insert(v.clone()))
        .collect()
}

/// How the translation branch was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchChoice {
    Explicit(i64),
    Default(i64),
    LowestNonEmpty(i64),
    All,
}

impl std::fmt::Display for BranchChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BranchChoice::Explicit(b) => write!(f, "requested branch {}", b),
            BranchChoice::Default(b) => write!(f, "default branch {}", b),
            BranchChoice::LowestNonEmpty(b) => write!(f, "branch {}", b),
            BranchChoice::All => write!(f, "all branches"),
        }
    }
}

/// Pick one translation branch.
///
/// Order of preference: the requested branch, the title's default branch when it
/// has chapters, the lowest-numbered branch with chapters, and finally every
/// chapter when no branch information exists.
pub fn select_branch(
    chapters: Vec<ChapterInfo>,
    requested: Option<i64>,
    default_branch: Option<i64>,
) -> (Vec<ChapterInfo>, BranchChoice) {
    if let Some(branch) = requested {
        let selected = chapters.into_iter().filter(|c| c.branch_id == Some(branch)).collect();
        return (selected, BranchChoice::Explicit(branch));
    }

    let mut counts: BTreeMap<i64, usize> = BTreeMap::new();
    for chapter in &chapters {
        if let Some(branch) = chapter.branch_id {
            *counts.entry(branch).or_default() += 1;
        }
    }

    let choice = match default_branch {
        Some(branch) if counts.contains_key(&branch) => BranchChoice::Default(branch),
        _ => match counts.keys().next() {
            Some(&branch) => BranchChoice::LowestNonEmpty(branch),
            None => BranchChoice::All,
        },
    };

    let selected = match choice {
        BranchChoice::Default(branch) | BranchChoice::LowestNonEmpty(branch) => chapters
            .into_iter()
            .filter(|c| c.branch_id == Some(branch))
            .collect(),
        _ => chapters,
    };
    (selected, choice)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chapter(id: &str, number: f64, branch: Option<i64>) -> ChapterInfo {
        ChapterInfo {
            branch_id: branch,
            ..ChapterInfo::new(id, number, Some(1))
        }
    }

    #[test]
    fn slug_with_id_prefix_is_split() {
        let parts = SlugParts::parse(" 7580--solo-leveling ");
        assert_eq!(parts.api, "7580--solo-leveling");
        assert_eq!(parts.file, "solo-leveling");
        assert_eq!(parts.title_id, Some(7580));

        let plain = SlugParts::parse("one-piece");
        assert_eq!(plain.file, "one-piece");
        assert_eq!(plain.title_id, None);

        let odd = SlugParts::parse("abc--def");
        assert_eq!(odd.file, "abc--def");
    }

    #[test]
    fn numbers_format_without_trailing_zeroes() {
        assert_eq!(format_number(1.0), "1");
        assert_eq!(format_number(12.5), "12.5");
        assert_eq!(chapter_key(Some(2), 10.0), "2:10");
        assert_eq!(chapter_key(None, 3.5), "0:3.5");
    }

    #[test]
    fn dir_names_include_volume_when_present() {
        assert_eq!(chapter_dir_name(Some(2), 10.0), "v2_ch_10.0");
        assert_eq!(chapter_dir_name(Some(0), 10.5), "ch_10.5");
        assert_eq!(chapter_dir_name(None, 1.0), "ch_1.0");
    }

    #[test]
    fn selector_matches_ids_or_keys() {
        let selector = ChapterSelector::new(
            vec![" 11 ".to_string(), "11".to_string(), "".to_string()],
            vec!["1:3".to_string()],
        );
        assert_eq!(selector.chapter_ids, vec!["11".to_string()]);

        let chapters = vec![
            chapter("10", 1.0, None),
            chapter("11", 2.0, None),
            chapter("12", 3.0, None),
        ];
        let picked: Vec<String> = selector.apply(chapters).into_iter().map(|c| c.id).collect();
        assert_eq!(picked, vec!["11", "12"]);
    }

    #[test]
    fn empty_selector_keeps_everything() {
        let selector = ChapterSelector::default();
        assert_eq!(selector.apply(vec![chapter("1", 1.0, None)]).len(), 1);
    }

    #[test]
    fn branch_requested_wins() {
        let chapters = vec![chapter("1", 1.0, Some(10)), chapter("2", 1.0, Some(20))];
        let (picked, choice) = select_branch(chapters, Some(20), Some(10));
        assert_eq!(choice, BranchChoice::Explicit(20));
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id, "2");
    }

    #[test]
    fn branch_default_used_when_populated() {
        let chapters = vec![chapter("1", 1.0, Some(30)), chapter("2", 1.0, Some(75800))];
        let (picked, choice) = select_branch(chapters, None, Some(75800));
        assert_eq!(choice, BranchChoice::Default(75800));
        assert_eq!(picked[0].id, "2");
    }

    #[test]
    fn branch_falls_back_to_lowest_non_empty() {
        let chapters = vec![
            chapter("1", 1.0, Some(30)),
            chapter("2", 1.0, Some(20)),
            chapter("3", 2.0, Some(20)),
        ];
        let (picked, choice) = select_branch(chapters, None, Some(99));
        assert_eq!(choice, BranchChoice::LowestNonEmpty(20));
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn branch_absent_keeps_all() {
        let chapters = vec![chapter("1", 1.0, None), chapter("2", 2.0, None)];
        let (picked, choice) = select_branch(chapters, None, None);
        assert_eq!(choice, BranchChoice::All);
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn safe_slugs_stay_inside_one_path_segment() {
        assert!(is_safe_slug("7580--solo-leveling"));
        assert!(is_safe_slug("sono-bisque-doll.v2"));
        assert!(!is_safe_slug(""));
        assert!(!is_safe_slug("../up"));
        assert!(!is_safe_slug("a/b"));
        assert!(!is_safe_slug("a\\b"));
        assert!(!is_safe_slug("/etc"));
        assert!(!is_safe_slug("title?x=1"));
        assert!(!is_safe_slug("tab\tslug"));
    }
}
