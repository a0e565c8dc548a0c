//! Canonical plugin data shapes
//!
//! Everything downstream of the adapter sees exactly these shapes, no matter
//! which naming convention the plugin author used. The adapter script is the
//! only place field-name fallbacks (`name`/`title`, `url`/`path`, ...) live.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::error::Result;

/// Filter definitions exposed by a plugin, captured once at load time.
pub type FilterMap = serde_json::Map<String, serde_json::Value>;

/// A novel as it appears in listing results.
///
/// Fields are never null; the adapter substitutes empty strings for anything
/// the plugin omitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Novel {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub url: String,

    /// Cover image URL, empty when the source provides none.
    #[serde(default)]
    pub cover: String,
}

/// Full details for a single novel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NovelDetails {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub cover: String,

    #[serde(default)]
    pub author: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub genres: Vec<String>,

    /// Publication status as reported by the source ("Ongoing", "Completed", ...).
    #[serde(default)]
    pub status: Option<String>,
}

/// A chapter entry. List order is the source's reading order and is never
/// re-sorted by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub release_time: Option<String>,
}

/// Static plugin metadata, extracted once by the adapter at load time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMetadata {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Base site URL of the source.
    #[serde(default)]
    pub site: String,

    #[serde(default)]
    pub version: String,

    /// BCP-47-ish language tag, defaults to "en".
    #[serde(default)]
    pub lang: String,

    #[serde(default)]
    pub icon: String,
}

/// The stable asynchronous surface a novel source exposes to the host.
///
/// `SourceRuntime` implements this for script plugins; native sources can
/// implement it directly and be used interchangeably by callers.
#[async_trait]
pub trait NovelSource: Send + Sync {
    /// Static metadata captured at load time.
    fn source_metadata(&self) -> &SourceMetadata;

    /// The filter definitions snapshot. Stable for the source's lifetime.
    fn filters(&self) -> &FilterMap;

    /// Search the source by keyword. `page` is 1-indexed.
    async fn search_novels(&self, query: &str, page: u32) -> Result<Vec<Novel>>;

    /// Browse popular novels. Degrades to an empty list when the plugin
    /// misbehaves, so discovery flows survive a single broken source.
    async fn popular_novels(&self, page: u32, filters: &FilterMap) -> Result<Vec<Novel>>;

    /// Browse latest novels; sources without a dedicated listing fall back
    /// to the popular listing.
    async fn latest_novels(&self, page: u32) -> Result<Vec<Novel>>;

    /// Fetch full details for one novel.
    async fn novel_details(&self, url: &str) -> Result<NovelDetails>;

    /// Fetch the chapter list for one novel, in reading order.
    async fn chapters(&self, url: &str) -> Result<Vec<Chapter>>;

    /// Fetch the rendered text content of one chapter.
    async fn chapter_content(&self, url: &str) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn novel_fields_default_to_empty_strings() {
        let novel: Novel = serde_json::from_str(r#"{"name":"X"}"#).unwrap();
        assert_eq!(novel.name, "X");
        assert_eq!(novel.url, "");
        assert_eq!(novel.cover, "");
    }

    #[test]
    fn chapter_release_time_uses_camel_case() {
        let chapter: Chapter =
            serde_json::from_str(r#"{"name":"c1","url":"/c/1","releaseTime":"2024-01-01"}"#)
                .unwrap();
        assert_eq!(chapter.release_time.as_deref(), Some("2024-01-01"));
    }

    #[test]
    fn details_tolerate_missing_optionals() {
        let details: NovelDetails =
            serde_json::from_str(r#"{"name":"N","url":"/n","cover":""}"#).unwrap();
        assert!(details.author.is_none());
        assert!(details.genres.is_empty());
        assert!(details.status.is_none());
    }
}
