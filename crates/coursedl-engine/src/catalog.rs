//! # Course catalog
//!
//! Lists every lecture of a course through the course API and turns the list
//! into numbered [`VideoTask`]s, so lectures sort in course order on disk and
//! two lectures sharing a title never write to the same file.
//!
//! The listing is cached under `articles-<course id>`. A listing that holds
//! fewer lectures than the course reports is still used, but its cache entry
//! is dropped so the next run asks the service again.

use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use bytes::Bytes;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::cache::{CacheProvider, keys};
use crate::error::{FetchError, Result};
use crate::http::ResilientClient;
use crate::video::VideoTask;

/// Page size asked for; courses are far smaller than this.
const LISTING_PAGE_SIZE: u32 = 500;

/// Lecture numbers already present in upstream titles: `"03 "`, `"第3讲 "`.
static TITLE_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\s*(\d+)\s*|第\d+讲\s)").unwrap());

#[derive(Debug, Deserialize)]
struct ListingResponse {
    #[serde(default)]
    code: i64,
    data: Option<ListingData>,
}

#[derive(Debug, Deserialize)]
struct ListingData {
    #[serde(default)]
    list: Vec<ListedArticle>,
    #[serde(default)]
    page: ListingPage,
}

#[derive(Debug, Deserialize)]
struct ListedArticle {
    id: u64,
    #[serde(default)]
    article_title: String,
}

#[derive(Debug, Default, Deserialize)]
struct ListingPage {
    #[serde(default)]
    count: usize,
}

/// Prefixes `title` with its 1-based position, zero padded to `pad` digits,
/// after stripping any number the title already carries.
pub fn numbered_title(title: &str, index: usize, pad: usize) -> String {
    let title = TITLE_NUMBER_RE.replace(title, "");
    format!("{:0pad$} {}", index + 1, title, pad = pad)
}

/// Lectures of a course, numbered in course order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourseListing {
    pub tasks: Vec<VideoTask>,
    /// Lecture count reported by the service
    pub expected: usize,
}

impl CourseListing {
    pub fn is_complete(&self) -> bool {
        self.tasks.len() >= self.expected
    }
}

pub struct CourseCatalog {
    http: Arc<ResilientClient>,
    articles_url: String,
    cache: Arc<dyn CacheProvider>,
    ttl: Option<Duration>,
}

impl CourseCatalog {
    pub fn new(
        http: Arc<ResilientClient>,
        articles_url: impl Into<String>,
        cache: Arc<dyn CacheProvider>,
    ) -> Self {
        Self {
            http,
            articles_url: articles_url.into(),
            cache,
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Lists the lectures of `course_id` in course order.
    pub async fn lectures(&self, course_id: u64) -> Result<CourseListing> {
        let cache_key = keys::course_articles(course_id);
        let data = match self.cached_listing(&cache_key).await? {
            Some(data) => data,
            None => self.fetch_listing(course_id, &cache_key).await?,
        };

        let expected = data.page.count.max(data.list.len());
        let pad = if expected > 100 { 3 } else { 2 };
        let tasks: Vec<VideoTask> = data
            .list
            .into_iter()
            .enumerate()
            .map(|(index, article)| {
                VideoTask::new(
                    article.id.to_string(),
                    numbered_title(&article.article_title, index, pad),
                )
            })
            .collect();
        let listing = CourseListing { tasks, expected };

        if !listing.is_complete() {
            warn!(
                course_id,
                listed = listing.tasks.len(),
                expected,
                "Course listing is incomplete, dropping it from the cache"
            );
            self.cache.delete(&cache_key).await?;
        }
        info!(course_id, lectures = listing.tasks.len(), "Course listed");
        Ok(listing)
    }

    async fn cached_listing(&self, cache_key: &str) -> Result<Option<ListingData>> {
        let Some(cached) = self.cache.get(cache_key).await? else {
            return Ok(None);
        };
        match serde_json::from_slice::<ListingResponse>(&cached) {
            Ok(ListingResponse {
                data: Some(data), ..
            }) => {
                debug!(cache_key, "Using cached course listing");
                Ok(Some(data))
            }
            _ => {
                warn!(cache_key, "Ignoring unreadable cached course listing");
                self.cache.delete(cache_key).await?;
                Ok(None)
            }
        }
    }

    async fn fetch_listing(&self, course_id: u64, cache_key: &str) -> Result<ListingData> {
        let body = json!({
            "cid": course_id,
            "size": LISTING_PAGE_SIZE,
            "prev": 0,
            "order": "earliest",
            "sample": false,
        });
        let raw = self
            .http
            .post_json(&self.articles_url, &body)
            .await?
            .bytes()
            .await?;
        let listing: ListingResponse = serde_json::from_slice(&raw).map_err(|e| {
            FetchError::Metadata(format!("unreadable listing of course {course_id}: {e}"))
        })?;
        let data = listing.data.ok_or_else(|| {
            FetchError::Metadata(format!(
                "listing of course {course_id} returned code {}",
                listing.code
            ))
        })?;

        self.cache
            .set(cache_key, Bytes::from(raw.to_vec()), self.ttl)
            .await?;
        Ok(data)
    }
}
