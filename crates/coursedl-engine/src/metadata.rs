//! # Lecture metadata
//!
//! Where a lecture's title and playlist come from. The pipeline only needs
//! [`MetadataSource`]; the implementations here cover the course API, a local
//! manifest file, and a caching wrapper for either.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::cache::{CacheProvider, keys};
use crate::error::{FetchError, Result};
use crate::http::ResilientClient;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub id: String,
    pub title: String,
    pub playlist_url: String,
}

#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn fetch_video_metadata(&self, video_id: &str) -> Result<VideoMetadata>;

    /// Drops whatever is remembered about `video_id`.
    async fn invalidate(&self, video_id: &str) -> Result<()>;
}

#[async_trait]
impl<T: MetadataSource + ?Sized> MetadataSource for Arc<T> {
    async fn fetch_video_metadata(&self, video_id: &str) -> Result<VideoMetadata> {
        (**self).fetch_video_metadata(video_id).await
    }

    async fn invalidate(&self, video_id: &str) -> Result<()> {
        (**self).invalidate(video_id).await
    }
}

/// Serves metadata from a source, remembering answers in a cache.
pub struct CachedMetadataSource<S> {
    inner: S,
    cache: Arc<dyn CacheProvider>,
    ttl: Option<Duration>,
}

impl<S: MetadataSource> CachedMetadataSource<S> {
    pub fn new(inner: S, cache: Arc<dyn CacheProvider>) -> Self {
        Self {
            inner,
            cache,
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

#[async_trait]
impl<S: MetadataSource> MetadataSource for CachedMetadataSource<S> {
    async fn fetch_video_metadata(&self, video_id: &str) -> Result<VideoMetadata> {
        let cache_key = keys::metadata(video_id);
        if let Some(cached) = self.cache.get(&cache_key).await? {
            match serde_json::from_slice::<VideoMetadata>(&cached) {
                Ok(metadata) => {
                    debug!(video_id, "Using cached metadata");
                    return Ok(metadata);
                }
                Err(e) => warn!(video_id, error = %e, "Ignoring unreadable cached metadata"),
            }
        }

        let metadata = self.inner.fetch_video_metadata(video_id).await?;
        let encoded = serde_json::to_vec(&metadata)
            .map_err(|e| FetchError::Cache(format!("failed to encode metadata: {e}")))?;
        self.cache
            .set(&cache_key, Bytes::from(encoded), self.ttl)
            .await?;
        Ok(metadata)
    }

    async fn invalidate(&self, video_id: &str) -> Result<()> {
        debug!(video_id, "Invalidating cached metadata");
        self.cache.delete(&keys::metadata(video_id)).await?;
        self.inner.invalidate(video_id).await
    }
}

/// Lectures listed in a local JSON file: an array of [`VideoMetadata`].
#[derive(Debug, Clone, Default)]
pub struct ManifestSource {
    videos: HashMap<String, VideoMetadata>,
    order: Vec<String>,
}

impl ManifestSource {
    pub fn from_json(raw: &str) -> Result<Self> {
        let entries: Vec<VideoMetadata> = serde_json::from_str(raw)
            .map_err(|e| FetchError::Metadata(format!("invalid manifest: {e}")))?;
        Ok(entries.into_iter().collect())
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        Self::from_json(&raw)
    }

    /// Lectures in manifest order.
    pub fn videos(&self) -> impl Iterator<Item = &VideoMetadata> {
        self.order.iter().filter_map(|id| self.videos.get(id))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl FromIterator<VideoMetadata> for ManifestSource {
    fn from_iter<I: IntoIterator<Item = VideoMetadata>>(iter: I) -> Self {
        let mut source = ManifestSource::default();
        for video in iter {
            if !source.videos.contains_key(&video.id) {
                source.order.push(video.id.clone());
            }
            source.videos.insert(video.id.clone(), video);
        }
        source
    }
}

#[async_trait]
impl MetadataSource for ManifestSource {
    async fn fetch_video_metadata(&self, video_id: &str) -> Result<VideoMetadata> {
        self.videos
            .get(video_id)
            .cloned()
            .ok_or_else(|| FetchError::Metadata(format!("video {video_id} is not in the manifest")))
    }

    async fn invalidate(&self, _video_id: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ArticleResponse {
    #[serde(default)]
    code: i64,
    data: Option<ArticleData>,
}

#[derive(Debug, Deserialize)]
struct ArticleData {
    #[serde(default)]
    article_title: String,
    #[serde(default)]
    hls_videos: Option<HlsVideos>,
}

#[derive(Debug, Deserialize)]
struct HlsVideos {
    hd: Option<VideoVariant>,
}

#[derive(Debug, Deserialize)]
struct VideoVariant {
    #[serde(default)]
    url: String,
}

/// Looks lectures up through the course API's article endpoint.
pub struct ArticleSource {
    http: Arc<ResilientClient>,
    article_url: String,
}

impl ArticleSource {
    pub fn new(http: Arc<ResilientClient>, article_url: impl Into<String>) -> Self {
        Self {
            http,
            article_url: article_url.into(),
        }
    }
}

#[async_trait]
impl MetadataSource for ArticleSource {
    async fn fetch_video_metadata(&self, video_id: &str) -> Result<VideoMetadata> {
        let body = json!({
            "id": video_id,
            "include_neighbors": true,
            "is_freelyread": true,
        });
        let response = self.http.post_json(&self.article_url, &body).await?;
        let article: ArticleResponse = response
            .json()
            .await
            .map_err(|e| FetchError::Metadata(format!("unreadable article {video_id}: {e}")))?;

        let data = article.data.ok_or_else(|| {
            FetchError::Metadata(format!("article {video_id} returned code {}", article.code))
        })?;
        let playlist_url = data
            .hls_videos
            .and_then(|videos| videos.hd)
            .map(|hd| hd.url)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| FetchError::Metadata(format!("article {video_id} has no video")))?;

        Ok(VideoMetadata {
            id: video_id.to_string(),
            title: data.article_title,
            playlist_url,
        })
    }

    async fn invalidate(&self, _video_id: &str) -> Result<()> {
        Ok(())
    }
}
