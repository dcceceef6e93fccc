//! # Video pipeline
//!
//! Drives one lecture through metadata lookup, playlist parsing, segment
//! download, decryption and reassembly, and retries the whole cycle when the
//! failure is one that a fresh attempt can fix.
//!
//! ```text
//! Init -> Downloading -> Decrypting -> Assembled
//!   ^                         |
//!   +---- FailedRetryable <---+---> FailedFatal
//! ```

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use futures::{StreamExt, stream};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::CacheProvider;
use crate::config::{EngineConfig, VideoConfig};
use crate::decryption::{Decryptor, KeyFetcher};
use crate::error::{FetchError, Result};
use crate::fetcher::{SegmentFetcher, is_present};
use crate::http::ResilientClient;
use crate::metadata::MetadataSource;
use crate::output::{AssembledVideo, Reassembler};
use crate::playlist::{ParsedPlaylist, SegmentSet, parse_playlist};
use crate::progress::{NoopProgress, ProgressEvent, ProgressSink};

/// A lecture to download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoTask {
    pub id: String,
    /// Used for the output file name
    pub title: String,
}

impl VideoTask {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoState {
    Init,
    Downloading,
    Decrypting,
    Assembled,
    FailedRetryable,
    FailedFatal,
}

impl fmt::Display for VideoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VideoState::Init => "init",
            VideoState::Downloading => "downloading",
            VideoState::Decrypting => "decrypting",
            VideoState::Assembled => "assembled",
            VideoState::FailedRetryable => "failed-retryable",
            VideoState::FailedFatal => "failed-fatal",
        };
        f.write_str(name)
    }
}

/// Final outcome of one lecture.
#[derive(Debug, Clone)]
pub struct VideoReport {
    pub id: String,
    pub title: String,
    /// Attempts made; zero when the output already existed
    pub attempts: u32,
    pub outcome: Result<AssembledVideo>,
}

impl VideoReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Tracks the current state of one video and logs every transition.
struct StateTracker<'a> {
    video_id: &'a str,
    state: VideoState,
}

impl<'a> StateTracker<'a> {
    fn new(video_id: &'a str) -> Self {
        Self {
            video_id,
            state: VideoState::Init,
        }
    }

    /// Moves to `next`; returns false when already there.
    fn enter(&mut self, next: VideoState) -> bool {
        if self.state == next {
            return false;
        }
        debug!(video_id = self.video_id, from = %self.state, to = %next, "Video state change");
        self.state = next;
        true
    }
}

pub struct VideoPipeline {
    http: Arc<ResilientClient>,
    metadata: Arc<dyn MetadataSource>,
    keys: KeyFetcher,
    fetcher: SegmentFetcher,
    reassembler: Reassembler,
    config: VideoConfig,
    progress: Arc<dyn ProgressSink>,
}

impl VideoPipeline {
    pub fn new(
        http: Arc<ResilientClient>,
        metadata: Arc<dyn MetadataSource>,
        cache: Arc<dyn CacheProvider>,
        config: &EngineConfig,
    ) -> Self {
        let progress: Arc<dyn ProgressSink> = Arc::new(NoopProgress);
        Self {
            keys: KeyFetcher::new(Arc::clone(&http), cache),
            fetcher: SegmentFetcher::new(
                Arc::clone(&http),
                config.segments.clone(),
                Arc::clone(&progress),
            ),
            reassembler: Reassembler::new(config.segments.write_buffer_size),
            config: config.video.clone(),
            http,
            metadata,
            progress,
        }
    }

    /// Sends segment and video events to `progress`.
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.fetcher = SegmentFetcher::new(
            Arc::clone(&self.http),
            self.fetcher.config().clone(),
            Arc::clone(&progress),
        );
        self.progress = progress;
        self
    }

    pub fn http(&self) -> &Arc<ResilientClient> {
        &self.http
    }

    /// Downloads one lecture, retrying retryable failures.
    ///
    /// Never panics and never aborts other work: every failure ends up in the
    /// returned report.
    pub async fn download(&self, task: &VideoTask) -> VideoReport {
        let output_path = self.config.output_path(&task.title);

        if let Some(existing) = existing_output(&output_path).await {
            info!(video_id = %task.id, path = %output_path.display(), "Already downloaded, skipping");
            return self.finish(task, 0, Ok(existing));
        }

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempts = 0;
        let outcome = loop {
            attempts += 1;
            let mut state = StateTracker::new(&task.id);

            match self.attempt(task, &output_path, &mut state).await {
                Ok(video) => {
                    state.enter(VideoState::Assembled);
                    break Ok(video);
                }
                Err(e) if e.is_retryable() => {
                    state.enter(VideoState::FailedRetryable);
                    if attempts >= max_attempts {
                        error!(video_id = %task.id, attempts, error = %e, "Giving up on video");
                        break Err(FetchError::RetriesExhausted {
                            attempts,
                            last: Box::new(e),
                        });
                    }
                    warn!(
                        video_id = %task.id,
                        attempt = attempts,
                        max_attempts,
                        error = %e,
                        "Retryable failure, starting over"
                    );
                    let cancel = self.http.cancellation();
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break Err(FetchError::Cancelled),
                        _ = tokio::time::sleep(self.config.retry_delay) => {}
                    }
                }
                Err(e) => {
                    state.enter(VideoState::FailedFatal);
                    error!(video_id = %task.id, error = %e, "Video failed");
                    break Err(e);
                }
            }
        };

        self.finish(task, attempts, outcome)
    }

    /// Downloads every task, a few at a time; reports come back in task order.
    pub async fn download_all(&self, tasks: Vec<VideoTask>) -> Vec<VideoReport> {
        let concurrency = self.config.max_concurrent_videos.max(1);
        info!(videos = tasks.len(), concurrency, "Starting batch");

        let reports: Vec<VideoReport> = stream::iter(tasks)
            .map(|task| async move { self.download(&task).await })
            .buffered(concurrency)
            .collect()
            .await;

        let failed = reports.iter().filter(|r| !r.is_success()).count();
        info!(
            succeeded = reports.len() - failed,
            failed, "Batch finished"
        );
        reports
    }

    async fn attempt(
        &self,
        task: &VideoTask,
        output_path: &Path,
        state: &mut StateTracker<'_>,
    ) -> Result<AssembledVideo> {
        let parsed = self.load_playlist(task).await?;
        let key_uri = parsed.key_uri.ok_or(FetchError::MissingKeyUri)?;
        let segments = parsed.segments;
        if segments.is_empty() {
            return Err(FetchError::Playlist(format!(
                "playlist of video {} lists no segments",
                task.id
            )));
        }

        state.enter(VideoState::Downloading);
        let summary = self.fetcher.fetch_all(&task.id, &segments).await?;
        if summary.failed > 0 {
            warn!(
                video_id = %task.id,
                failed = summary.failed,
                "Some segments are missing, decryption will fail on them"
            );
        }

        state.enter(VideoState::Decrypting);
        let key = self.keys.fetch(&key_uri, &task.id).await?;
        let decryptor = match Decryptor::new(task.id.as_str(), key) {
            Ok(decryptor) => decryptor,
            Err(e) => {
                // A stale metadata entry keeps pointing at the unpublished key.
                if let Err(invalidate_err) = self.metadata.invalidate(&task.id).await {
                    warn!(video_id = %task.id, error = %invalidate_err, "Failed to invalidate metadata");
                }
                return Err(e);
            }
        };

        match self
            .reassembler
            .assemble(decryptor.decrypt(&segments), output_path)
            .await
        {
            Ok(video) => {
                if let Err(e) = self.reassembler.cleanup(&segments).await {
                    warn!(video_id = %task.id, error = %e, "Failed to clean up segments");
                }
                Ok(video)
            }
            Err(e) if e.is_retryable() => {
                self.discard(task, &segments).await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn load_playlist(&self, task: &VideoTask) -> Result<ParsedPlaylist> {
        let metadata = self.metadata.fetch_video_metadata(&task.id).await?;
        let playlist_url = Url::parse(&metadata.playlist_url).map_err(|e| {
            FetchError::Playlist(format!("invalid playlist URL {}: {e}", metadata.playlist_url))
        })?;

        let body = self.http.get(playlist_url.as_str()).await?.text().await?;
        parse_playlist(&body, &playlist_url, &self.config.segment_dir(&task.id))
    }

    /// Forgets everything a failed decryption may have been built on.
    async fn discard(&self, task: &VideoTask, segments: &SegmentSet) {
        if let Err(e) = self.reassembler.cleanup(segments).await {
            warn!(video_id = %task.id, error = %e, "Failed to delete segments");
        }
        if let Err(e) = self.keys.invalidate(&task.id).await {
            warn!(video_id = %task.id, error = %e, "Failed to drop cached key");
        }
    }

    fn finish(&self, task: &VideoTask, attempts: u32, outcome: Result<AssembledVideo>) -> VideoReport {
        let report = VideoReport {
            id: task.id.clone(),
            title: task.title.clone(),
            attempts,
            outcome,
        };
        self.progress.report(ProgressEvent::VideoFinished {
            report: report.clone(),
        });
        report
    }
}

async fn existing_output(path: &Path) -> Option<AssembledVideo> {
    if !is_present(path).await {
        return None;
    }
    let size = tokio::fs::metadata(path).await.ok()?.len();
    Some(AssembledVideo {
        path: path.to_path_buf(),
        size,
    })
}
