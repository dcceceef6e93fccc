//! # Segment fetcher
//!
//! Downloads every segment of one video with bounded parallelism. Segments
//! already on disk are skipped, and failures are logged and counted without
//! stopping their siblings. A segment that never arrives is noticed later, when
//! decryption cannot find its file.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use futures::{StreamExt, stream};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

use crate::config::SegmentConfig;
use crate::error::{FetchError, Result};
use crate::http::ResilientClient;
use crate::output::part_path;
use crate::playlist::{Segment, SegmentSet};
use crate::progress::{ProgressEvent, ProgressSink, SegmentStatus};

/// Counts of one `fetch_all` run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchSummary {
    pub total: usize,
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct SegmentFetcher {
    http: Arc<ResilientClient>,
    config: SegmentConfig,
    progress: Arc<dyn ProgressSink>,
}

impl SegmentFetcher {
    pub fn new(
        http: Arc<ResilientClient>,
        config: SegmentConfig,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            http,
            config,
            progress,
        }
    }

    pub fn config(&self) -> &SegmentConfig {
        &self.config
    }

    /// Downloads every missing segment of `segments`.
    ///
    /// Only an unusable segment directory or cancellation fail the call;
    /// individual segment failures show up in the summary.
    pub async fn fetch_all(&self, video_id: &str, segments: &SegmentSet) -> Result<FetchSummary> {
        let dirs: BTreeSet<&Path> = segments
            .iter()
            .filter_map(|segment| segment.path.parent())
            .collect();
        for dir in dirs {
            fs::create_dir_all(dir).await?;
        }

        let total = segments.len();
        let mut summary = FetchSummary {
            total,
            ..Default::default()
        };

        let mut attempts = stream::iter(segments.iter())
            .map(|segment| async move { (segment.sequence, self.fetch_one(segment).await) })
            .buffer_unordered(self.config.download_concurrency.max(1));

        let mut completed = 0;
        while let Some((sequence, outcome)) = attempts.next().await {
            completed += 1;
            let status = match outcome {
                Ok(status) => status,
                Err(FetchError::Cancelled) => return Err(FetchError::Cancelled),
                Err(e) => {
                    warn!(video_id, sequence, error = %e, "Segment download failed");
                    SegmentStatus::Failed
                }
            };
            match status {
                SegmentStatus::Skipped => summary.skipped += 1,
                SegmentStatus::Downloaded => summary.downloaded += 1,
                SegmentStatus::Failed => summary.failed += 1,
            }

            self.progress.report(ProgressEvent::SegmentAttempted {
                video_id: video_id.to_string(),
                sequence,
                status,
                completed,
                total,
            });
        }

        info!(
            video_id,
            total,
            downloaded = summary.downloaded,
            skipped = summary.skipped,
            failed = summary.failed,
            "Segment downloads finished"
        );
        Ok(summary)
    }

    async fn fetch_one(&self, segment: &Segment) -> Result<SegmentStatus> {
        if is_present(&segment.path).await {
            debug!(path = %segment.path.display(), "Segment already on disk, skipping");
            return Ok(SegmentStatus::Skipped);
        }

        let response = self.http.get(segment.url.as_str()).await?;
        let part = part_path(&segment.path);

        match self.write_body(response, &part).await {
            Ok(0) => {
                let _ = fs::remove_file(&part).await;
                Err(FetchError::Retry(format!(
                    "segment {} returned an empty body",
                    segment.sequence
                )))
            }
            Ok(written) => {
                fs::rename(&part, &segment.path).await?;
                debug!(sequence = segment.sequence, bytes = written, "Segment saved");
                Ok(SegmentStatus::Downloaded)
            }
            Err(e) => {
                let _ = fs::remove_file(&part).await;
                Err(e)
            }
        }
    }

    /// Streams a response body to `path`, returning the bytes written.
    async fn write_body(&self, response: reqwest::Response, path: &Path) -> Result<u64> {
        let file = File::create(path).await?;
        let mut writer = BufWriter::with_capacity(self.config.write_buffer_size, file);
        let mut body = std::pin::pin!(response.bytes_stream());
        let mut written = 0u64;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = self.http.cancellation().cancelled() => return Err(FetchError::Cancelled),
                chunk = body.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;
            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }

        writer.flush().await?;
        Ok(written)
    }
}

/// Whether a finished, non-empty segment file exists.
pub(crate) async fn is_present(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}
