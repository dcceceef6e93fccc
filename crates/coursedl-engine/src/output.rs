//! # Reassembly
//!
//! Writes the ordered, decrypted payloads of one video into its final `.ts`
//! file and removes the segment files afterwards.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use indicatif::HumanBytes;
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

use crate::error::{FetchError, Result};
use crate::playlist::SegmentSet;

/// A finished output file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledVideo {
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct Reassembler {
    buffer_size: usize,
}

impl Reassembler {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(8 * 1024),
        }
    }

    /// Writes `payloads` to `output_path` in the order they arrive.
    ///
    /// Data goes to a `.part` file renamed into place at the end, so an
    /// existing output is always complete. The partial file is removed when
    /// the stream or a write fails.
    pub async fn assemble<S>(&self, payloads: S, output_path: &Path) -> Result<AssembledVideo>
    where
        S: Stream<Item = Result<Bytes>>,
    {
        if let Some(parent) = output_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let part = part_path(output_path);
        let written = async {
            let size = self.write_all(payloads, &part).await?;
            fs::rename(&part, output_path).await?;
            Ok::<_, FetchError>(size)
        }
        .await;

        match written {
            Ok(size) => {
                info!(
                    path = %output_path.display(),
                    size = %HumanBytes(size),
                    "Video assembled"
                );
                Ok(AssembledVideo {
                    path: output_path.to_path_buf(),
                    size,
                })
            }
            Err(e) => {
                remove_partial(&part).await;
                Err(e)
            }
        }
    }

    async fn write_all<S>(&self, payloads: S, path: &Path) -> Result<u64>
    where
        S: Stream<Item = Result<Bytes>>,
    {
        let file = File::create(path).await?;
        let mut writer = BufWriter::with_capacity(self.buffer_size, file);
        let mut payloads = std::pin::pin!(payloads);
        let mut size = 0u64;

        while let Some(payload) = payloads.next().await {
            let payload = payload?;
            writer.write_all(&payload).await?;
            size += payload.len() as u64;
        }

        writer.flush().await?;
        Ok(size)
    }

    /// Deletes the segment files of a video, then their directories if empty.
    pub async fn cleanup(&self, segments: &SegmentSet) -> Result<()> {
        let mut dirs = BTreeSet::new();
        for segment in segments {
            match fs::remove_file(&segment.path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %segment.path.display(), error = %e, "Failed to remove segment");
                    return Err(e.into());
                }
            }
            if let Some(parent) = segment.path.parent() {
                dirs.insert(parent.to_path_buf());
            }
        }

        for dir in dirs {
            // Fails while other files remain, which is fine.
            if fs::remove_dir(&dir).await.is_ok() {
                debug!(dir = %dir.display(), "Removed segment directory");
            }
        }
        debug!(segments = segments.len(), "Segment files cleaned up");
        Ok(())
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(1024 * 1024)
    }
}

pub(crate) fn part_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}

/// Removes a partially written file, ignoring a missing one.
pub(crate) async fn remove_partial(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed partial output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove partial output"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playlist::parse_playlist;
    use futures::stream;
    use url::Url;

    #[tokio::test]
    async fn test_assemble_concatenates_in_stream_order() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out").join("lecture.ts");
        let payloads = stream::iter(vec![
            Ok(Bytes::from_static(b"\x47one")),
            Ok(Bytes::from_static(b"\x47two")),
            Ok(Bytes::new()),
            Ok(Bytes::from_static(b"\x47three")),
        ]);

        let video = Reassembler::default()
            .assemble(payloads, &output)
            .await
            .unwrap();
        assert_eq!(video.size, 14);
        assert_eq!(std::fs::read(&output).unwrap(), b"\x47one\x47two\x47three");
    }

    #[tokio::test]
    async fn test_failed_stream_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("lecture.ts");
        let payloads = stream::iter(vec![
            Ok(Bytes::from_static(b"\x47one")),
            Err(FetchError::Decrypt {
                sequence: 2,
                reason: "bad block".into(),
            }),
        ]);

        let err = Reassembler::default()
            .assemble(payloads, &output)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(!output.exists());
        assert!(!part_path(&output).exists());
    }

    #[tokio::test]
    async fn test_cleanup_removes_segments_and_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let segs = dir.path().join("segs").join("42");
        std::fs::create_dir_all(&segs).unwrap();
        let url = Url::parse("https://media.example.com/vod/a/hd.m3u8").unwrap();
        let segments = parse_playlist("s-1.ts\ns-2.ts", &url, &segs).unwrap().segments;
        // Only one of the two was ever downloaded.
        std::fs::write(segs.join("s-1.ts"), b"x").unwrap();

        Reassembler::default().cleanup(&segments).await.unwrap();
        assert!(!segs.exists());
    }
}
