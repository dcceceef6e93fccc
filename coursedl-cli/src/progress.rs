//! Turns engine progress events into log lines.

use coursedl_engine::{ProgressEvent, SegmentStatus};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Segments between two progress lines of the same lecture.
const LOG_EVERY: usize = 25;

pub fn spawn_reporter(mut events: mpsc::UnboundedReceiver<ProgressEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ProgressEvent::SegmentAttempted {
                    video_id,
                    sequence,
                    status,
                    completed,
                    total,
                } => {
                    if status == SegmentStatus::Failed {
                        warn!(video_id = %video_id, sequence, "Segment failed");
                    } else {
                        debug!(video_id = %video_id, sequence, ?status, "Segment done");
                    }
                    if completed == total || completed % LOG_EVERY == 0 {
                        info!(video_id = %video_id, "Segments {}/{}", completed, total);
                    }
                }
                ProgressEvent::VideoFinished { report } => match &report.outcome {
                    Ok(video) => info!(
                        video_id = %report.id,
                        attempts = report.attempts,
                        "Finished '{}' -> {}",
                        report.title,
                        video.path.display()
                    ),
                    Err(e) => warn!(
                        video_id = %report.id,
                        attempts = report.attempts,
                        "Giving up on '{}': {}",
                        report.title,
                        e
                    ),
                },
            }
        }
    })
}
