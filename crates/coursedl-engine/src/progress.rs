//! Progress reporting for callers that want to render or record it.

use tokio::sync::mpsc;

use crate::video::VideoReport;

/// Outcome of one segment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentStatus {
    /// A non-empty file from an earlier run was reused
    Skipped,
    Downloaded,
    Failed,
}

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    SegmentAttempted {
        video_id: String,
        sequence: u64,
        status: SegmentStatus,
        /// Segments attempted so far for this video, this one included
        completed: usize,
        total: usize,
    },
    VideoFinished {
        report: VideoReport,
    },
}

/// Receives progress events; implementations must not block.
pub trait ProgressSink: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn report(&self, _event: ProgressEvent) {}
}

impl ProgressSink for mpsc::UnboundedSender<ProgressEvent> {
    fn report(&self, event: ProgressEvent) {
        // A dropped receiver only means nobody is listening any more.
        let _ = self.send(event);
    }
}
