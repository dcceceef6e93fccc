use reqwest::StatusCode;
use std::path::PathBuf;
use std::sync::Arc;

/// Errors produced anywhere in the fetch pipeline.
///
/// The type is `Clone` so a single login result can be handed to every
/// caller waiting on it; foreign errors are wrapped in `Arc` for that reason.
#[derive(Debug, thiserror::Error, Clone)]
pub enum FetchError {
    #[error("Network error: {source}")]
    Network {
        #[from]
        source: Arc<reqwest::Error>,
    },
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: Arc<std::io::Error>,
    },
    #[error("Server returned {status} for {url}: {body}")]
    Status {
        status: StatusCode,
        url: String,
        body: String,
    },
    #[error("Request to {url} throttled by the server (status {status})")]
    Throttled { status: StatusCode, url: String },
    #[error("Login failed: {0}")]
    Login(String),
    #[error("Playlist error: {0}")]
    Playlist(String),
    #[error("Playlist has no key reference")]
    MissingKeyUri,
    #[error("Decryption key for video {video_id} is empty")]
    EmptyKey { video_id: String },
    #[error("Decryption failed for segment {sequence}: {reason}")]
    Decrypt { sequence: u64, reason: String },
    #[error("Segment {sequence} is missing at {}", .path.display())]
    MissingSegment { sequence: u64, path: PathBuf },
    #[error("Metadata error: {0}")]
    Metadata(String),
    #[error("Cache error: {0}")]
    Cache(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Retry requested: {0}")]
    Retry(String),
    #[error("Giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<FetchError>,
    },
    #[error("Operation cancelled")]
    Cancelled,
}

impl FetchError {
    /// Whether the whole video fetch should be attempted again.
    ///
    /// Only content-level conditions qualify: an empty or unusable key, a
    /// segment that does not decrypt, or an explicit retry request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::EmptyKey { .. } | FetchError::Decrypt { .. } | FetchError::Retry(_)
        )
    }

    /// Returns the HTTP status attached to this error, if any.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            FetchError::Status { status, .. } | FetchError::Throttled { status, .. } => {
                Some(*status)
            }
            FetchError::Network { source } => source.status(),
            _ => None,
        }
    }
}

// Manual implementation of From<reqwest::Error> because of the Arc wrapping.
impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Network {
            source: Arc::new(err),
        }
    }
}

impl From<std::io::Error> for FetchError {
    fn from(err: std::io::Error) -> Self {
        FetchError::Io {
            source: Arc::new(err),
        }
    }
}

pub type Result<T, E = FetchError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(
            FetchError::EmptyKey {
                video_id: "9".into()
            }
            .is_retryable()
        );
        assert!(
            FetchError::Decrypt {
                sequence: 1,
                reason: "bad block".into()
            }
            .is_retryable()
        );
        assert!(FetchError::Retry("stale".into()).is_retryable());

        assert!(!FetchError::MissingKeyUri.is_retryable());
        assert!(!FetchError::Cancelled.is_retryable());
        assert!(
            !FetchError::Status {
                status: StatusCode::NOT_FOUND,
                url: "https://a/b".into(),
                body: String::new(),
            }
            .is_retryable()
        );
        let io: FetchError = std::io::Error::other("disk full").into();
        assert!(!io.is_retryable());
    }

    #[test]
    fn test_exhausted_is_not_retryable() {
        let err = FetchError::RetriesExhausted {
            attempts: 3,
            last: Box::new(FetchError::EmptyKey {
                video_id: "1".into(),
            }),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("3 attempts"));
    }
}
