use std::path::PathBuf;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderValue};

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

// --- Top-Level Configuration ---
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub http: HttpConfig,
    pub rate: RateConfig,
    pub transport_retry: TransportRetryConfig,
    pub throttle: ThrottleConfig,
    pub segments: SegmentConfig,
    pub video: VideoConfig,
}

impl EngineConfig {
    pub fn builder() -> crate::builder::EngineConfigBuilder {
        crate::builder::EngineConfigBuilder::new()
    }
}

// --- HTTP client Configuration ---
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Overall timeout for the entire HTTP request
    pub timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Whether to follow redirects
    pub follow_redirects: bool,

    /// User agent string
    pub user_agent: String,

    /// Headers sent with every request, before session headers are applied
    pub headers: HeaderMap,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            // Segment bodies are streamed, so keep the overall ceiling generous.
            timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: HttpConfig::get_default_headers(),
        }
    }
}

impl HttpConfig {
    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("application/json, text/plain, */*"),
        );

        default_headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.8"),
        );

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );
        default_headers
    }
}

// --- Rate gate Configuration ---
#[derive(Debug, Clone)]
pub struct RateConfig {
    /// Time needed to replenish one request token
    pub period: Duration,
    /// Number of requests that may be issued back to back
    pub burst: u32,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(5),
            burst: 10,
        }
    }
}

// --- Transport retry Configuration ---
#[derive(Debug, Clone)]
pub struct TransportRetryConfig {
    /// Total attempts for a request failing at the transport level
    pub max_attempts: u32,
    /// Constant delay between attempts
    pub delay: Duration,
}

impl Default for TransportRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(3),
        }
    }
}

// --- Throttle handling Configuration ---
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Statuses the service uses to signal a global throttle
    pub statuses: Vec<StatusCode>,
    /// How long all traffic stays paused before re-authenticating
    pub cool_down: Duration,
    /// Delay the login leader waits after a successful re-authentication
    pub settle_after_login: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            statuses: vec![
                StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS,
                // 452 has no registered constant; the range is valid so this cannot fail.
                StatusCode::from_u16(452).unwrap_or(StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS),
            ],
            cool_down: Duration::from_secs(20),
            settle_after_login: Duration::from_secs(5),
        }
    }
}

impl ThrottleConfig {
    pub fn is_throttle(&self, status: StatusCode) -> bool {
        self.statuses.contains(&status)
    }
}

// --- Segment download Configuration ---
#[derive(Debug, Clone)]
pub struct SegmentConfig {
    /// Max concurrent segment downloads per video
    pub download_concurrency: usize,
    /// Capacity of the buffered writer used for each segment file
    pub write_buffer_size: usize,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            download_concurrency: 5,
            write_buffer_size: 1024 * 1024,
        }
    }
}

// --- Per-video Configuration ---
#[derive(Debug, Clone)]
pub struct VideoConfig {
    /// Directory receiving the assembled `.ts` files
    pub output_dir: PathBuf,
    /// Attempts of the full fetch, decrypt, assemble cycle
    pub max_attempts: u32,
    /// Pause between two attempts of the same video
    pub retry_delay: Duration,
    /// Videos processed at the same time by `download_all`
    pub max_concurrent_videos: usize,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("videos"),
            max_attempts: 3,
            retry_delay: Duration::from_millis(500),
            max_concurrent_videos: 2,
        }
    }
}

impl VideoConfig {
    /// Directory holding the raw segments of one video.
    pub fn segment_dir(&self, video_id: &str) -> PathBuf {
        self.output_dir
            .join("segs")
            .join(crate::utils::sanitize_file_name(video_id))
    }

    /// Final output path for a video title.
    pub fn output_path(&self, title: &str) -> PathBuf {
        self.output_dir
            .join(format!("{}.ts", crate::utils::sanitize_file_name(title)))
    }
}
