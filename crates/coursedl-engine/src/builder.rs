//! # Builder for EngineConfig
//!
//! Fluent construction of an [`EngineConfig`], mostly used by the CLI to map
//! flags onto the engine defaults.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use coursedl_engine::EngineConfig;
//!
//! let config = EngineConfig::builder()
//!     .with_timeout(Duration::from_secs(60))
//!     .with_user_agent("MyApp/1.0")
//!     .with_header("Origin", "https://course.example.com")
//!     .with_rate(Duration::from_secs(1), 5)
//!     .with_segment_concurrency(8)
//!     .with_output_dir("downloads")
//!     .build();
//!
//! assert_eq!(config.segments.download_concurrency, 8);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::EngineConfig;

/// Builder for creating EngineConfig instances with a fluent API
#[derive(Debug, Clone)]
pub struct EngineConfigBuilder {
    /// Internal config being built
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    /// Set the overall timeout for the entire HTTP request
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.http.timeout = timeout;
        self
    }

    /// Set the connection timeout (time to establish initial connection)
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.http.connect_timeout = timeout;
        self
    }

    /// Set whether to follow redirects
    pub fn with_follow_redirects(mut self, follow: bool) -> Self {
        self.config.http.follow_redirects = follow;
        self
    }

    /// Set the user agent string
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.http.user_agent = user_agent.into();
        self
    }

    /// Add a custom HTTP header
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        if let (Ok(name), Ok(value)) = (
            name.as_ref().parse::<reqwest::header::HeaderName>(),
            HeaderValue::from_str(value.as_ref()),
        ) {
            self.config.http.headers.insert(name, value);
        }
        self
    }

    /// Set all HTTP headers, replacing any existing headers
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.config.http.headers = headers;
        self
    }

    /// One token every `period`, with `burst` tokens available up front
    pub fn with_rate(mut self, period: Duration, burst: u32) -> Self {
        self.config.rate.period = period;
        self.config.rate.burst = burst;
        self
    }

    /// Constant backoff used for transport-level failures
    pub fn with_transport_retry(mut self, max_attempts: u32, delay: Duration) -> Self {
        self.config.transport_retry.max_attempts = max_attempts;
        self.config.transport_retry.delay = delay;
        self
    }

    /// Pause length after a throttle response and the post-login settle delay
    pub fn with_throttle_timing(mut self, cool_down: Duration, settle_after_login: Duration) -> Self {
        self.config.throttle.cool_down = cool_down;
        self.config.throttle.settle_after_login = settle_after_login;
        self
    }

    pub fn with_segment_concurrency(mut self, concurrency: usize) -> Self {
        self.config.segments.download_concurrency = concurrency.max(1);
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.video.output_dir = dir.into();
        self
    }

    /// Attempts of the whole per-video cycle and the delay between them
    pub fn with_video_retry(mut self, max_attempts: u32, retry_delay: Duration) -> Self {
        self.config.video.max_attempts = max_attempts.max(1);
        self.config.video.retry_delay = retry_delay;
        self
    }

    pub fn with_video_concurrency(mut self, concurrency: usize) -> Self {
        self.config.video.max_concurrent_videos = concurrency.max(1);
        self
    }

    /// Build the EngineConfig instance
    pub fn build(self) -> EngineConfig {
        self.config
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_builder_defaults() {
        let config = EngineConfigBuilder::new().build();
        assert_eq!(config.http.connect_timeout, Duration::from_secs(10));
        assert!(config.http.follow_redirects);
        assert_eq!(config.rate.period, Duration::from_secs(5));
        assert_eq!(config.rate.burst, 10);
        assert_eq!(config.throttle.cool_down, Duration::from_secs(20));
    }

    #[test]
    fn test_builder_customization() {
        let config = EngineConfigBuilder::new()
            .with_timeout(Duration::from_secs(60))
            .with_connect_timeout(Duration::from_secs(20))
            .with_follow_redirects(false)
            .with_user_agent("CustomUserAgent/1.0")
            .with_header("X-Custom-Header", "CustomValue")
            .with_transport_retry(5, Duration::from_millis(10))
            .with_video_retry(0, Duration::ZERO)
            .with_segment_concurrency(0)
            .build();

        assert_eq!(config.http.timeout, Duration::from_secs(60));
        assert_eq!(config.http.connect_timeout, Duration::from_secs(20));
        assert!(!config.http.follow_redirects);
        assert_eq!(config.http.user_agent, "CustomUserAgent/1.0");
        assert_eq!(config.transport_retry.max_attempts, 5);

        // Zero would disable the pipeline entirely, so both clamp to one.
        assert_eq!(config.video.max_attempts, 1);
        assert_eq!(config.segments.download_concurrency, 1);

        let header_value = config.http.headers.get("X-Custom-Header").unwrap();
        assert_eq!(header_value.to_str().unwrap(), "CustomValue");
    }

    #[test]
    fn test_invalid_header_is_ignored() {
        let config = EngineConfigBuilder::new()
            .with_header("bad header", "value")
            .build();
        assert!(config.http.headers.get("bad header").is_none());
    }
}
