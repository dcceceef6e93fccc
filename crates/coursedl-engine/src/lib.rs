//! # coursedl-engine
//!
//! Download engine for encrypted HLS course lectures served by a rate-limited,
//! login-gated web service.
//!
//! ## Features
//!
//! - Shared rate gate with a stop-the-world pause for re-authentication
//! - Deduplicated login when many requests are throttled at once
//! - Bounded-concurrency segment downloads that resume from disk
//! - AES-128-CBC segment decryption with MPEG-TS sync-byte realignment
//! - Course listings turned into numbered lecture tasks
//! - Per-video retry loop that tells stale content apart from fatal errors

pub mod auth;
pub mod builder;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod decryption;
pub mod error;
pub mod fetcher;
pub mod gate;
pub mod http;
pub mod metadata;
pub mod output;
pub mod playlist;
pub mod progress;
pub mod session;
pub mod utils;
pub mod video;

pub use auth::{AuthCoordinator, Authenticator, Credentials, PasswordAuthenticator};
pub use builder::EngineConfigBuilder;
pub use cache::{CacheProvider, FileCache, MemoryCache};
pub use catalog::{CourseCatalog, CourseListing, numbered_title};
pub use config::EngineConfig;
pub use decryption::{Decryptor, KeyFetcher};
pub use error::{FetchError, Result};
pub use fetcher::{FetchSummary, SegmentFetcher};
pub use gate::{GateHold, RateGate};
pub use http::{ResilientClient, create_client};
pub use metadata::{ArticleSource, CachedMetadataSource, ManifestSource, MetadataSource, VideoMetadata};
pub use output::{AssembledVideo, Reassembler};
pub use playlist::{ParsedPlaylist, Segment, SegmentSet, parse_playlist};
pub use progress::{NoopProgress, ProgressEvent, ProgressSink, SegmentStatus};
pub use session::{Session, SessionStore};
pub use video::{VideoPipeline, VideoReport, VideoState, VideoTask};
