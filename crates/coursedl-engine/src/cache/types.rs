use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Metadata stored next to every cached value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
    /// When the value was cached (unix seconds)
    pub cached_at: u64,
    /// When the value stops being served, if ever
    pub expires_at: Option<u64>,
    /// Size of the cached value in bytes
    pub size: u64,
}

impl CacheMetadata {
    pub fn new(size: u64) -> Self {
        Self {
            cached_at: now_secs(),
            expires_at: None,
            size,
        }
    }

    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.expires_at = ttl.map(|ttl| self.cached_at + ttl.as_secs());
        self
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now_secs())
    }
}
