//! # Cache Provider
//!
//! The trait every cache backend implements.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// A store that can keep, hand back and forget byte values by key.
#[async_trait]
pub trait CacheProvider: Send + Sync {
    /// Returns the value for `key`, or `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Stores `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()>;

    /// Removes `key`; removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}
