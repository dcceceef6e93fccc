//! # Memory Cache Provider
//!
//! In-process cache backed by Moka, bounded by total value size.

use std::time::Duration;

use bytes::Bytes;
use moka::future::Cache as MokaCache;
use tracing::{debug, warn};

use crate::cache::providers::CacheProvider;
use crate::cache::types::CacheMetadata;
use crate::error::{FetchError, Result};

#[derive(Clone)]
struct CacheEntry {
    data: Bytes,
    metadata: CacheMetadata,
}

#[derive(Clone)]
pub struct MemoryCache {
    cache: MokaCache<String, CacheEntry>,
    max_size: u64,
}

impl MemoryCache {
    /// Creates a cache holding at most `max_size_bytes` of values.
    ///
    /// A zero `ttl` keeps entries until evicted by size.
    pub fn new(max_size_bytes: u64, ttl: Duration) -> Result<Self> {
        if max_size_bytes == 0 {
            return Err(FetchError::Config(
                "memory cache size must be greater than zero".to_string(),
            ));
        }

        let mut builder = MokaCache::builder()
            .weigher(|_k, v: &CacheEntry| v.data.len().try_into().unwrap_or(u32::MAX))
            .max_capacity(max_size_bytes);

        if !ttl.is_zero() {
            builder = builder.time_to_live(ttl);
        }

        debug!(max_size = max_size_bytes, ttl = ?ttl, "Memory cache created");

        Ok(Self {
            cache: builder.build(),
            max_size: max_size_bytes,
        })
    }
}

#[async_trait::async_trait]
impl CacheProvider for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let Some(entry) = self.cache.get(key).await else {
            return Ok(None);
        };

        // Per-entry expiry on top of the cache-wide TTL.
        if entry.metadata.is_expired() {
            debug!(key, "Memory cache entry expired");
            self.cache.invalidate(key).await;
            return Ok(None);
        }
        Ok(Some(entry.data))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        let metadata = CacheMetadata::new(value.len() as u64).with_ttl(ttl);
        if metadata.size > self.max_size {
            warn!(
                key,
                size = metadata.size,
                max_size = self.max_size,
                "Entry too large for memory cache, skipping"
            );
            return Ok(());
        }

        self.cache
            .insert(
                key.to_string(),
                CacheEntry {
                    data: value,
                    metadata,
                },
            )
            .await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.cache.invalidate(key).await;
        debug!(key, "Removed entry from memory cache");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = MemoryCache::new(1024, Duration::ZERO).unwrap();
        cache
            .set("keyurl-1", Bytes::from_static(b"key"), None)
            .await
            .unwrap();
        assert_eq!(
            cache.get("keyurl-1").await.unwrap(),
            Some(Bytes::from_static(b"key"))
        );
        cache.delete("keyurl-1").await.unwrap();
        assert_eq!(cache.get("keyurl-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_entry_is_skipped() {
        let cache = MemoryCache::new(4, Duration::ZERO).unwrap();
        cache
            .set("big", Bytes::from_static(b"too large"), None)
            .await
            .unwrap();
        assert_eq!(cache.get("big").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let cache = MemoryCache::new(1024, Duration::ZERO).unwrap();
        cache
            .set("article-1", Bytes::from_static(b"{}"), Some(Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(cache.get("article-1").await.unwrap(), None);
    }

    #[test]
    fn test_zero_size_is_rejected() {
        assert!(matches!(
            MemoryCache::new(0, Duration::ZERO),
            Err(FetchError::Config(_))
        ));
    }
}
