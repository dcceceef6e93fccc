//! # File Cache
//!
//! Persistent cache keeping each entry as a data file plus a JSON `.meta`
//! sidecar. File names are the SHA-256 of the key, so arbitrary keys are safe
//! on every filesystem.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io;
use tracing::{debug, warn};

use crate::cache::types::CacheMetadata;
use crate::error::{FetchError, Result};

use super::CacheProvider;

#[derive(Debug, Clone)]
pub struct FileCache {
    cache_dir: PathBuf,
    initialized: Arc<AtomicBool>,
}

impl FileCache {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            initialized: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    async fn ensure_initialized(&self) -> io::Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        // Racing initializers are harmless: create_dir_all is idempotent.
        fs::create_dir_all(&self.cache_dir).await?;
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn data_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(hex::encode(Sha256::digest(key.as_bytes())))
    }

    fn metadata_path(&self, key: &str) -> PathBuf {
        let mut path = self.data_path(key);
        path.set_extension("meta");
        path
    }

    async fn remove_entry(&self, data_path: &Path, meta_path: &Path) -> io::Result<()> {
        let data_result = fs::remove_file(data_path).await;
        let meta_result = fs::remove_file(meta_path).await;

        match (data_result, meta_result) {
            (Err(e), _) if e.kind() != io::ErrorKind::NotFound => {
                warn!(path = ?data_path, error = %e, "Failed to remove cache data file");
                Err(e)
            }
            (_, Err(e)) if e.kind() != io::ErrorKind::NotFound => {
                warn!(path = ?meta_path, error = %e, "Failed to remove cache metadata file");
                Err(e)
            }
            _ => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl CacheProvider for FileCache {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.ensure_initialized().await?;

        let data_path = self.data_path(key);
        let meta_path = self.metadata_path(key);

        let metadata_bytes = match fs::read(&meta_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let metadata: CacheMetadata = match serde_json::from_slice(&metadata_bytes) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(path = ?meta_path, error = %e, "Failed to parse cache metadata, dropping entry");
                self.remove_entry(&data_path, &meta_path).await?;
                return Ok(None);
            }
        };

        if metadata.is_expired() {
            debug!(key, "Cache entry expired");
            self.remove_entry(&data_path, &meta_path).await?;
            return Ok(None);
        }

        match fs::read(&data_path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = ?data_path, "Cache data file missing, dropping entry");
                self.remove_entry(&data_path, &meta_path).await?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        self.ensure_initialized().await?;

        let data_path = self.data_path(key);
        let meta_path = self.metadata_path(key);

        let metadata = CacheMetadata::new(value.len() as u64).with_ttl(ttl);
        let metadata_json = serde_json::to_vec(&metadata)
            .map_err(|e| FetchError::Cache(format!("failed to serialize metadata: {e}")))?;

        // Write to temporary files first, then rename into place.
        let temp_data_path = data_path.with_extension("tmp");
        let temp_meta_path = meta_path.with_extension("meta.tmp");

        if let Err(e) = fs::write(&temp_data_path, &value).await {
            warn!(path = ?temp_data_path, error = %e, "Failed to write cache data file");
            return Err(e.into());
        }

        if let Err(e) = fs::write(&temp_meta_path, &metadata_json).await {
            warn!(path = ?temp_meta_path, error = %e, "Failed to write cache metadata file");
            let _ = fs::remove_file(&temp_data_path).await;
            return Err(e.into());
        }

        if let Err(e) = fs::rename(&temp_data_path, &data_path).await {
            let _ = fs::remove_file(&temp_data_path).await;
            let _ = fs::remove_file(&temp_meta_path).await;
            return Err(e.into());
        }

        // The data file is already in place; without metadata it is invisible.
        if let Err(e) = fs::rename(&temp_meta_path, &meta_path).await {
            let _ = fs::remove_file(&data_path).await;
            let _ = fs::remove_file(&temp_meta_path).await;
            return Err(e.into());
        }

        debug!(key, size = metadata.size, "Cached entry to file");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.ensure_initialized().await?;
        let data_path = self.data_path(key);
        let meta_path = self.metadata_path(key);
        self.remove_entry(&data_path, &meta_path).await?;
        debug!(key, "Removed entry from file cache");
        Ok(())
    }
}
