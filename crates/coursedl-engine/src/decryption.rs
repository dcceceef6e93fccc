//! # Decryption
//!
//! Lecture segments are AES-128-CBC encrypted with an all-zero IV and PKCS#5
//! padding. After unpadding, a segment may still carry bytes in front of the
//! first MPEG-TS packet; everything before the first sync byte is dropped.
//!
//! Every content problem (empty or malformed key, ciphertext that is not a
//! whole number of blocks, impossible padding) is reported as a retryable
//! error, since it usually means the key or the segment was read before the
//! server finished publishing it.

use std::sync::Arc;

use aes::Aes128;
use bytes::Bytes;
use cbc::cipher::{BlockDecryptMut, KeyIvInit, block_padding::NoPadding};
use futures::{Stream, StreamExt, stream};
use reqwest::StatusCode;
use tokio::fs;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{CacheProvider, keys};
use crate::error::{FetchError, Result};
use crate::http::ResilientClient;
use crate::playlist::SegmentSet;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

const AES_BLOCK_SIZE: usize = 16;
const AES_KEY_SIZE: usize = 16;
const ZERO_IV: [u8; AES_BLOCK_SIZE] = [0; AES_BLOCK_SIZE];

/// MPEG-TS packets start with this byte.
pub const TS_SYNC_BYTE: u8 = 0x47;

/// Fetches decryption keys, remembering them per video.
pub struct KeyFetcher {
    http: Arc<ResilientClient>,
    cache: Arc<dyn CacheProvider>,
}

impl KeyFetcher {
    pub fn new(http: Arc<ResilientClient>, cache: Arc<dyn CacheProvider>) -> Self {
        Self { http, cache }
    }

    /// Returns the key for `video_id`, from the cache when possible.
    ///
    /// The body is returned whatever the status; an empty or unusable key is
    /// the decryptor's call to make.
    pub async fn fetch(&self, key_uri: &Url, video_id: &str) -> Result<Bytes> {
        let cache_key = keys::decryption_key(video_id);
        if let Some(key) = self.cache.get(&cache_key).await? {
            debug!(video_id, "Using cached decryption key");
            return Ok(key);
        }

        let response = self.http.get_unchecked(key_uri.as_str()).await?;
        let status = response.status();
        if status != StatusCode::OK {
            warn!(video_id, %status, url = %key_uri, "Key endpoint returned an unexpected status");
        }
        let key = response.bytes().await?;

        if !key.is_empty() {
            self.cache.set(&cache_key, key.clone(), None).await?;
        }
        Ok(key)
    }

    /// Forgets the cached key of `video_id`.
    pub async fn invalidate(&self, video_id: &str) -> Result<()> {
        self.cache.delete(&keys::decryption_key(video_id)).await
    }
}

/// Decrypts the segments of one video with one key.
#[derive(Debug, Clone)]
pub struct Decryptor {
    video_id: String,
    key: Bytes,
}

impl Decryptor {
    /// Fails with [`FetchError::EmptyKey`] before any segment is touched.
    pub fn new(video_id: impl Into<String>, key: Bytes) -> Result<Self> {
        let video_id = video_id.into();
        if key.is_empty() {
            return Err(FetchError::EmptyKey { video_id });
        }
        Ok(Self { video_id, key })
    }

    pub fn video_id(&self) -> &str {
        &self.video_id
    }

    /// Decrypts one segment and aligns it on the first sync byte.
    pub fn decrypt_segment(&self, sequence: u64, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let fail = |reason: String| FetchError::Decrypt { sequence, reason };

        if self.key.is_empty() {
            return Err(FetchError::EmptyKey {
                video_id: self.video_id.clone(),
            });
        }
        if self.key.len() != AES_KEY_SIZE {
            return Err(fail(format!(
                "key is {} bytes, expected {AES_KEY_SIZE}",
                self.key.len()
            )));
        }
        if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK_SIZE != 0 {
            return Err(fail(format!(
                "ciphertext of {} bytes is not a whole number of blocks",
                ciphertext.len()
            )));
        }

        let cipher = Aes128CbcDec::new_from_slices(&self.key, &ZERO_IV)
            .map_err(|e| fail(format!("failed to initialize AES decryptor: {e}")))?;
        let mut buffer = ciphertext.to_vec();
        let plain_len = cipher
            .decrypt_padded_mut::<NoPadding>(&mut buffer)
            .map_err(|e| fail(format!("block decryption failed: {e}")))?
            .len();
        buffer.truncate(plain_len);

        unpad(&mut buffer).map_err(fail)?;
        align_to_sync_byte(&mut buffer);
        Ok(buffer)
    }

    /// Decrypted payloads of `segments`, lazily, in ascending sequence order.
    ///
    /// A segment file that does not exist yields [`FetchError::MissingSegment`].
    pub fn decrypt<'a>(
        &'a self,
        segments: &'a SegmentSet,
    ) -> impl Stream<Item = Result<Bytes>> + Send + 'a {
        stream::iter(segments.iter()).then(move |segment| async move {
            let ciphertext = match fs::read(&segment.path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(FetchError::MissingSegment {
                        sequence: segment.sequence,
                        path: segment.path.clone(),
                    });
                }
                Err(e) => return Err(e.into()),
            };
            self.decrypt_segment(segment.sequence, &ciphertext)
                .map(Bytes::from)
        })
    }
}

/// Strips PKCS#5 padding: a last byte of `N` removes the last `N` bytes.
fn unpad(buffer: &mut Vec<u8>) -> std::result::Result<(), String> {
    let Some(&pad) = buffer.last() else {
        return Ok(());
    };
    let pad = usize::from(pad);
    if pad > buffer.len() {
        return Err(format!(
            "padding of {pad} bytes exceeds the {} byte payload",
            buffer.len()
        ));
    }
    buffer.truncate(buffer.len() - pad);
    Ok(())
}

/// Drops everything before the first sync byte; keeps the payload if none.
fn align_to_sync_byte(buffer: &mut Vec<u8>) {
    if let Some(start) = buffer.iter().position(|&b| b == TS_SYNC_BYTE) {
        buffer.drain(..start);
    }
}
