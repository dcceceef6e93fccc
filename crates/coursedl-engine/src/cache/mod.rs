//! # Cache System
//!
//! Small key/value store used to remember lecture metadata and decryption
//! keys between attempts (and, with the file provider, between runs).
//!
//! Keys are plain strings such as `article-<id>`, `articles-<course id>` or
//! `keyurl-<id>`; see
//! [`keys`] for the helpers building them.

pub mod providers;
mod types;

pub use providers::{CacheProvider, FileCache, MemoryCache};
pub use types::CacheMetadata;

/// Cache key builders shared by the metadata and key caches.
pub mod keys {
    pub fn metadata(video_id: &str) -> String {
        format!("article-{video_id}")
    }

    pub fn decryption_key(video_id: &str) -> String {
        format!("keyurl-{video_id}")
    }

    pub fn course_articles(course_id: u64) -> String {
        format!("articles-{course_id}")
    }
}
