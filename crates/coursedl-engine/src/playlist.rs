//! # Playlist parsing
//!
//! Lecture playlists are flat HLS media playlists: one AES-128 `#EXT-X-KEY`
//! line and a list of `<name>-<sequence>.ts` segment names. Segments are
//! served from the first path component of the playlist's host, not from the
//! playlist's own directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};
use url::Url;

use crate::error::{FetchError, Result};
use crate::utils::sanitize_file_name;

static SEGMENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\w+.*?-(\d+)\.ts").unwrap());

static KEY_URI_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"URI="(.*?)""#).unwrap());

/// One transport-stream segment of a lecture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub sequence: u64,
    pub url: Url,
    pub path: PathBuf,
}

/// Segments of one video, ordered by sequence number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentSet {
    segments: BTreeMap<u64, Segment>,
}

impl SegmentSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a segment; returns `false` and keeps the existing entry when the
    /// sequence number is already present.
    pub fn insert(&mut self, segment: Segment) -> bool {
        if self.segments.contains_key(&segment.sequence) {
            return false;
        }
        self.segments.insert(segment.sequence, segment);
        true
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Iterates in ascending sequence order.
    pub fn iter(&self) -> impl Iterator<Item = &Segment> {
        self.segments.values()
    }

    pub fn sequences(&self) -> Vec<u64> {
        self.segments.keys().copied().collect()
    }
}

impl FromIterator<Segment> for SegmentSet {
    fn from_iter<I: IntoIterator<Item = Segment>>(iter: I) -> Self {
        let mut set = SegmentSet::new();
        for segment in iter {
            set.insert(segment);
        }
        set
    }
}

impl<'a> IntoIterator for &'a SegmentSet {
    type Item = &'a Segment;
    type IntoIter = std::collections::btree_map::Values<'a, u64, Segment>;

    fn into_iter(self) -> Self::IntoIter {
        self.segments.values()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPlaylist {
    pub segments: SegmentSet,
    /// Absolute URL of the decryption key, if the playlist names one
    pub key_uri: Option<Url>,
}

/// Base URL segments are resolved against: `<scheme>://<host>/<first path component>/`.
///
/// A playlist sitting directly under the root resolves against the root.
pub fn segment_base_url(playlist_url: &Url) -> Result<Url> {
    let mut base = playlist_url.clone();
    base.set_query(None);
    base.set_fragment(None);

    let components: Vec<&str> = playlist_url
        .path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    match components.as_slice() {
        [first, _, ..] => base.set_path(&format!("/{first}/")),
        _ => base.set_path("/"),
    }

    if base.cannot_be_a_base() {
        return Err(FetchError::Playlist(format!(
            "playlist URL {playlist_url} cannot be used as a base"
        )));
    }
    Ok(base)
}

/// Extracts the segment list and the key URI from a playlist body.
pub fn parse_playlist(body: &str, playlist_url: &Url, segment_dir: &Path) -> Result<ParsedPlaylist> {
    let base = segment_base_url(playlist_url)?;
    let mut segments = SegmentSet::new();

    for line in body.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some(captures) = SEGMENT_RE.captures(line) else {
            debug!(line, "Skipping playlist line without a segment name");
            continue;
        };
        let (Some(name), Some(digits)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        let name = name.as_str();
        let sequence: u64 = digits.as_str().parse().map_err(|e| {
            FetchError::Playlist(format!("segment {name} has an invalid sequence number: {e}"))
        })?;
        let url = base
            .join(name)
            .map_err(|e| FetchError::Playlist(format!("cannot resolve segment {name}: {e}")))?;

        let segment = Segment {
            sequence,
            url,
            path: segment_dir.join(sanitize_file_name(name)),
        };
        if !segments.insert(segment) {
            warn!(sequence, name, "Duplicate segment in playlist, ignoring");
        }
    }

    let key_uri = KEY_URI_RE
        .captures(body)
        .and_then(|captures| captures.get(1))
        .map(|uri| {
            playlist_url.join(uri.as_str()).map_err(|e| {
                FetchError::Playlist(format!("invalid key URI {}: {e}", uri.as_str()))
            })
        })
        .transpose()?;

    debug!(
        segments = segments.len(),
        has_key = key_uri.is_some(),
        "Parsed playlist"
    );
    Ok(ParsedPlaylist { segments, key_uri })
}
