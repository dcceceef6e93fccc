//! Cookie and header state shared by every request of one client.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use reqwest::RequestBuilder;
use reqwest::header::{COOKIE, HeaderMap, HeaderName, HeaderValue, SET_COOKIE};
use tracing::debug;

/// Authentication state attached to outgoing requests.
#[derive(Debug, Clone, Default)]
pub struct Session {
    cookies: BTreeMap<String, String>,
    headers: HeaderMap,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a session from a raw `Cookie` header value such as
    /// `"GCID=abc; SERVERID=def"`.
    pub fn from_cookie_header(raw: &str) -> Self {
        let mut session = Self::new();
        session.merge_cookies(raw.split(';').filter_map(parse_cookie_pair));
        session
    }

    /// Collects every `Set-Cookie` value of a response header map.
    pub fn from_set_cookie_headers(headers: &HeaderMap) -> Self {
        let mut session = Self::new();
        session.merge_cookies(set_cookie_pairs(headers));
        session
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn merge_cookies(&mut self, cookies: impl IntoIterator<Item = (String, String)>) {
        for (name, value) in cookies {
            self.cookies.insert(name, value);
        }
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty() && self.headers.is_empty()
    }

    /// Renders the cookies as a single `Cookie` header value.
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

fn parse_cookie_pair(pair: &str) -> Option<(String, String)> {
    let (name, value) = pair.trim().split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}

fn set_cookie_pairs(headers: &HeaderMap) -> impl Iterator<Item = (String, String)> + '_ {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        // Attributes (Path, Expires, ...) follow the first ';'.
        .filter_map(|value| parse_cookie_pair(value.split(';').next().unwrap_or_default()))
}

/// Shared, lock-protected [`Session`] handle.
#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    inner: Arc<RwLock<Session>>,
}

impl SessionStore {
    pub fn new(session: Session) -> Self {
        Self {
            inner: Arc::new(RwLock::new(session)),
        }
    }

    pub fn replace(&self, session: Session) {
        *self.inner.write() = session;
    }

    pub fn snapshot(&self) -> Session {
        self.inner.read().clone()
    }

    /// Merges cookies rotated by the server into the current session.
    pub fn absorb(&self, headers: &HeaderMap) {
        let mut rotated = set_cookie_pairs(headers).peekable();
        if rotated.peek().is_none() {
            return;
        }
        let mut session = self.inner.write();
        for (name, value) in rotated {
            debug!(cookie = %name, "Session cookie rotated by server");
            session.cookies.insert(name, value);
        }
    }

    /// Attaches the session cookies and headers to a request.
    pub fn apply(&self, mut request: RequestBuilder) -> RequestBuilder {
        let session = self.inner.read();
        if let Some(cookie) = session.cookie_header() {
            request = request.header(COOKIE, cookie);
        }
        for (name, value) in session.headers.iter() {
            request = request.header(name.clone(), value.clone());
        }
        request
    }
}
