//! Per-request state carried through the filter chain.
//!
//! A [`RequestScope`] is created by the entry filter, attached to the request
//! extensions, and read or mutated by every downstream filter. Filters within
//! a single request run sequentially, so the interior lock is uncontended.

use std::sync::Mutex;

use crate::identity::Identity;

pub struct RequestScope {
    path: String,
    raw_path: String,
    inner: Mutex<ScopeState>,
}

#[derive(Default)]
struct ScopeState {
    identity: Option<Identity>,
    access_denied: bool,
}

impl RequestScope {
    /// Captures the request path exactly as it arrived, before normalization.
    pub fn new(raw_path: &str) -> Self {
        Self {
            path: percent_decode(raw_path),
            raw_path: raw_path.to_string(),
            inner: Mutex::new(ScopeState::default()),
        }
    }

    /// The decoded request path as it arrived.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The escaped request path as it arrived.
    pub fn raw_path(&self) -> &str {
        &self.raw_path
    }

    pub fn identity(&self) -> Option<Identity> {
        self.inner.lock().unwrap().identity.clone()
    }

    pub fn set_identity(&self, identity: Identity) {
        self.inner.lock().unwrap().identity = Some(identity);
    }

    /// Swaps the identity's raw token in place after a successful refresh, so
    /// downstream filters observe the newly issued access token.
    pub fn update_raw_token(&self, raw_token: String) {
        if let Some(identity) = self.inner.lock().unwrap().identity.as_mut() {
            identity.raw_token = raw_token;
        }
    }

    pub fn deny(&self) {
        self.inner.lock().unwrap().access_denied = true;
    }

    pub fn is_denied(&self) -> bool {
        self.inner.lock().unwrap().access_denied
    }
}

/// Normalizes a request path so resource matching cannot be bypassed with
/// `..` segments or duplicate slashes: `/admin/../secret` and `/admin//x`
/// must match the rules of the paths they resolve to.
///
/// Dot segments are resolved (`..` collapsing into its parent), runs of `/`
/// collapse to one, and the result always begins with `/`. The query string
/// is untouched because only the path is passed in. Idempotent.
pub fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    let mut normalized = String::with_capacity(path.len() + 1);
    for segment in &segments {
        normalized.push('/');
        normalized.push_str(segment);
    }

    if normalized.is_empty() {
        normalized.push('/');
    }

    if path.ends_with('/') && normalized != "/" {
        normalized.push('/');
    }

    normalized
}

/// Decodes `%XX` escapes, leaving malformed escapes in place.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2]))
        {
            decoded.push(hi << 4 | lo);
            i += 3;
        } else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8_lossy(&decoded).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
