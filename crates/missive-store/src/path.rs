//! Hierarchical store paths.
//!
//! A path is a list of segments joined by `/`. Segments are escaped so a
//! caller-supplied key can never introduce extra levels.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorePath(String);

fn escape(segment: &str) -> String {
    segment.replace('%', "%25").replace('/', "%2F")
}

pub(crate) fn unescape(segment: &str) -> String {
    segment.replace("%2F", "/").replace("%25", "%")
}

impl StorePath {
    /// A single-segment root path.
    pub fn root(segment: &str) -> Self {
        Self(escape(segment))
    }

    /// Child path one level below `self`.
    pub fn join(&self, segment: impl AsRef<str>) -> Self {
        Self(format!("{}/{}", self.0, escape(segment.as_ref())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The last segment, unescaped.
    pub fn name(&self) -> String {
        unescape(self.0.rsplit('/').next().unwrap_or(&self.0))
    }

    /// Lower bound (inclusive) of every descendant key.
    pub(crate) fn descendants_start(&self) -> String {
        format!("{}/", self.0)
    }

    /// Upper bound (exclusive) of every descendant key; `'0'` follows `'/'`.
    pub(crate) fn descendants_end(&self) -> String {
        format!("{}0", self.0)
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
