//! Normalized fingerprints used for duplicate detection and change tracking.

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

static MARKUP_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("valid regex"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Normalize a title for duplicate comparison.
///
/// Markup tags such as `<i>` are stripped, whitespace runs collapse to a
/// single space, and the result is trimmed and lowercased. An empty input
/// yields an empty fingerprint, which callers must never treat as a match.
pub fn normalize_title(title: &str) -> String {
    let stripped = MARKUP_TAG.replace_all(title, "");
    let collapsed = WHITESPACE.replace_all(&stripped, " ");
    collapsed.trim().to_lowercase()
}

/// Normalize a tag the way notes store them: `#Machine Learning` → `machine-learning`.
pub fn normalize_tag(tag: &str) -> String {
    let trimmed = tag.trim().trim_start_matches('#').trim();
    WHITESPACE.replace_all(trimmed, "-").to_lowercase()
}

/// SHA-256 digest of file content, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn from_content(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
