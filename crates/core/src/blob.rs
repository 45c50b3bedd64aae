//! Recorded blob metadata and the response-header allow-list.

use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Metadata recorded in the manifest for one URL key: the blob digest plus
/// the retained response headers.
///
/// Two `BlobInfo`s are equal iff the digest and the exact header map agree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobInfo {
    /// Blob digest as 64 lowercase hex characters.
    #[serde(rename = "Sha256")]
    pub sha256: String,

    /// Retained response headers, canonical name to first value.
    #[serde(rename = "Headers", default)]
    pub headers: BTreeMap<String, String>,
}

impl BlobInfo {
    /// Create a BlobInfo with no retained headers.
    pub fn new(sha256: impl Into<String>) -> Self {
        Self {
            sha256: sha256.into(),
            headers: BTreeMap::new(),
        }
    }
}

/// The set of response headers worth retaining in the manifest.
///
/// Names are kept in canonical MIME form (`Content-Type`), matching the
/// on-disk manifest format; lookups are case-insensitive. Only the first
/// value of each header is kept.
#[derive(Clone, Debug)]
pub struct HeaderAllowList {
    names: HashSet<String>,
}

impl HeaderAllowList {
    /// Build an allow-list from header names in any case.
    pub fn new<S: AsRef<str>>(names: &[S]) -> Self {
        Self {
            names: names
                .iter()
                .map(|n| canonical_header_name(n.as_ref()))
                .collect(),
        }
    }

    /// Keep the first value of each allow-listed header.
    ///
    /// Values that are not valid UTF-8 are skipped; the manifest is a text
    /// format and such headers are not replayable from it anyway.
    pub fn filter(&self, headers: &HeaderMap) -> BTreeMap<String, String> {
        let mut kept = BTreeMap::new();
        for name in headers.keys() {
            let canonical = canonical_header_name(name.as_str());
            if !self.names.contains(&canonical) {
                continue;
            }
            if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
                kept.entry(canonical).or_insert_with(|| value.to_string());
            }
        }
        kept
    }
}

impl Default for HeaderAllowList {
    fn default() -> Self {
        Self::new(crate::DEFAULT_CACHE_HEADERS)
    }
}

/// Canonical MIME header form: each dash-separated segment capitalized.
fn canonical_header_name(name: &str) -> String {
    name.split('-')
        .map(|seg| {
            let mut chars = seg.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}
