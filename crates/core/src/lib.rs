//! Core domain types for the htvend vendoring proxy.
//!
//! This crate defines the data model shared by the store, manifest, proxy
//! and CLI crates:
//! - Content digests and incremental hashing
//! - URL fingerprinting and regex-list matching
//! - Recorded blob metadata and the response-header allow-list

pub mod blob;
pub mod error;
pub mod hash;
pub mod urlkey;

pub use blob::{BlobInfo, HeaderAllowList};
pub use error::{Error, Result};
pub use hash::{Digest, DigestHasher};
pub use urlkey::{UrlMatcher, fingerprint, request_url};

/// Response headers retained in the manifest by default.
pub const DEFAULT_CACHE_HEADERS: &[&str] = &[
    "Content-Length",
    "Content-Type",
    "Content-Encoding",
    "Docker-Content-Digest",
    "X-Checksum-Sha1",
];

/// URL patterns never persisted to a manifest by default. These match
/// dynamic registry discovery and token endpoints.
pub const DEFAULT_NO_CACHE_PATTERNS: &[&str] = &["^http.*/v2/$", "/token\\?"];

/// URL patterns answered with an empty 200 in offline mode by default.
pub const DEFAULT_DUMMY_OK_PATTERNS: &[&str] = &["^http.*/v2/$"];
