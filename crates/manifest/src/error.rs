//! Manifest error types.

use thiserror::Error;

/// Manifest operation errors.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest lock on {path} is held by another process: {reason}")]
    LockContended { path: String, reason: String },

    #[error("manifest {path} is malformed: {reason}")]
    BadManifest { path: String, reason: String },

    #[error("wrong SHA256 for {key}: expected {expected}, received {actual} (or different headers)")]
    DigestMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("manifest is not writable")]
    NotWritable,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for manifest operations.
pub type ManifestResult<T> = std::result::Result<T, ManifestError>;
