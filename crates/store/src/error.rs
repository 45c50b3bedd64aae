//! Storage error types.

use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("blob store is not writable")]
    NotWritable,

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("writer is {state}, cannot {operation}")]
    InvalidState {
        state: &'static str,
        operation: &'static str,
    },

    #[error("invalid digest: {0}")]
    InvalidDigest(#[from] htvend_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
