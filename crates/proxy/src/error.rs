//! Proxy error types.

use thiserror::Error;

/// Errors from the proxy server, pipeline and walker.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("certificate generation failed: {0}")]
    Certificate(#[from] rcgen::Error),

    #[error("TLS config build failed: {0}")]
    TlsConfig(#[from] rustls::Error),

    #[error("registry auth failed: {0}")]
    Unauthorized(String),

    #[error("upstream transport error: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("manifest references blob {digest} for {key}, but the store does not have it")]
    MissingBlob { key: String, digest: String },

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("{}", .0.join("; "))]
    Aggregate(Vec<String>),

    #[error("store error: {0}")]
    Store(#[from] htvend_store::StoreError),

    #[error("manifest error: {0}")]
    Manifest(#[from] htvend_manifest::ManifestError),

    #[error("core error: {0}")]
    Core(#[from] htvend_core::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] http::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for proxy operations.
pub type ProxyResult<T> = std::result::Result<T, ProxyError>;
