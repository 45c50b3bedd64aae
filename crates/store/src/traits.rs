//! Blob store trait definitions.

use crate::error::StoreResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use htvend_core::Digest;
use std::collections::HashSet;
use std::pin::Pin;

/// A boxed stream of bytes for streaming blob reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StoreResult<Bytes>> + Send>>;

/// A set of blobs addressed by their SHA-256 digest.
///
/// Writes go through a staged [`BlobWriter`]; a blob only becomes visible
/// under its digest once the writer commits. Reads of a concurrently
/// written digest therefore never observe partial content.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Open a blob for streaming read. Returns [`crate::StoreError::NotFound`]
    /// when the digest is absent.
    async fn get(&self, digest: &Digest) -> StoreResult<ByteStream>;

    /// Check whether a blob exists.
    async fn exists(&self, digest: &Digest) -> StoreResult<bool>;

    /// Start a staged write. The eventual address is decided by the bytes
    /// written, not by the caller.
    async fn put(&self) -> StoreResult<Box<dyn BlobWriter>>;

    /// Remove the entire store.
    async fn destroy(&self) -> StoreResult<()>;

    /// Delete every blob whose hex digest is not in `keep`.
    async fn remove_except(&self, keep: &HashSet<String>) -> StoreResult<()>;
}

/// A staged blob write: accumulate bytes, then either commit (atomically
/// publishing under the content digest) or clean up.
///
/// `commit` is idempotent: a second call returns the same digest without
/// touching the filesystem. `cleanup` after a successful commit is a no-op,
/// so callers can unconditionally defer it.
#[async_trait]
pub trait BlobWriter: Send {
    /// Append bytes to the staged blob.
    async fn write(&mut self, data: &[u8]) -> StoreResult<()>;

    /// Publish the staged bytes under their digest and return it.
    async fn commit(&mut self) -> StoreResult<Digest>;

    /// Discard staged state. Safe to call in any state, any number of times.
    async fn cleanup(&mut self) -> StoreResult<()>;
}
