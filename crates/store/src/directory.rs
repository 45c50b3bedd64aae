//! Flat directory blob store.

use crate::caf::ContentFile;
use crate::error::{StoreError, StoreResult};
use crate::traits::{BlobStore, BlobWriter, ByteStream};
use async_trait::async_trait;
use bytes::Bytes;
use htvend_core::Digest;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncReadExt;

/// Chunk size for streaming blob reads (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Blob store over a flat directory: each blob is one file named by the
/// lowercase hex of its SHA-256. Writes stage through [`ContentFile`], so
/// concurrent access needs no locking beyond the filesystem's atomic rename.
pub struct DirectoryStore {
    dir: PathBuf,
    writable: bool,
}

impl DirectoryStore {
    /// Create a store over `dir`. The directory is created lazily on first
    /// write; a read-only store over a missing directory simply has no blobs.
    pub fn new(dir: impl Into<PathBuf>, writable: bool) -> Self {
        Self {
            dir: dir.into(),
            writable,
        }
    }

    /// The directory blobs live in.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn resolve(&self, digest: &Digest) -> PathBuf {
        self.dir.join(digest.to_hex())
    }

    fn require_writable(&self) -> StoreResult<()> {
        if self.writable {
            Ok(())
        } else {
            Err(StoreError::NotWritable)
        }
    }
}

#[async_trait]
impl BlobStore for DirectoryStore {
    async fn get(&self, digest: &Digest) -> StoreResult<ByteStream> {
        let path = self.resolve(digest);
        let file = fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound(digest.to_hex())
            } else {
                StoreError::Io(e)
            }
        })?;

        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(Box::pin(stream))
    }

    async fn exists(&self, digest: &Digest) -> StoreResult<bool> {
        Ok(fs::try_exists(self.resolve(digest)).await?)
    }

    async fn put(&self) -> StoreResult<Box<dyn BlobWriter>> {
        self.require_writable()?;
        Ok(Box::new(ContentFile::new(&self.dir)))
    }

    async fn destroy(&self) -> StoreResult<()> {
        self.require_writable()?;
        tracing::info!(dir = %self.dir.display(), "removing blob store");
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn remove_except(&self, keep: &HashSet<String>) -> StoreResult<()> {
        self.require_writable()?;
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StoreError::Io(e)),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !keep.contains(&name) {
                tracing::info!(blob = %name, "removing unreferenced blob");
                fs::remove_file(entry.path()).await?;
            }
        }
        Ok(())
    }
}
