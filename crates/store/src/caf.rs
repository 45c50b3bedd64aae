//! Content-addressable file writer.
//!
//! Bytes are staged into a `tmp`-prefixed temp file in the store directory
//! and hashed as they stream in. `commit` atomically renames the temp file
//! to the lowercase hex of the final digest; until then no reader can
//! observe a partial blob under a digest name. If the writer is dropped
//! without committing, the temp file is removed with it.

use crate::error::{StoreError, StoreResult};
use crate::traits::BlobWriter;
use async_trait::async_trait;
use htvend_core::{Digest, DigestHasher};
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

/// Writer state machine. The temp file is created lazily on the first
/// non-empty write; an empty commit forces it into existence so that the
/// empty blob is still published under the empty-input digest.
enum CafState {
    Initial,
    Writing {
        file: File,
        staged: TempPath,
        hasher: DigestHasher,
    },
    /// Temp file written and closed but not yet renamed. Reached only when
    /// the rename itself failed; `commit` may be retried or `cleanup` will
    /// delete the staged file.
    Closed { staged: TempPath, digest: Digest },
    Committed { digest: Digest },
    Cancelled,
}

impl CafState {
    fn name(&self) -> &'static str {
        match self {
            CafState::Initial => "initial",
            CafState::Writing { .. } => "writing",
            CafState::Closed { .. } => "closed",
            CafState::Committed { .. } => "committed",
            CafState::Cancelled => "cancelled",
        }
    }
}

/// A staged content-addressable file inside a store directory.
pub struct ContentFile {
    dir: PathBuf,
    state: CafState,
}

impl ContentFile {
    /// Create a writer that will publish into `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            state: CafState::Initial,
        }
    }

    /// Path a digest will be published under.
    fn final_path(&self, digest: &Digest) -> PathBuf {
        self.dir.join(digest.to_hex())
    }

    async fn stage(dir: &Path) -> StoreResult<(File, TempPath)> {
        tokio::fs::create_dir_all(dir).await?;
        let (file, staged) = tempfile::Builder::new()
            .prefix("tmp")
            .tempfile_in(dir)?
            .into_parts();
        Ok((File::from_std(file), staged))
    }

    /// Rename the staged file into place. An existing file with the same
    /// digest name holds identical content, so being replaced is harmless.
    fn publish(&mut self, staged: TempPath, digest: Digest) -> StoreResult<Digest> {
        match staged.persist(self.final_path(&digest)) {
            Ok(()) => {
                self.state = CafState::Committed { digest };
                Ok(digest)
            }
            Err(e) => {
                let io = e.error;
                self.state = CafState::Closed {
                    staged: e.path,
                    digest,
                };
                Err(StoreError::Io(io))
            }
        }
    }
}

#[async_trait]
impl BlobWriter for ContentFile {
    async fn write(&mut self, data: &[u8]) -> StoreResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        if let CafState::Initial = self.state {
            let (file, staged) = Self::stage(&self.dir).await?;
            self.state = CafState::Writing {
                file,
                staged,
                hasher: DigestHasher::new(),
            };
        }
        match &mut self.state {
            CafState::Writing { file, hasher, .. } => {
                file.write_all(data).await?;
                hasher.update(data);
                Ok(())
            }
            other => Err(StoreError::InvalidState {
                state: other.name(),
                operation: "write",
            }),
        }
    }

    async fn commit(&mut self) -> StoreResult<Digest> {
        match std::mem::replace(&mut self.state, CafState::Cancelled) {
            CafState::Initial => {
                // Empty input: force the temp file into existence so the
                // empty blob is still published.
                let (file, staged) = Self::stage(&self.dir).await?;
                drop(file);
                self.publish(staged, DigestHasher::new().finalize())
            }
            CafState::Writing {
                mut file,
                staged,
                hasher,
            } => {
                file.flush().await?;
                file.sync_all().await?;
                drop(file);
                self.publish(staged, hasher.finalize())
            }
            CafState::Closed { staged, digest } => self.publish(staged, digest),
            CafState::Committed { digest } => {
                self.state = CafState::Committed { digest };
                Ok(digest)
            }
            CafState::Cancelled => Err(StoreError::InvalidState {
                state: "cancelled",
                operation: "commit",
            }),
        }
    }

    async fn cleanup(&mut self) -> StoreResult<()> {
        match std::mem::replace(&mut self.state, CafState::Cancelled) {
            CafState::Writing { file, staged, .. } => {
                drop(file);
                staged.close()?;
                Ok(())
            }
            CafState::Closed { staged, .. } => {
                staged.close()?;
                Ok(())
            }
            CafState::Committed { digest } => {
                // Committed data is kept; cleanup only discards staging.
                self.state = CafState::Committed { digest };
                Ok(())
            }
            CafState::Initial | CafState::Cancelled => Ok(()),
        }
    }
}
