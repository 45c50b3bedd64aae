//! Verify / export walker over manifest entries.
//!
//! Walks every manifest entry against the blob store: detecting missing and
//! corrupted blobs, optionally exporting blobs to a directory, copying them
//! into a second store, and refetching what a repair needs.

use crate::error::{ProxyError, ProxyResult};
use crate::pipeline::{PipelineContext, fetch_and_save};
use futures::StreamExt;
use htvend_core::{BlobInfo, Digest, DigestHasher, fingerprint};
use htvend_manifest::Manifest;
use htvend_store::{BlobStore, StoreError};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinSet;
use url::Url;

/// What the walker should do with what it finds.
#[derive(Debug, Default)]
pub struct WalkerOptions {
    /// Write each blob to `<export_dir>/<hex digest>` while walking.
    pub export_dir: Option<PathBuf>,

    /// Rehash each blob and flag mismatches against the declared digest.
    pub validate_digests: bool,

    /// Missing blobs are an error.
    pub fail_if_missing: bool,
    /// Missing blobs are refetched through the pipeline's save path.
    pub fetch_if_missing: bool,
    /// Corrupted blobs are refetched too (the manifest must allow
    /// overwrites for the new digest to land).
    pub repair: bool,
}

/// Walk every manifest entry, then resolve what was found.
///
/// Per-entry failures accumulate; the walk always covers the whole
/// manifest before the aggregated error is returned.
pub async fn verify(ctx: &PipelineContext, opts: &WalkerOptions) -> ProxyResult<()> {
    if let Some(dir) = &opts.export_dir {
        tokio::fs::create_dir_all(dir).await?;
    }

    let mut missing: Vec<Url> = Vec::new();
    let mut wrong_hash: Vec<(Url, BlobInfo, Digest)> = Vec::new();

    for (key, info) in ctx.assets.snapshot() {
        tracing::info!(key = %key, "verifying");
        let url = Url::parse(&key)
            .map_err(|e| ProxyError::BadRequest(format!("bad manifest key {key:?}: {e}")))?;
        let digest = Digest::from_hex(&info.sha256)?;

        let mut stream = match ctx.blobs.get(&digest).await {
            Ok(stream) => stream,
            Err(StoreError::NotFound(_)) => {
                missing.push(url);
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let mut export_file = match &opts.export_dir {
            Some(dir) => Some(tokio::fs::File::create(dir.join(digest.to_hex())).await?),
            None => None,
        };
        let mut hasher = opts.validate_digests.then(DigestHasher::new);

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if let Some(file) = export_file.as_mut() {
                file.write_all(&chunk).await?;
            }
            if let Some(hasher) = hasher.as_mut() {
                hasher.update(&chunk);
            }
        }
        if let Some(mut file) = export_file.take() {
            file.flush().await?;
        }
        if let Some(hasher) = hasher.take() {
            let actual = hasher.finalize();
            if actual != digest {
                wrong_hash.push((url, info, actual));
            }
        }
    }

    let mut failures: Vec<String> = Vec::new();

    for url in &missing {
        if opts.fail_if_missing {
            failures.push(format!("missing asset: {}", fingerprint(url)));
        } else if opts.fetch_if_missing {
            fetch_and_save(ctx, url).await?;
        }
    }

    for (url, info, actual) in &wrong_hash {
        if opts.repair {
            tracing::warn!(url = %fingerprint(url), "refetching corrupted asset");
            fetch_and_save(ctx, url).await?;
        } else {
            failures.push(format!(
                "wrong hash for {}: expected {} have {}",
                fingerprint(url),
                info.sha256,
                actual.to_hex()
            ));
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(ProxyError::Aggregate(failures))
    }
}

/// Copy every blob the manifest references from `src` into `dst`.
///
/// Copies run concurrently, one task per unique digest. The first failure
/// is reported through `on_error` and returned, but every task runs to
/// completion either way.
pub async fn export(
    assets: &Manifest,
    src: Arc<dyn BlobStore>,
    dst: Arc<dyn BlobStore>,
    on_error: impl Fn(&ProxyError),
) -> ProxyResult<()> {
    let mut digests: HashSet<String> = HashSet::new();
    for (_key, info) in assets.snapshot() {
        // normalize through a parse so equivalent spellings dedupe
        digests.insert(Digest::from_hex(&info.sha256)?.to_hex());
    }

    let mut tasks = JoinSet::new();
    for hex in digests {
        let digest = Digest::from_hex(&hex)?;
        let src = src.clone();
        let dst = dst.clone();
        tasks.spawn(async move { ensure_blob_exported(src, dst, digest).await });
    }

    let mut first_error: Option<ProxyError> = None;
    while let Some(joined) = tasks.join_next().await {
        let result = match joined {
            Ok(result) => result,
            Err(e) => Err(ProxyError::BadRequest(format!("export task panicked: {e}"))),
        };
        if let Err(e) = result {
            if first_error.is_none() {
                on_error(&e);
                first_error = Some(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Copy one blob into `dst` unless it is already there, cross-checking the
/// digest that comes out of the staged write.
async fn ensure_blob_exported(
    src: Arc<dyn BlobStore>,
    dst: Arc<dyn BlobStore>,
    digest: Digest,
) -> ProxyResult<()> {
    if dst.exists(&digest).await? {
        tracing::info!(%digest, "already in destination store, skipping");
        return Ok(());
    }

    tracing::info!(%digest, "copying blob to destination store");
    let mut stream = src.get(&digest).await?;
    let mut writer = dst.put().await?;
    let result: ProxyResult<()> = async {
        while let Some(chunk) = stream.next().await {
            writer.write(&chunk?).await?;
        }
        let actual = writer.commit().await?;
        if actual != digest {
            return Err(ProxyError::Store(StoreError::DigestMismatch {
                expected: digest.to_hex(),
                actual: actual.to_hex(),
            }));
        }
        Ok(())
    }
    .await;
    writer.cleanup().await?;
    result
}

/// Delete every blob the manifest does not reference.
pub async fn remove_unreferenced(assets: &Manifest, blobs: &dyn BlobStore) -> ProxyResult<()> {
    let keep: HashSet<String> = assets
        .snapshot()
        .into_values()
        .map(|info| info.sha256)
        .collect();
    blobs.remove_except(&keep).await?;
    Ok(())
}
