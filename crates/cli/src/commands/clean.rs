//! `htvend clean`: garbage-collect the shared global cache.

use crate::options::ManifestArgs;
use anyhow::{Context, Result};
use clap::Args;
use htvend_core::UrlMatcher;
use htvend_proxy::walker;
use htvend_store::BlobStore;
use url::Url;

#[derive(Args, Debug)]
pub struct CleanArgs {
    #[command(flatten)]
    pub manifest: ManifestArgs,

    /// If set, remove the entire shared global cache
    #[arg(long = "all")]
    pub all: bool,

    /// URL to remove from the global cache (repeatable)
    #[arg(short = 'u', long = "url")]
    pub urls: Vec<String>,
}

pub async fn run(args: CleanArgs) -> Result<()> {
    let cache = args.manifest.open_global_cache(UrlMatcher::empty())?;

    for raw in &args.urls {
        let url = Url::parse(raw).with_context(|| format!("error parsing URL {raw:?}"))?;
        cache.remove_entry(&url).context("error removing entry")?;
    }

    // Entries without a digest reference nothing and cannot be replayed;
    // drop them unconditionally.
    let dead: Vec<Url> = cache
        .snapshot()
        .into_iter()
        .filter(|(_, info)| info.sha256.is_empty())
        .filter_map(|(key, _)| Url::parse(&key).ok())
        .collect();
    for url in dead {
        cache.remove_entry(&url).context("error removing entry")?;
    }

    let blobs = args.manifest.make_blob_store(true);

    if args.all {
        cache
            .close_and_destroy()
            .context("error destroying global cache manifest")?;
        blobs.destroy().await.context("error destroying blob store")?;
        return Ok(());
    }

    walker::remove_unreferenced(&cache, blobs.as_ref())
        .await
        .context("error removing unreferenced blobs")?;
    cache.close().context("error closing global cache")?;
    Ok(())
}
