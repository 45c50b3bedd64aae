//! `htvend verify`: check that every manifest entry is backed by an intact
//! blob, optionally fetching what is missing or rotten.

use crate::options::{FetchArgs, ManifestArgs, upstream_client};
use anyhow::{Context, Result};
use clap::Args;
use htvend_core::UrlMatcher;
use htvend_manifest::{Manifest, ManifestOptions};
use htvend_proxy::{PipelineContext, WalkerOptions, walker};
use std::sync::Arc;

#[derive(Args, Debug)]
pub struct VerifyArgs {
    #[command(flatten)]
    pub manifest: ManifestArgs,

    #[command(flatten)]
    pub fetch: FetchArgs,

    /// If set, fetch missing assets
    #[arg(long = "fetch")]
    pub fetch_missing: bool,

    /// If set, refetch missing or corrupted assets and update the manifest
    /// (implies --fetch). A rebuild may still be needed afterwards.
    #[arg(long = "repair")]
    pub repair: bool,
}

pub async fn run(args: VerifyArgs) -> Result<()> {
    let fetch = args.fetch_missing || args.repair;
    let no_cache = UrlMatcher::new(&args.fetch.no_cache_patterns())?;

    let fallback = if args.repair {
        Some(
            args.manifest
                .open_global_cache(UrlMatcher::new(&args.fetch.no_cache_patterns())?)?,
        )
    } else {
        None
    };
    let assets = Arc::new(
        Manifest::open(ManifestOptions {
            path: args.manifest.manifest_file.clone(),
            writable: args.repair,
            allow_overwrite: args.repair,
            no_cache,
            fallback: fallback.clone(),
            ..Default::default()
        })
        .context("error opening manifest file")?,
    );
    let blobs = args.manifest.make_blob_store(fetch);

    let ctx = PipelineContext {
        assets: assets.clone(),
        blobs: blobs.clone(),
        fetch_if_missing: fetch,
        fail_if_missing: !fetch,
        dummy_ok: None,
        headers_to_cache: args.fetch.header_allow_list(),
        client: upstream_client()?,
    };

    let result = walker::verify(
        &ctx,
        &WalkerOptions {
            export_dir: None,
            validate_digests: true,
            fail_if_missing: !fetch,
            fetch_if_missing: fetch,
            repair: args.repair,
        },
    )
    .await;

    assets.close().context("error closing manifest file")?;
    if let Some(cache) = fallback {
        cache.close().context("error closing global cache")?;
    }
    result.context("verification failed")
}
