//! `htvend build`: run a command under the proxy, recording what it fetches.

use crate::listener::run_with_child;
use crate::options::{FetchArgs, ListenerArgs, ManifestArgs, upstream_client};
use anyhow::{Context, Result};
use clap::Args;
use htvend_core::UrlMatcher;
use htvend_manifest::{Manifest, ManifestOptions};
use htvend_proxy::PipelineContext;
use htvend_proxy::rpc::RpcState;
use std::sync::Arc;

#[derive(Args, Debug)]
pub struct BuildArgs {
    #[command(flatten)]
    pub manifest: ManifestArgs,

    #[command(flatten)]
    pub fetch: FetchArgs,

    /// If set, ignore any existing recorded digests and refetch everything
    #[arg(long = "force-refresh")]
    pub force_refresh: bool,

    /// Allow replacing entries whose upstream content changed
    #[arg(long = "allow-overwrite")]
    pub allow_overwrite: bool,

    #[command(flatten)]
    pub listener: ListenerArgs,
}

pub async fn run(args: BuildArgs) -> Result<()> {
    let no_cache_patterns = args.fetch.no_cache_patterns();
    let blobs = args.manifest.make_blob_store(true);

    let cache = args
        .manifest
        .open_global_cache(UrlMatcher::new(&no_cache_patterns)?)?;
    let assets = Arc::new(
        Manifest::open(ManifestOptions {
            path: args.manifest.manifest_file.clone(),
            writable: true,
            allow_overwrite: args.allow_overwrite,
            no_cache: UrlMatcher::new(&no_cache_patterns)?,
            fallback: Some(cache.clone()),
            ..Default::default()
        })
        .context("error opening manifest file")?,
    );

    // A rebuild starts from a clean slate but may rehydrate unchanged
    // entries from the previous run, unless a refresh was forced.
    assets
        .reset(args.force_refresh)
        .context("error resetting manifest file")?;

    let ctx = Arc::new(PipelineContext {
        assets: assets.clone(),
        blobs: blobs.clone(),
        fetch_if_missing: true,
        fail_if_missing: false,
        dummy_ok: None,
        headers_to_cache: args.fetch.header_allow_list(),
        client: upstream_client()?,
    });
    let rpc_state = RpcState {
        assets: assets.clone(),
        blobs: blobs.clone(),
    };

    let result = run_with_child(&args.listener, ctx, rpc_state).await;

    assets.close().context("error closing manifest file")?;
    cache.close().context("error closing global cache")?;
    result
}
