//! `htvend offline`: run a command against recorded assets only.

use crate::listener::run_with_child;
use crate::options::{ListenerArgs, ManifestArgs, upstream_client};
use anyhow::{Context, Result};
use clap::Args;
use htvend_core::UrlMatcher;
use htvend_manifest::{Manifest, ManifestOptions};
use htvend_proxy::PipelineContext;
use htvend_proxy::rpc::RpcState;
use std::sync::Arc;

#[derive(Args, Debug)]
pub struct OfflineArgs {
    #[command(flatten)]
    pub manifest: ManifestArgs,

    /// Regex list of URLs that get a dummy 200 OK reply. Useful for some
    /// Docker clients. [default: ^http.*/v2/$]
    #[arg(long = "dummy-ok-response")]
    pub dummy_ok: Vec<String>,

    #[command(flatten)]
    pub listener: ListenerArgs,
}

pub async fn run(args: OfflineArgs) -> Result<()> {
    let blobs = args.manifest.make_blob_store(false);
    let assets = Arc::new(
        Manifest::open(ManifestOptions {
            path: args.manifest.manifest_file.clone(),
            ..Default::default()
        })
        .context("error opening manifest file")?,
    );

    let dummy_ok = if args.dummy_ok.is_empty() {
        UrlMatcher::new(htvend_core::DEFAULT_DUMMY_OK_PATTERNS)?
    } else {
        UrlMatcher::new(&args.dummy_ok)?
    };

    let ctx = Arc::new(PipelineContext {
        assets: assets.clone(),
        blobs: blobs.clone(),
        fetch_if_missing: false,
        fail_if_missing: true,
        dummy_ok: Some(dummy_ok),
        headers_to_cache: htvend_core::HeaderAllowList::default(),
        client: upstream_client()?,
    });
    let rpc_state = RpcState {
        assets: assets.clone(),
        blobs: blobs.clone(),
    };

    let result = run_with_child(&args.listener, ctx, rpc_state).await;

    assets.close().context("error closing manifest file")?;
    result
}
