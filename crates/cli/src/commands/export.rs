//! `htvend export`: copy referenced blobs into another store directory.

use crate::options::ManifestArgs;
use anyhow::{Context, Result};
use clap::Args;
use htvend_manifest::{Manifest, ManifestOptions};
use htvend_proxy::walker;
use htvend_store::DirectoryStore;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Args, Debug)]
pub struct ExportArgs {
    #[command(flatten)]
    pub manifest: ManifestArgs,

    /// Destination blob store directory
    #[arg(long = "dest-dir")]
    pub dest_dir: PathBuf,
}

pub async fn run(args: ExportArgs) -> Result<()> {
    let assets = Manifest::open(ManifestOptions {
        path: args.manifest.manifest_file.clone(),
        ..Default::default()
    })
    .context("error opening manifest file")?;

    let src = args.manifest.make_blob_store(false);
    let dst = Arc::new(DirectoryStore::new(&args.dest_dir, true));

    let result = walker::export(&assets, src, dst, |e| {
        tracing::error!(error = %e, "error during parallel export");
    })
    .await;

    assets.close().context("error closing manifest file")?;
    result.context("export failed")
}
