//! Interrupt and termination signal handling.

use anyhow::{Context, Result};
use tokio::signal::unix::{SignalKind, signal};

/// Wait for SIGINT or SIGTERM, whichever lands first. Both mean the same
/// thing to us: stop the child and shut the proxy down cleanly.
pub async fn shutdown() -> Result<()> {
    let mut terminate =
        signal(SignalKind::terminate()).context("error installing SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("error waiting for interrupt")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}
