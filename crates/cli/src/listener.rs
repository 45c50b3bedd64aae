//! Running the proxy around a subprocess or as a daemon.

use crate::options::ListenerArgs;
use crate::subprocess;
use anyhow::{Context, Result, bail};
use htvend_proxy::rpc::{self, RpcState};
use htvend_proxy::{PipelineContext, serve_until_done};
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Serve the proxy for the lifetime of the configured child: either the
/// given command (or `$SHELL`), or — with `--daemon` — until interrupted.
pub async fn run_with_child(
    args: &ListenerArgs,
    ctx: Arc<PipelineContext>,
    rpc_state: RpcState,
) -> Result<()> {
    let daemon = args.daemon;
    let command = args.command.clone();
    let rpc_socket = args.daemon_rpc_socket.clone();

    serve_until_done(args.server_config(), ctx, move |proxy_addr, ca_pem| async move {
        if !daemon {
            return subprocess::run(&command, proxy_addr, &ca_pem).await;
        }
        if !command.is_empty() {
            bail!(
                "if running as a daemon, no command should be specified; received: {}",
                command.join(" ")
            );
        }
        run_daemon(proxy_addr, ca_pem, rpc_socket, rpc_state).await
    })
    .await?
}

async fn run_daemon(
    proxy_addr: SocketAddr,
    ca_pem: String,
    rpc_socket: Option<PathBuf>,
    rpc_state: RpcState,
) -> Result<()> {
    let mut ca_file = tempfile::Builder::new()
        .prefix("htvend-ca")
        .suffix(".pem")
        .tempfile()
        .context("error creating CA bundle temp file")?;
    ca_file
        .write_all(ca_pem.as_bytes())
        .context("error writing CA bundle")?;

    let shutdown = CancellationToken::new();
    let rpc_task = rpc_socket.map(|path| {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { rpc::serve_unix(&path, rpc_state, shutdown).await })
    });

    tracing::info!("daemon running");
    for var in ["HTTP_PROXY", "HTTPS_PROXY", "http_proxy", "https_proxy"] {
        println!("export {var}=http://{proxy_addr}");
    }
    for var in ["NO_PROXY", "no_proxy"] {
        println!("export {var}=");
    }
    println!("export SSL_CERT_FILE={}", ca_file.path().display());

    crate::signals::shutdown().await?;
    shutdown.cancel();
    if let Some(task) = rpc_task {
        task.await
            .context("daemon RPC task panicked")?
            .context("daemon RPC server failed")?;
    }
    Ok(())
}
