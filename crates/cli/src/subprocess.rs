//! Child-process launch with the proxy environment injected.

use anyhow::{Context, Result, bail};
use std::io::Write;
use std::net::SocketAddr;

/// Environment variables pointed at the proxy.
const PROXY_VARS: &[&str] = &["HTTP_PROXY", "HTTPS_PROXY", "http_proxy", "https_proxy"];
/// Environment variables cleared so nothing bypasses the proxy.
const NO_PROXY_VARS: &[&str] = &["NO_PROXY", "no_proxy"];

/// Run `command` (or an interactive `$SHELL` when empty) with the proxy and
/// trust-bundle environment set, waiting for it to exit.
pub async fn run(command: &[String], proxy_addr: SocketAddr, ca_pem: &str) -> Result<()> {
    // The CA PEM lives in a temp file for the child's lifetime.
    let mut ca_file = tempfile::Builder::new()
        .prefix("htvend-ca")
        .suffix(".pem")
        .tempfile()
        .context("error creating CA bundle temp file")?;
    ca_file
        .write_all(ca_pem.as_bytes())
        .context("error writing CA bundle")?;

    let mut argv = command.to_vec();
    let mut shell_prompt = None;
    if argv.is_empty() {
        let shell = std::env::var("SHELL")
            .context("no command specified, and unable to find SHELL to default to")?;
        argv = vec![shell.clone()];
        if shell.ends_with("bash") {
            argv.push("--norc".to_string());
            shell_prompt = Some("(htvend) \\$ ".to_string());
        }
        tracing::info!("entering shell with env set to use proxy; exit or ctrl-D to finish");
    }

    let proxy_url = format!("http://{proxy_addr}");
    let mut cmd = tokio::process::Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    for var in PROXY_VARS {
        cmd.env(var, &proxy_url);
    }
    for var in NO_PROXY_VARS {
        cmd.env(var, "");
    }
    cmd.env("SSL_CERT_FILE", ca_file.path());
    if let Some(prompt) = shell_prompt {
        cmd.env("PS1", prompt);
    }
    cmd.kill_on_drop(true);

    tracing::debug!(command = %argv.join(" "), proxy = %proxy_url, "starting subprocess");
    let mut child = cmd
        .spawn()
        .with_context(|| format!("error starting {}", argv[0]))?;

    let status = tokio::select! {
        status = child.wait() => status.context("error waiting for subprocess")?,
        result = crate::signals::shutdown() => {
            child.kill().await.ok();
            result?;
            bail!("interrupted");
        }
    };
    if !status.success() {
        bail!("command exited with {status}");
    }
    Ok(())
}
