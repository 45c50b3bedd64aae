//! The dual-listener MITM proxy server.
//!
//! L1 is the forward proxy the child process points at. Plain requests are
//! answered by the pipeline directly; CONNECT tunnels are answered with
//! `200 OK` and then spliced byte-for-byte into L2, a loopback TLS listener
//! that terminates the tunnel with a per-SNI leaf certificate and feeds the
//! decrypted requests into the same pipeline.

use crate::error::{ProxyError, ProxyResult};
use crate::pipeline::{self, PipelineContext, ProxyBody, empty_body};
use crate::tls::CertificateAuthority;
use http::{Method, Request, Response};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::LazyConfigAcceptor;
use tokio_util::sync::CancellationToken;

/// Dial timeout for the internal CONNECT splice.
const CONNECT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Listener and CA configuration for one proxy run.
#[derive(Clone, Debug)]
pub struct ProxyServerConfig {
    /// Address of the forward proxy listener. Port 0 picks an ephemeral one.
    pub listen_addr: SocketAddr,
    /// Address of the internal TLS listener.
    pub tls_listen_addr: SocketAddr,

    pub ca_cert_path: Option<PathBuf>,
    pub ca_key_path: Option<PathBuf>,
    pub generate_ca_if_missing: bool,
}

impl Default for ProxyServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".parse().expect("loopback address parses"),
            tls_listen_addr: "127.0.0.1:0".parse().expect("loopback address parses"),
            ca_cert_path: None,
            ca_key_path: None,
            generate_ca_if_missing: false,
        }
    }
}

/// Run the proxy for the lifetime of `child`.
///
/// The child future receives the proxy address and the CA trust bundle; the
/// listeners stop accepting as soon as it resolves, and its output is
/// returned. Cancelling an already-stopped server is a no-op.
pub async fn serve_until_done<F, Fut, T>(
    config: ProxyServerConfig,
    ctx: Arc<PipelineContext>,
    child: F,
) -> ProxyResult<T>
where
    F: FnOnce(SocketAddr, String) -> Fut,
    Fut: Future<Output = T>,
{
    let ca = Arc::new(CertificateAuthority::load_or_generate(
        config.ca_cert_path.as_deref(),
        config.ca_key_path.as_deref(),
        config.generate_ca_if_missing,
    )?);

    let proxy_listener = TcpListener::bind(config.listen_addr).await?;
    let proxy_addr = proxy_listener.local_addr()?;
    let tls_listener = TcpListener::bind(config.tls_listen_addr).await?;
    let tls_addr = tls_listener.local_addr()?;
    tracing::debug!(%proxy_addr, %tls_addr, "proxy listeners bound");

    let shutdown = CancellationToken::new();
    let proxy_task = tokio::spawn(run_proxy_listener(
        proxy_listener,
        tls_addr,
        ctx.clone(),
        shutdown.clone(),
    ));
    let tls_task = tokio::spawn(run_tls_listener(
        tls_listener,
        ca.clone(),
        ctx,
        shutdown.clone(),
    ));

    let result = child(proxy_addr, ca.ca_pem().to_string()).await;

    shutdown.cancel();
    let _ = proxy_task.await;
    let _ = tls_task.await;
    tracing::debug!("proxy terminated");
    Ok(result)
}

/// Accept loop for L1: forward proxy plus CONNECT interception.
async fn run_proxy_listener(
    listener: TcpListener,
    tls_addr: SocketAddr,
    ctx: Arc<PipelineContext>,
    shutdown: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    tracing::debug!(error = %e, "proxy accept failed");
                    continue;
                }
            },
        };

        let ctx = ctx.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let ctx = ctx.clone();
                async move {
                    if req.method() == Method::CONNECT {
                        return Ok::<_, Infallible>(handle_connect(req, tls_addr));
                    }
                    Ok(pipeline::handle(ctx, false, req).await)
                }
            });
            let conn = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades();
            if let Err(e) = conn.await {
                tracing::debug!(error = %e, "proxy connection ended with error");
            }
        });
    }
}

/// Answer a CONNECT with 200 and splice the hijacked client stream into the
/// internal TLS listener.
fn handle_connect(req: Request<Incoming>, tls_addr: SocketAddr) -> Response<ProxyBody> {
    tokio::spawn(async move {
        if let Err(e) = splice_tunnel(req, tls_addr).await {
            if is_connection_reset(&e) {
                // Clients hanging up mid-tunnel is normal teardown.
                return;
            }
            tracing::error!(error = %e, "error handling CONNECT tunnel");
        }
    });
    Response::new(empty_body())
}

async fn splice_tunnel(req: Request<Incoming>, tls_addr: SocketAddr) -> ProxyResult<()> {
    let dest = tokio::time::timeout(CONNECT_DIAL_TIMEOUT, TcpStream::connect(tls_addr))
        .await
        .map_err(|_| {
            ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "timed out dialing internal TLS listener",
            ))
        })??;

    let upgraded = hyper::upgrade::on(req)
        .await
        .map_err(|e| ProxyError::BadRequest(format!("CONNECT upgrade failed: {e}")))?;

    let mut client = TokioIo::new(upgraded);
    let mut dest = dest;
    tokio::io::copy_bidirectional(&mut client, &mut dest).await?;
    Ok(())
}

fn is_connection_reset(e: &ProxyError) -> bool {
    matches!(e, ProxyError::Io(io) if io.kind() == std::io::ErrorKind::ConnectionReset)
}

/// Accept loop for L2: terminate TLS with a minted leaf, then run the same
/// pipeline with the https scheme.
async fn run_tls_listener(
    listener: TcpListener,
    ca: Arc<CertificateAuthority>,
    ctx: Arc<PipelineContext>,
    shutdown: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    tracing::debug!(error = %e, "tls accept failed");
                    continue;
                }
            },
        };

        let ca = ca.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
            let start = match acceptor.await {
                Ok(start) => start,
                Err(e) => {
                    tracing::debug!(error = %e, "tls client hello failed");
                    return;
                }
            };

            let sni = start
                .client_hello()
                .server_name()
                .unwrap_or("localhost")
                .to_string();
            let server_config = match ca.mint_leaf(&sni) {
                Ok(config) => config,
                Err(e) => {
                    tracing::error!(sni = %sni, error = %e, "failed to mint leaf certificate");
                    return;
                }
            };
            let tls_stream = match start.into_stream(server_config).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::debug!(sni = %sni, error = %e, "tls handshake failed");
                    return;
                }
            };

            let service = service_fn(move |req: Request<Incoming>| {
                let ctx = ctx.clone();
                async move { Ok::<_, Infallible>(pipeline::handle(ctx, true, req).await) }
            });
            let conn = http1::Builder::new().serve_connection(TokioIo::new(tls_stream), service);
            if let Err(e) = conn.await {
                tracing::debug!(error = %e, "tls connection ended with error");
            }
        });
    }
}
