//! Daemon RPC over a UNIX socket.
//!
//! When the proxy runs as a daemon it can expose the blob store and
//! manifest to sibling processes through a small HTTP surface bound to a
//! filesystem socket: existence probes, streamed blob uploads, and manifest
//! upserts.

use crate::error::ProxyResult;
use axum::Router;
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use futures::StreamExt;
use htvend_core::{BlobInfo, Digest};
use htvend_manifest::Manifest;
use htvend_store::BlobStore;
use http::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Digest header on upload responses.
pub const DIGEST_HEADER: &str = "X-Sha256-Digest";

/// Maximum accepted `/update` body (1 MiB); entries are small JSON.
const MAX_UPDATE_BODY_SIZE: usize = 1024 * 1024;

/// Manifest upsert payload.
#[derive(Debug, Serialize, Deserialize)]
pub struct KeyValue {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "Value")]
    pub value: BlobInfo,
}

/// Shared state behind the RPC handlers.
#[derive(Clone)]
pub struct RpcState {
    pub assets: Arc<Manifest>,
    pub blobs: Arc<dyn BlobStore>,
}

/// Build the RPC router.
pub fn router(state: RpcState) -> Router {
    Router::new()
        .route("/exists", any(exists))
        .route("/upload", any(upload))
        .route("/update", any(update))
        .with_state(state)
}

/// Serve the router on a UNIX socket until cancelled. The socket file is
/// removed on shutdown.
pub async fn serve_unix(
    socket_path: &Path,
    state: RpcState,
    shutdown: CancellationToken,
) -> ProxyResult<()> {
    let listener = tokio::net::UnixListener::bind(socket_path)?;
    tracing::info!(path = %socket_path.display(), "daemon RPC socket listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    std::fs::remove_file(socket_path)?;
    Ok(())
}

async fn exists(State(state): State<RpcState>, request: Request) -> Response {
    if request.method() != Method::GET {
        return (StatusCode::BAD_REQUEST, "bad method").into_response();
    }
    // Parse the query by hand so a bad key never preempts the method check.
    let key = request.uri().query().and_then(|query| {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(name, _)| name == "key")
            .map(|(_, value)| value.into_owned())
    });
    let Some(digest) = key.and_then(|k| Digest::from_hex(&k).ok()) else {
        return (StatusCode::BAD_REQUEST, "bad key").into_response();
    };
    match state.blobs.exists(&digest).await {
        Ok(true) => StatusCode::OK.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            tracing::error!(error = %e, "unexpected error checking blob existence");
            internal_error()
        }
    }
}

async fn upload(State(state): State<RpcState>, request: Request) -> Response {
    if request.method() != Method::PUT {
        return (StatusCode::BAD_REQUEST, "bad method").into_response();
    }

    let mut writer = match state.blobs.put().await {
        Ok(writer) => writer,
        Err(e) => {
            tracing::error!(error = %e, "unexpected error creating blob writer");
            return internal_error();
        }
    };

    let mut body = request.into_body().into_data_stream();
    let digest = loop {
        match body.next().await {
            Some(Ok(chunk)) => {
                if let Err(e) = writer.write(&chunk).await {
                    tracing::error!(error = %e, "unexpected error writing uploaded blob");
                    let _ = writer.cleanup().await;
                    return internal_error();
                }
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "unexpected error reading upload body");
                let _ = writer.cleanup().await;
                return internal_error();
            }
            None => match writer.commit().await {
                Ok(digest) => break digest,
                Err(e) => {
                    tracing::error!(error = %e, "unexpected error committing uploaded blob");
                    let _ = writer.cleanup().await;
                    return internal_error();
                }
            },
        }
    };

    (StatusCode::CREATED, [(DIGEST_HEADER, digest.to_hex())]).into_response()
}

async fn update(State(state): State<RpcState>, request: Request) -> Response {
    if request.method() != Method::POST {
        return (StatusCode::BAD_REQUEST, "bad method").into_response();
    }

    let bytes = match axum::body::to_bytes(request.into_body(), MAX_UPDATE_BODY_SIZE).await {
        Ok(bytes) => bytes,
        Err(_) => return (StatusCode::BAD_REQUEST, "bad request").into_response(),
    };
    let Ok(kv) = serde_json::from_slice::<KeyValue>(&bytes) else {
        return (StatusCode::BAD_REQUEST, "bad request").into_response();
    };
    let Ok(url) = Url::parse(&kv.key) else {
        return (StatusCode::BAD_REQUEST, "bad request").into_response();
    };

    match state.assets.add_blob(&url, kv.value) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            tracing::error!(error = %e, "unexpected error adding blob");
            internal_error()
        }
    }
}

fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal error, see server log",
    )
        .into_response()
}
