//! The fetch / record / replay request pipeline.
//!
//! Every request the proxy decrypts lands here. The decision ladder is:
//! dummy-OK match, manifest replay, upstream fetch-and-record (build mode),
//! hard 404 (offline mode). Recorded bodies are streamed to the client and
//! into a content-addressable file at the same time, so the proxy never
//! buffers a whole artifact in memory.

use crate::error::{ProxyError, ProxyResult};
use crate::registry_auth::RegistryAuthClient;
use bytes::Bytes;
use futures::StreamExt;
use htvend_core::{BlobInfo, Digest, HeaderAllowList, UrlMatcher, fingerprint, request_url};
use htvend_manifest::Manifest;
use htvend_store::{BlobStore, StoreError};
use http::header::{CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyDataStream, BodyExt, Empty, Full, StreamBody};
use hyper::body::{Body, Frame};
use std::sync::Arc;
use url::Url;

/// Response body type produced by the pipeline.
pub type ProxyBody = UnsyncBoxBody<Bytes, std::io::Error>;

/// Everything a listener needs to answer requests.
pub struct PipelineContext {
    pub assets: Arc<Manifest>,
    pub blobs: Arc<dyn BlobStore>,

    /// Build/repair mode: go upstream on a manifest miss.
    pub fetch_if_missing: bool,
    /// Offline mode: answer manifest misses with 404.
    pub fail_if_missing: bool,

    /// Offline only: URLs answered with a synthetic empty 200.
    pub dummy_ok: Option<UrlMatcher>,

    /// Response headers recorded alongside a fetched blob.
    pub headers_to_cache: HeaderAllowList,

    pub client: Arc<RegistryAuthClient>,
}

/// Handle one proxied request. Never fails the connection: pipeline errors
/// become a 500 with the detail only in the log.
pub async fn handle<B>(ctx: Arc<PipelineContext>, tls: bool, req: Request<B>) -> Response<ProxyBody>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match handle_inner(ctx, tls, req).await {
        Ok(resp) => resp,
        Err(e) => {
            tracing::warn!(error = %e, "error handling request");
            text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "see proxy server log for details",
            )
        }
    }
}

async fn handle_inner<B>(
    ctx: Arc<PipelineContext>,
    tls: bool,
    req: Request<B>,
) -> ProxyResult<Response<ProxyBody>>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let url = logical_url(tls, &req)?;
    let key = fingerprint(&url);

    if let Some(dummy_ok) = &ctx.dummy_ok {
        if dummy_ok.matches(&key) {
            return Ok(Response::new(empty_body()));
        }
    }

    if let Some(info) = ctx.assets.get_blob(&url)? {
        return replay_blob(&ctx, &key, &info).await;
    }

    if ctx.fetch_if_missing {
        return fetch_and_record(ctx.clone(), url, req).await;
    }

    if ctx.fail_if_missing {
        tracing::warn!(key = %key, "missing asset");
        return Ok(text_response(StatusCode::NOT_FOUND, "missing asset"));
    }

    Err(ProxyError::BadRequest(
        "no handling mode configured for miss".to_string(),
    ))
}

/// Reconstruct the request's logical URL. L1 proxy requests carry an
/// absolute-form target; tunnelled requests are origin-form plus Host.
fn logical_url<B>(tls: bool, req: &Request<B>) -> ProxyResult<Url> {
    let authority = match req.uri().authority() {
        Some(authority) => authority.as_str().to_string(),
        None => req
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ProxyError::BadRequest("request has no authority".to_string()))?,
    };
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    Ok(request_url(tls, &authority, path_and_query)?)
}

/// Serve a manifest hit out of the blob store.
async fn replay_blob(
    ctx: &PipelineContext,
    key: &str,
    info: &BlobInfo,
) -> ProxyResult<Response<ProxyBody>> {
    let digest = Digest::from_hex(&info.sha256)?;
    let stream = ctx.blobs.get(&digest).await.map_err(|e| match e {
        // The manifest promised this blob; a missing file is store rot, not
        // a cache miss.
        StoreError::NotFound(_) => ProxyError::MissingBlob {
            key: key.to_string(),
            digest: info.sha256.clone(),
        },
        other => ProxyError::Store(other),
    })?;

    let mut builder = Response::builder().status(StatusCode::OK);
    for (name, value) in &info.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    let body = StreamBody::new(stream.map(|r| r.map(Frame::data).map_err(std::io::Error::other)));
    Ok(builder.body(BodyExt::boxed_unsync(body))?)
}

/// Forward a miss upstream, mirroring the response to the client and, for a
/// cacheable 200, teeing it into the store and manifest.
async fn fetch_and_record<B>(
    ctx: Arc<PipelineContext>,
    url: Url,
    req: Request<B>,
) -> ProxyResult<Response<ProxyBody>>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (parts, body) = req.into_parts();
    tracing::info!(method = %parts.method, url = %fingerprint(&url), "fetching URL");

    let mut upstream_req = reqwest::Request::new(parts.method.clone(), url.clone());
    for (name, value) in &parts.headers {
        // Host follows the URL and the body determines its own framing.
        if name == HOST || name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
            continue;
        }
        upstream_req.headers_mut().append(name, value.clone());
    }
    if parts.headers.contains_key(CONTENT_LENGTH) || parts.headers.contains_key(TRANSFER_ENCODING)
    {
        *upstream_req.body_mut() = Some(reqwest::Body::wrap_stream(BodyDataStream::new(body)));
    }

    let resp = ctx.client.execute(upstream_req).await?;
    let status = resp.status();
    let mut builder = Response::builder().status(status);
    for (name, value) in resp.headers() {
        builder = builder.header(name, value);
    }

    // Only 200s of cacheable URLs are recorded; everything else streams
    // through untouched.
    if ctx.assets.skip_save(&url) || status != StatusCode::OK {
        let body = StreamBody::new(
            resp.bytes_stream()
                .map(|r| r.map(Frame::data).map_err(std::io::Error::other)),
        );
        return Ok(builder.body(BodyExt::boxed_unsync(body))?);
    }

    let kept_headers = ctx.headers_to_cache.filter(resp.headers());
    let body = async_stream::try_stream! {
        let mut writer = ctx.blobs.put().await.map_err(std::io::Error::other)?;
        let mut upstream = resp.bytes_stream();
        while let Some(chunk) = upstream.next().await {
            let chunk = chunk.map_err(std::io::Error::other)?;
            writer.write(&chunk).await.map_err(std::io::Error::other)?;
            yield Frame::data(chunk);
        }
        let digest = writer.commit().await.map_err(std::io::Error::other)?;
        let info = BlobInfo {
            sha256: digest.to_hex(),
            headers: kept_headers,
        };
        if let Err(e) = ctx.assets.add_blob(&url, info) {
            // The committed blob stays behind as an orphan; `clean` will
            // reclaim it.
            tracing::warn!(url = %fingerprint(&url), error = %e, "error updating asset manifest");
            Err(std::io::Error::other(e))?;
        }
    };
    Ok(builder.body(BodyExt::boxed_unsync(StreamBody::new(body)))?)
}

/// Fetch a URL and record it without a client attached. Used by the verify
/// walker to backfill missing or rotten assets.
pub async fn fetch_and_save(ctx: &PipelineContext, url: &Url) -> ProxyResult<()> {
    tracing::info!(url = %fingerprint(url), "fetching URL");
    let resp = ctx
        .client
        .execute(reqwest::Request::new(http::Method::GET, url.clone()))
        .await?;

    if ctx.assets.skip_save(url) || resp.status() != StatusCode::OK {
        return Ok(());
    }

    let kept_headers = ctx.headers_to_cache.filter(resp.headers());
    let mut writer = ctx.blobs.put().await?;
    let result: ProxyResult<()> = async {
        let mut upstream = resp.bytes_stream();
        while let Some(chunk) = upstream.next().await {
            let chunk = chunk?;
            writer.write(&chunk).await?;
        }
        let digest = writer.commit().await?;
        ctx.assets.add_blob(
            url,
            BlobInfo {
                sha256: digest.to_hex(),
                headers: kept_headers,
            },
        )?;
        Ok(())
    }
    .await;
    writer.cleanup().await?;
    result
}

pub(crate) fn empty_body() -> ProxyBody {
    BodyExt::boxed_unsync(Empty::<Bytes>::new().map_err(|never| match never {}))
}

pub(crate) fn text_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let body = BodyExt::boxed_unsync(
        Full::new(Bytes::from(format!("{message}\n"))).map_err(|never| match never {}),
    );
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}
