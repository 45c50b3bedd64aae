//! Bearer-token auth for OCI registry endpoints.
//!
//! Registries answer anonymous blob/manifest GETs with a `401` carrying a
//! `WWW-Authenticate: Bearer` challenge. This client performs the token
//! dance once per repository and caches the token until shortly before it
//! expires, so a build pulling many layers hits the token endpoint once.

use crate::error::{ProxyError, ProxyResult};
use http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use http::{HeaderValue, Method, StatusCode};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};
use std::time::{Duration, Instant};
use url::Url;

/// Matches registry blob/manifest URLs; captures 1+2 form the token cache
/// key (scheme + authority + `/v2/` + owner/name).
static REGISTRY_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new("^(https?://.*/v2/)([^/]+/[^/]+)/(blobs|manifests)/.*$")
        .expect("registry path pattern is valid")
});

/// Margin subtracted from `expires_in` so a token is refreshed before the
/// registry stops accepting it.
const EXPIRY_MARGIN_SECS: u64 = 10;

struct CachedToken {
    token: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: String,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Debug, PartialEq)]
struct BearerChallenge {
    realm: String,
    service: String,
    scope: String,
}

/// HTTP client wrapper that transparently performs the registry bearer
/// token flow for matching GET requests and passes everything else through.
pub struct RegistryAuthClient {
    inner: reqwest::Client,
    tokens: Mutex<HashMap<String, CachedToken>>,
}

impl RegistryAuthClient {
    pub fn new(inner: reqwest::Client) -> Self {
        Self {
            inner,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Execute a request, handling a bearer challenge if one comes back.
    pub async fn execute(&self, mut req: reqwest::Request) -> ProxyResult<reqwest::Response> {
        if req.method() != Method::GET {
            return Ok(self.inner.execute(req).await?);
        }
        let Some(caps) = REGISTRY_PATH.captures(req.url().as_str()) else {
            return Ok(self.inner.execute(req).await?);
        };
        let key = format!("{}{}", &caps[1], &caps[2]);

        if let Some(token) = self.cached_token(&key) {
            req.headers_mut()
                .insert(AUTHORIZATION, bearer_header(&token)?);
            return Ok(self.inner.execute(req).await?);
        }

        // No token yet: try bare, expecting a challenge on protected repos.
        let url = req.url().clone();
        let resp = self.inner.execute(req).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }
        let Some(challenge) = resp
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_bearer_challenge)
        else {
            // Not a bearer challenge we can answer; hand the 401 back.
            return Ok(resp);
        };

        let token = self.fetch_token(&challenge).await?;
        let header = bearer_header(&token.token)?;
        self.store_token(key, token);

        tracing::debug!(url = %url, "retrying with bearer token");
        Ok(self
            .inner
            .get(url)
            .header(AUTHORIZATION, header)
            .send()
            .await?)
    }

    fn cached_token(&self, key: &str) -> Option<String> {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        match tokens.get(key) {
            Some(cached) if cached.expires_at > Instant::now() => Some(cached.token.clone()),
            Some(_) => {
                tokens.remove(key);
                None
            }
            None => None,
        }
    }

    fn store_token(&self, key: String, token: TokenResponse) {
        let ttl = Duration::from_secs(token.expires_in.saturating_sub(EXPIRY_MARGIN_SECS));
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        // Racing callers may both have fetched; last writer wins.
        tokens.insert(
            key,
            CachedToken {
                token: token.token,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    async fn fetch_token(&self, challenge: &BearerChallenge) -> ProxyResult<TokenResponse> {
        let mut token_url = Url::parse(&challenge.realm).map_err(|e| {
            ProxyError::Unauthorized(format!("bad realm {:?}: {e}", challenge.realm))
        })?;
        token_url
            .query_pairs_mut()
            .append_pair("scope", &challenge.scope)
            .append_pair("service", &challenge.service);

        tracing::debug!(url = %token_url, "fetching registry token");
        let resp = self.inner.get(token_url).send().await?;
        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| ProxyError::Unauthorized(format!("error decoding token response: {e}")))?;
        if token.token.is_empty() {
            return Err(ProxyError::Unauthorized(
                "registry returned a blank token".to_string(),
            ));
        }
        Ok(token)
    }
}

fn bearer_header(token: &str) -> ProxyResult<HeaderValue> {
    HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|e| ProxyError::Unauthorized(format!("token is not a valid header value: {e}")))
}

/// Parse `Bearer realm="…",service="…",scope="…"`. All three parameters are
/// required; anything else is a challenge we cannot answer.
fn parse_bearer_challenge(value: &str) -> Option<BearerChallenge> {
    let params = value.strip_prefix("Bearer ")?;
    let mut realm = None;
    let mut service = None;
    let mut scope = None;
    for part in params.split(',') {
        let part = part.trim();
        if let Some(v) = part.strip_prefix("realm=") {
            realm = unquote(v);
        } else if let Some(v) = part.strip_prefix("service=") {
            service = unquote(v);
        } else if let Some(v) = part.strip_prefix("scope=") {
            scope = unquote(v);
        }
    }
    Some(BearerChallenge {
        realm: realm?,
        service: service?,
        scope: scope?,
    })
}

fn unquote(v: &str) -> Option<String> {
    Some(
        v.strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(v)
            .to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[test]
    fn parses_quoted_challenge() {
        let challenge = parse_bearer_challenge(
            "Bearer realm=\"https://auth.test/token\",service=\"reg.test\",scope=\"repository:lib/alpine:pull\"",
        )
        .unwrap();
        assert_eq!(
            challenge,
            BearerChallenge {
                realm: "https://auth.test/token".to_string(),
                service: "reg.test".to_string(),
                scope: "repository:lib/alpine:pull".to_string(),
            }
        );
    }

    #[test]
    fn rejects_incomplete_or_basic_challenges() {
        assert!(parse_bearer_challenge("Basic realm=\"x\"").is_none());
        assert!(parse_bearer_challenge("Bearer realm=\"x\",service=\"y\"").is_none());
    }

    #[tokio::test]
    async fn token_is_fetched_once_and_cached() {
        let registry = MockServer::start_async().await;
        let auth = MockServer::start_async().await;

        let token_mock = auth
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/token")
                    .query_param("service", "reg.test")
                    .query_param("scope", "repository:lib/alpine:pull");
                then.status(200)
                    .json_body(serde_json::json!({"token": "T", "expires_in": 60}));
            })
            .await;

        // the manifest endpoint always challenges; the blob endpoint only
        // answers a request that already carries the cached bearer token
        let challenge = format!(
            "Bearer realm=\"{}/token\",service=\"reg.test\",scope=\"repository:lib/alpine:pull\"",
            auth.base_url()
        );
        registry
            .mock_async(|when, then| {
                when.method(GET).path("/v2/lib/alpine/manifests/latest");
                then.status(401).header("WWW-Authenticate", &challenge);
            })
            .await;
        let blob_mock = registry
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v2/lib/alpine/blobs/sha256:abc")
                    .header("Authorization", "Bearer T");
                then.status(200).body("blob-data");
            })
            .await;

        let client = RegistryAuthClient::new(reqwest::Client::new());

        // first request performs the dance and caches the token
        let manifest_url = Url::parse(&registry.url("/v2/lib/alpine/manifests/latest")).unwrap();
        let _ = client
            .execute(reqwest::Request::new(Method::GET, manifest_url))
            .await
            .unwrap();
        token_mock.assert_hits_async(1).await;

        // same repository, so the cached token is attached up front
        let blob_url = Url::parse(&registry.url("/v2/lib/alpine/blobs/sha256:abc")).unwrap();
        let resp = client
            .execute(reqwest::Request::new(Method::GET, blob_url))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.text().await.unwrap(), "blob-data");

        token_mock.assert_hits_async(1).await;
        blob_mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn expired_token_triggers_a_second_fetch() {
        let registry = MockServer::start_async().await;
        let auth = MockServer::start_async().await;

        // expires_in of 10 leaves a zero TTL after the safety margin
        let token_mock = auth
            .mock_async(|when, then| {
                when.method(GET).path("/token");
                then.status(200)
                    .json_body(serde_json::json!({"token": "T", "expires_in": 10}));
            })
            .await;

        let challenge = format!(
            "Bearer realm=\"{}/token\",service=\"reg.test\",scope=\"repository:lib/alpine:pull\"",
            auth.base_url()
        );
        registry
            .mock_async(|when, then| {
                when.method(GET).path("/v2/lib/alpine/blobs/sha256:abc");
                then.status(401).header("WWW-Authenticate", &challenge);
            })
            .await;

        let client = RegistryAuthClient::new(reqwest::Client::new());
        let url = Url::parse(&registry.url("/v2/lib/alpine/blobs/sha256:abc")).unwrap();

        // each call finds its token already expired and redoes the dance
        for _ in 0..2 {
            let _ = client
                .execute(reqwest::Request::new(Method::GET, url.clone()))
                .await
                .unwrap();
        }

        token_mock.assert_hits_async(2).await;
    }

    #[tokio::test]
    async fn non_registry_urls_pass_through() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/plain");
                then.status(200).body("ok");
            })
            .await;

        let client = RegistryAuthClient::new(reqwest::Client::new());
        let url = Url::parse(&server.url("/plain")).unwrap();
        let resp = client
            .execute(reqwest::Request::new(Method::GET, url))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn blank_token_is_an_error() {
        let registry = MockServer::start_async().await;
        let auth = MockServer::start_async().await;

        auth.mock_async(|when, then| {
            when.method(GET).path("/token");
            then.status(200).json_body(serde_json::json!({"token": ""}));
        })
        .await;

        let challenge = format!(
            "Bearer realm=\"{}/token\",service=\"s\",scope=\"r\"",
            auth.base_url()
        );
        registry
            .mock_async(|when, then| {
                when.method(GET).path("/v2/a/b/blobs/x");
                then.status(401).header("WWW-Authenticate", &challenge);
            })
            .await;

        let client = RegistryAuthClient::new(reqwest::Client::new());
        let url = Url::parse(&registry.url("/v2/a/b/blobs/x")).unwrap();
        let err = client
            .execute(reqwest::Request::new(Method::GET, url))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Unauthorized(_)));
    }
}
