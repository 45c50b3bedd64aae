//! Shared argument groups and wiring helpers for the subcommands.

use anyhow::{Context, Result};
use clap::Args;
use htvend_core::UrlMatcher;
use htvend_manifest::{Manifest, ManifestOptions};
use htvend_proxy::{ProxyServerConfig, RegistryAuthClient};
use htvend_store::DirectoryStore;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

/// Where the manifest, the blob store and the global cache live.
#[derive(Args, Clone, Debug)]
pub struct ManifestArgs {
    /// File to put manifest data in
    #[arg(short = 'm', long = "manifest", default_value = "./blobs.json")]
    pub manifest_file: PathBuf,

    /// Common directory to store downloaded blobs in
    /// [default: $XDG_DATA_HOME/htvend/blobs]
    #[arg(long = "blobs-dir", env = "HTVEND_BLOBS_DIR")]
    pub blobs_dir: Option<PathBuf>,

    /// Shared cache manifest of all downloaded assets
    /// [default: $XDG_DATA_HOME/htvend/cache.json]
    #[arg(long = "cache-manifest", env = "HTVEND_CACHE_MANIFEST")]
    pub cache_manifest: Option<PathBuf>,
}

impl ManifestArgs {
    pub fn blobs_dir(&self) -> PathBuf {
        self.blobs_dir
            .clone()
            .unwrap_or_else(|| xdg_data_path("htvend/blobs"))
    }

    pub fn cache_manifest_path(&self) -> PathBuf {
        self.cache_manifest
            .clone()
            .unwrap_or_else(|| xdg_data_path("htvend/cache.json"))
    }

    pub fn make_blob_store(&self, writable: bool) -> Arc<DirectoryStore> {
        Arc::new(DirectoryStore::new(self.blobs_dir(), writable))
    }

    /// Open the shared global cache manifest. It always allows overwrites:
    /// newer fetches win across builds.
    pub fn open_global_cache(&self, no_cache: UrlMatcher) -> Result<Arc<Manifest>> {
        let path = self.cache_manifest_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("error creating cache dir {}", parent.display()))?;
        }
        let manifest = Manifest::open(ManifestOptions {
            path,
            writable: true,
            allow_overwrite: true,
            no_cache,
            ..Default::default()
        })
        .context("error opening global cache manifest")?;
        Ok(Arc::new(manifest))
    }
}

/// Fetch-mode tuning shared by build and verify.
#[derive(Args, Clone, Debug)]
pub struct FetchArgs {
    /// Regex list of URLs to never store in cache. Useful for token
    /// endpoints. [default: ^http.*/v2/$ and /token\?]
    #[arg(long = "no-cache-response")]
    pub no_cache: Vec<String>,

    /// List of headers for which we will cache the first value
    /// [default: Content-Length, Content-Type, Content-Encoding,
    /// Docker-Content-Digest, X-Checksum-Sha1]
    #[arg(long = "cache-header")]
    pub cache_headers: Vec<String>,
}

impl FetchArgs {
    pub fn no_cache_patterns(&self) -> Vec<String> {
        if self.no_cache.is_empty() {
            htvend_core::DEFAULT_NO_CACHE_PATTERNS
                .iter()
                .map(|s| s.to_string())
                .collect()
        } else {
            self.no_cache.clone()
        }
    }

    pub fn header_allow_list(&self) -> htvend_core::HeaderAllowList {
        if self.cache_headers.is_empty() {
            htvend_core::HeaderAllowList::default()
        } else {
            htvend_core::HeaderAllowList::new(&self.cache_headers)
        }
    }
}

/// Proxy listener configuration shared by build and offline.
#[derive(Args, Clone, Debug)]
pub struct ListenerArgs {
    /// Listen address for the proxy server; port 0 allocates dynamically
    #[arg(short = 'l', long = "listen-addr", default_value = "127.0.0.1:0")]
    pub listen_addr: SocketAddr,

    /// Listen address for the internal TLS listener
    #[arg(long = "tls-listen-addr", default_value = "127.0.0.1:0")]
    pub tls_listen_addr: SocketAddr,

    /// If set, use this CA cert PEM for minted certificates
    #[arg(long = "tls-cert-pem")]
    pub tls_cert_pem: Option<PathBuf>,

    /// If set, use this CA key PEM; must match the cert
    #[arg(long = "tls-key-pem")]
    pub tls_key_pem: Option<PathBuf>,

    /// Generate and save the CA pair if the files are missing
    #[arg(long = "tls-generate-if-missing")]
    pub tls_generate_if_missing: bool,

    /// Run as a daemon until terminated instead of running a command
    #[arg(short = 'd', long = "daemon")]
    pub daemon: bool,

    /// Create a unix socket here accepting blob and manifest updates
    #[arg(long = "daemon-rpc-socket")]
    pub daemon_rpc_socket: Option<PathBuf>,

    /// Command to run under the proxy (defaults to $SHELL)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl ListenerArgs {
    pub fn server_config(&self) -> ProxyServerConfig {
        ProxyServerConfig {
            listen_addr: self.listen_addr,
            tls_listen_addr: self.tls_listen_addr,
            ca_cert_path: self.tls_cert_pem.clone(),
            ca_key_path: self.tls_key_pem.clone(),
            generate_ca_if_missing: self.tls_generate_if_missing,
        }
    }
}

/// Upstream HTTP client for fetches. Env proxy settings are ignored: the
/// vendoring proxy must talk to upstreams directly even when it injects
/// proxy variables into its child.
pub fn upstream_client() -> Result<Arc<RegistryAuthClient>> {
    let client = reqwest::Client::builder()
        .no_proxy()
        .build()
        .context("error building upstream HTTP client")?;
    Ok(Arc::new(RegistryAuthClient::new(client)))
}

/// Resolve a path under `$XDG_DATA_HOME`, honouring the conventional
/// `~/.local/share` fallback.
fn xdg_data_path(rel: &str) -> PathBuf {
    let base = std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| {
            let home = std::env::var_os("HOME").unwrap_or_default();
            PathBuf::from(home).join(".local/share")
        });
    base.join(rel)
}
