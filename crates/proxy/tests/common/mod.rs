//! Shared fixtures for proxy integration tests.

use htvend_core::{HeaderAllowList, UrlMatcher};
use htvend_manifest::{Manifest, ManifestOptions};
use htvend_proxy::{PipelineContext, RegistryAuthClient};
use htvend_store::DirectoryStore;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// A pipeline wired to temp storage. Note: #[allow(dead_code)] because each
/// test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestPipeline {
    pub ctx: Arc<PipelineContext>,
    pub assets: Arc<Manifest>,
    pub blobs: Arc<DirectoryStore>,
    pub manifest_path: PathBuf,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestPipeline {
    /// Build-mode pipeline: writable manifest, fetch on miss.
    pub fn build_mode() -> Self {
        Self::new(true, false, None)
    }

    /// Offline-mode pipeline: read-only lookups, 404 on miss.
    pub fn offline_mode(dummy_ok: Option<UrlMatcher>) -> Self {
        Self::new(false, true, dummy_ok)
    }

    /// Repair-mode pipeline: like build mode, but the manifest accepts
    /// overwrites so refetches can replace rotten entries.
    pub fn repair_mode() -> Self {
        let mut fixture = Self::new(true, false, None);
        // release the build-mode manifest's lock before reopening
        fixture.assets.close().expect("failed to close manifest");
        let assets = Arc::new(
            Manifest::open(ManifestOptions {
                path: fixture.manifest_path.clone(),
                writable: true,
                allow_overwrite: true,
                ..Default::default()
            })
            .expect("failed to reopen manifest with overwrite"),
        );
        fixture.ctx = Arc::new(PipelineContext {
            assets: assets.clone(),
            blobs: fixture.blobs.clone(),
            fetch_if_missing: true,
            fail_if_missing: false,
            dummy_ok: None,
            headers_to_cache: HeaderAllowList::default(),
            client: Arc::new(RegistryAuthClient::new(reqwest::Client::new())),
        });
        fixture.assets = assets;
        fixture
    }

    fn new(fetch: bool, fail: bool, dummy_ok: Option<UrlMatcher>) -> Self {
        let temp_dir = tempfile::tempdir().expect("failed to create temp dir");
        let manifest_path = temp_dir.path().join("blobs.json");
        let blobs = Arc::new(DirectoryStore::new(temp_dir.path().join("blobs"), true));
        let assets = Arc::new(
            Manifest::open(ManifestOptions {
                path: manifest_path.clone(),
                writable: true,
                no_cache: UrlMatcher::new(htvend_core::DEFAULT_NO_CACHE_PATTERNS)
                    .expect("default patterns compile"),
                ..Default::default()
            })
            .expect("failed to open manifest"),
        );

        let ctx = Arc::new(PipelineContext {
            assets: assets.clone(),
            blobs: blobs.clone(),
            fetch_if_missing: fetch,
            fail_if_missing: fail,
            dummy_ok,
            headers_to_cache: HeaderAllowList::default(),
            client: Arc::new(RegistryAuthClient::new(reqwest::Client::new())),
        });

        Self {
            ctx,
            assets,
            blobs,
            manifest_path,
            _temp_dir: temp_dir,
        }
    }
}
