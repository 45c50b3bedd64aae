//! URL-keyed asset manifest with file locking.
//!
//! A manifest maps canonical URL keys to recorded blob metadata. Writable
//! manifests hold an exclusive advisory lock on `<path>.lock` for their
//! lifetime, so exactly one build can update a manifest at a time.

pub mod error;
pub mod lock;
pub mod manifest;

pub use error::{ManifestError, ManifestResult};
pub use lock::LockGuard;
pub use manifest::{Manifest, ManifestOptions};
