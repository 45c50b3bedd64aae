//! Content-addressable blob storage.
//!
//! This crate provides:
//! - The `BlobStore` / `BlobWriter` abstractions
//! - A stage-and-rename content-addressable file writer with atomic commit
//! - The flat directory backend used by the proxy and CLI

pub mod caf;
pub mod directory;
pub mod error;
pub mod traits;

pub use caf::ContentFile;
pub use directory::DirectoryStore;
pub use error::{StoreError, StoreResult};
pub use traits::{BlobStore, BlobWriter, ByteStream};
