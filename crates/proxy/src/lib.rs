//! MITM proxy server and request pipeline.
//!
//! The proxy sits between a build command and the network. A forward HTTP
//! listener accepts plain proxy requests and `CONNECT` tunnels; tunnels are
//! spliced into an internal TLS listener that terminates them with a leaf
//! certificate minted on the fly from a local CA. Every decrypted request
//! runs through the same pipeline: replay from the blob store when the
//! manifest has it, fetch-and-record or fail otherwise.

pub mod error;
pub mod pipeline;
pub mod registry_auth;
pub mod rpc;
pub mod server;
pub mod tls;
pub mod walker;

pub use error::{ProxyError, ProxyResult};
pub use pipeline::PipelineContext;
pub use registry_auth::RegistryAuthClient;
pub use server::{ProxyServerConfig, serve_until_done};
pub use tls::CertificateAuthority;
pub use walker::WalkerOptions;
