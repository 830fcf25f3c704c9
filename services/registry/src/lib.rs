//! # Container Image Registry
//!
//! This crate implements a Docker Registry V2 / [OCI Distribution][distribution]
//! server that either hosts pushed images or acts as a pull-through cache in
//! front of an upstream registry.
//!
//! [distribution]: https://github.com/opencontainers/distribution-spec
//!
//! ## Features
//!
//! - Monolithic and chunked blob uploads
//! - Manifest deduplication across byte-different serializations
//! - Pull-through caching with a TTL and upstream change detection
//! - Keyed transactions around every multi-step write
//! - Pluggable storage backend via the `storage` crate
//!
//! ## Example
//!
//! ```no_run
//! use registry::RegistryBuilder;
//! use storage::MemoryStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = MemoryStorage::with_buckets(&["registry"]);
//! let registry = RegistryBuilder::new()
//!     .storage(storage.into())
//!     .bucket("registry")
//!     .build();
//!
//! // Serve `registry` with `axum::serve` or any tower-compatible server
//! # Ok(())
//! # }
//! ```

mod api;
mod blob;
pub mod config;
pub mod digest;
mod error;
mod manifest;
pub mod names;
pub mod service;
pub mod storage;
pub mod store;
pub mod upstream;

pub use api::{RegistryBuilder, router};
pub use error::{RegistryError, RegistryResult};
pub use service::{
    CacheConfig, HostedSource, ProxiedSource, RegistryIdentity, RegistryService, Source,
};
