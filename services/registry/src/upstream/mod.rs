//! Clients for the remote registries a pull-through cache proxies.

use std::fmt;

use bytes::Bytes;
use http::StatusCode;

use crate::digest::Digest;
use crate::names::RepositoryName;

mod credential;
mod docker;

pub use credential::Credential;
pub use docker::{
    Backoff, DEFAULT_REGISTRY_URL, DEFAULT_TOKEN_SERVICE, DEFAULT_TOKEN_URL, DockerClient,
    DockerConfig, NetworkConfig,
};
pub(crate) use docker::seconds;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors talking to an upstream registry.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// The request could not be sent.
    #[error("request failed: {0}")]
    Request(#[source] hyperdriver::client::Error),

    /// The response body could not be read.
    #[error("reading response body: {0}")]
    Body(#[source] BoxError),

    /// The upstream answered with an unexpected status.
    #[error("{url} returned {status}")]
    Status {
        /// Response status.
        status: StatusCode,
        /// Requested URL.
        url: String,
    },

    /// No usable token was returned by the token endpoint.
    #[error("token endpoint returned no token")]
    Token,

    /// A request URL could not be built.
    #[error("invalid upstream url: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),

    /// A request could not be built.
    #[error(transparent)]
    Http(#[from] http::Error),

    /// A JSON response could not be decoded.
    #[error("decoding response: {0}")]
    Json(#[from] serde_json::Error),

    /// The upstream kept failing after every retry.
    #[error("{url} still returned {status} after {attempts} attempts")]
    RetriesExhausted {
        /// Last response status.
        status: StatusCode,
        /// Requested URL.
        url: String,
        /// Number of requests made.
        attempts: usize,
    },
}

/// A manifest fetched from upstream.
#[derive(Debug, Clone)]
pub struct UpstreamManifest {
    /// Digest of the manifest bytes.
    pub digest: Digest,
    /// Media type the upstream reported.
    pub media_type: String,
    /// The manifest bytes.
    pub content: Bytes,
}

/// Manifest metadata from a HEAD request.
#[derive(Debug, Clone)]
pub struct ManifestHead {
    /// `Docker-Content-Digest`, when the upstream sent a valid one.
    pub digest: Option<Digest>,
    /// Media type the upstream reported.
    pub media_type: String,
    /// `Content-Length`.
    pub size: u64,
}

/// Blob metadata from a HEAD request.
#[derive(Debug, Clone, Copy)]
pub struct BlobHead {
    /// `Content-Length`.
    pub size: u64,
}

/// Read access to a remote registry.
///
/// A reference the upstream does not know is `Ok(None)`.
#[async_trait::async_trait]
pub trait UpstreamClient: fmt::Debug + Send + Sync {
    /// Fetch a manifest by tag or digest.
    async fn get_manifest(
        &self,
        name: &RepositoryName,
        reference: &str,
    ) -> Result<Option<UpstreamManifest>, UpstreamError>;

    /// Fetch manifest metadata by tag or digest.
    async fn head_manifest(
        &self,
        name: &RepositoryName,
        reference: &str,
    ) -> Result<Option<ManifestHead>, UpstreamError>;

    /// Fetch blob content.
    async fn get_blob(
        &self,
        name: &RepositoryName,
        digest: &Digest,
    ) -> Result<Option<Bytes>, UpstreamError>;

    /// Fetch blob metadata.
    async fn head_blob(
        &self,
        name: &RepositoryName,
        digest: &Digest,
    ) -> Result<Option<BlobHead>, UpstreamError>;
}
