//! API server builder and router

use std::sync::Arc;

use axum::Router;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::Json;
use axum::routing::get;
use serde::Deserialize;
use serde_json::json;
use tower_http::set_header::SetResponseHeaderLayer;

use crate::error::{RegistryError, RegistryResult};
use crate::names::RepositoryName;
use crate::service::{
    DEFAULT_ID_CACHE_CAPACITY, HostedSource, ProxiedSource, RegistryIdentity, RegistryService,
    Source,
};
use crate::storage::RegistryStorage;
use crate::store::{MemoryStore, Store};

/// `Docker-Distribution-API-Version`
pub(crate) const API_VERSION: HeaderName =
    HeaderName::from_static("docker-distribution-api-version");
/// `Docker-Content-Digest`
pub(crate) const CONTENT_DIGEST: HeaderName = HeaderName::from_static("docker-content-digest");
/// `Docker-Upload-UUID`
pub(crate) const UPLOAD_UUID: HeaderName = HeaderName::from_static("docker-upload-uuid");

const API_VERSION_VALUE: &str = "registry/2.0";

/// Registry builder for configuring and creating the registry service
///
/// Anything left unset gets an in-memory default: a [`MemoryStore`], memory
/// storage with a `registry` bucket, and a hosted source.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    identity: Option<RegistryIdentity>,
    store: Option<Arc<dyn Store>>,
    storage: Option<storage::Storage>,
    bucket: Option<String>,
    source: Option<Source>,
    id_cache_capacity: Option<usize>,
}

impl RegistryBuilder {
    /// Create a new registry builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the registry id and name
    pub fn identity(mut self, identity: RegistryIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Set the metadata store, which may be shared between registries
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the storage backend
    pub fn storage(mut self, storage: storage::Storage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Set the bucket name for storage
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Serve pushed content
    pub fn hosted(mut self, source: HostedSource) -> Self {
        self.source = Some(Source::Hosted(source));
        self
    }

    /// Serve content pulled through from an upstream registry
    pub fn proxied(mut self, source: ProxiedSource) -> Self {
        self.source = Some(Source::Proxied(source));
        self
    }

    /// Set how many namespace and repository ids are memoized
    pub fn id_cache_capacity(mut self, capacity: usize) -> Self {
        self.id_cache_capacity = Some(capacity);
        self
    }

    /// Build the registry service without a router
    pub fn service(self) -> RegistryService {
        let bucket = self.bucket.unwrap_or_else(|| "registry".to_string());
        let storage = self
            .storage
            .unwrap_or_else(|| storage::MemoryStorage::with_buckets(&[bucket.as_str()]).into());
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));

        RegistryService::with_id_cache(
            self.identity.unwrap_or_default(),
            store,
            RegistryStorage::new(&storage, bucket),
            self.source
                .unwrap_or_else(|| Source::Hosted(HostedSource::default())),
            self.id_cache_capacity.unwrap_or(DEFAULT_ID_CACHE_CAPACITY),
        )
    }

    /// Build the registry service
    ///
    /// Returns a Router that can be served with any tower-compatible server
    pub fn build(self) -> Router {
        router(self.service())
    }
}

/// The Distribution API router for a registry service
pub fn router(service: RegistryService) -> Router {
    Router::new()
        .route("/v2/", get(api_version_check))
        .merge(crate::blob::router())
        .merge(crate::manifest::router())
        .layer(SetResponseHeaderLayer::overriding(
            API_VERSION,
            HeaderValue::from_static(API_VERSION_VALUE),
        ))
        .with_state(service)
}

/// API version check endpoint
///
/// Returns 200 OK to indicate the registry is available
async fn api_version_check() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({ "Docker-Distribution-API-Version": API_VERSION_VALUE })),
    )
}

/// `{name}` and the optional `{repository}` segment of a route.
#[derive(Debug, Deserialize)]
pub(crate) struct RepositoryPath {
    name: String,
    repository: Option<String>,
}

impl RepositoryPath {
    pub(crate) fn repository_name(&self) -> RegistryResult<RepositoryName> {
        RepositoryName::from_segments(&self.name, self.repository.as_deref())
    }
}

/// Reject writes to a pull-through cache.
pub(crate) fn ensure_writable(service: &RegistryService) -> RegistryResult<()> {
    if service.is_hosted() {
        Ok(())
    } else {
        Err(RegistryError::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let storage = storage::MemoryStorage::with_buckets(&["test"]);
        let _registry = RegistryBuilder::new()
            .storage(storage.into())
            .bucket("test")
            .build();
    }

    #[test]
    fn builder_defaults_to_hosted() {
        let service = RegistryBuilder::new().service();
        assert!(service.is_hosted());
        assert_eq!(service.identity(), &RegistryIdentity::default());
        assert!(ensure_writable(&service).is_ok());
    }
}
