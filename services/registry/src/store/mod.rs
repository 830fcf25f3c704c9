//! Persistence for registry metadata.
//!
//! Every method takes an optional transaction key. With a key, the call runs
//! inside the keyed transaction opened through [`TransactionCoordinator`];
//! without one, it applies immediately.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use keyed_tx::{TransactionCoordinator, TransactionError};

mod memory;

pub use memory::MemoryStore;

/// Errors raised by a [`Store`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A row the operation depends on does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The write would violate a unique constraint.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The keyed transaction could not be used.
    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

/// A namespace within a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    /// Row id.
    pub id: String,
    /// Owning registry.
    pub registry_id: String,
    /// Namespace name.
    pub name: String,
}

/// A repository within a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    /// Row id.
    pub id: String,
    /// Owning registry.
    pub registry_id: String,
    /// Owning namespace.
    pub namespace_id: String,
    /// Repository name.
    pub name: String,
}

/// Metadata for blob content that has been fully written to storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMeta {
    /// Owning registry.
    pub registry_id: String,
    /// Owning namespace.
    pub namespace_id: String,
    /// Owning repository.
    pub repository_id: String,
    /// Content digest.
    pub digest: String,
    /// Size in bytes.
    pub size: u64,
    /// Path of the content in blob storage.
    pub location: String,
    /// Media type, when known.
    pub media_type: Option<String>,
}

/// A blob upload in progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    /// Session id, as handed to the client.
    pub id: String,
    /// Owning registry.
    pub registry_id: String,
    /// Namespace name.
    pub namespace: String,
    /// Repository name.
    pub repository: String,
    /// Whether a chunk has been received.
    pub is_chunked: bool,
    /// Highest byte offset written so far.
    pub bytes_received: u64,
    /// Last time a chunk was received.
    pub last_updated: DateTime<Utc>,
}

/// A stored manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Row id.
    pub id: String,
    /// Owning registry.
    pub registry_id: String,
    /// Owning namespace.
    pub namespace_id: String,
    /// Owning repository.
    pub repository_id: String,
    /// Digest of the stored bytes.
    pub digest: String,
    /// Digest of the content the manifest references.
    pub unique_digest: String,
    /// Media type of the stored bytes.
    pub media_type: String,
    /// The manifest bytes.
    pub content: Bytes,
}

impl Manifest {
    /// Size of the stored bytes.
    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }
}

/// Fields for a new manifest row. The store assigns the id.
#[derive(Debug, Clone)]
pub struct NewManifest {
    /// Owning registry.
    pub registry_id: String,
    /// Owning namespace.
    pub namespace_id: String,
    /// Owning repository.
    pub repository_id: String,
    /// Digest of the stored bytes.
    pub digest: String,
    /// Digest of the content the manifest references.
    pub unique_digest: String,
    /// Media type of the stored bytes.
    pub media_type: String,
    /// The manifest bytes.
    pub content: Bytes,
}

/// A tag and the manifest it currently points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    /// Row id.
    pub id: String,
    /// Owning registry.
    pub registry_id: String,
    /// Owning namespace.
    pub namespace_id: String,
    /// Owning repository.
    pub repository_id: String,
    /// Tag name.
    pub name: String,
    /// The linked manifest.
    pub manifest_id: Option<String>,
}

/// A pull-through cache record for a tag or digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Owning registry.
    pub registry_id: String,
    /// Owning namespace.
    pub namespace_id: String,
    /// Owning repository.
    pub repository_id: String,
    /// The tag or digest this entry was cached under.
    pub identifier: String,
    /// Digest of the cached content.
    pub digest: String,
    /// When the entry stops counting as a hit.
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Whether the entry has expired as of `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

type Tx<'a> = Option<&'a str>;

/// Namespace rows.
#[async_trait::async_trait]
pub trait NamespaceStore {
    /// Look up a namespace id by name.
    async fn namespace_id(
        &self,
        tx: Tx<'_>,
        registry_id: &str,
        name: &str,
    ) -> Result<Option<String>, StoreError>;

    /// Create a namespace, returning its id.
    async fn create_namespace(
        &self,
        tx: Tx<'_>,
        registry_id: &str,
        name: &str,
    ) -> Result<String, StoreError>;
}

/// Repository rows.
#[async_trait::async_trait]
pub trait RepositoryStore {
    /// Look up a repository id by name.
    async fn repository_id(
        &self,
        tx: Tx<'_>,
        namespace_id: &str,
        name: &str,
    ) -> Result<Option<String>, StoreError>;

    /// Create a repository, returning its id.
    async fn create_repository(
        &self,
        tx: Tx<'_>,
        registry_id: &str,
        namespace_id: &str,
        name: &str,
    ) -> Result<String, StoreError>;
}

/// Blob metadata and upload sessions.
#[async_trait::async_trait]
pub trait BlobStore {
    /// Blob metadata for a digest in a repository.
    async fn blob(
        &self,
        tx: Tx<'_>,
        repository_id: &str,
        digest: &str,
    ) -> Result<Option<BlobMeta>, StoreError>;

    /// Record a fully written blob.
    async fn create_blob(&self, tx: Tx<'_>, blob: BlobMeta) -> Result<(), StoreError>;

    /// Register a new upload session.
    async fn create_upload(&self, tx: Tx<'_>, session: UploadSession) -> Result<(), StoreError>;

    /// Look up an upload session.
    async fn upload(&self, tx: Tx<'_>, id: &str) -> Result<Option<UploadSession>, StoreError>;

    /// Record chunk progress for an upload session.
    async fn update_upload(
        &self,
        tx: Tx<'_>,
        id: &str,
        is_chunked: bool,
        bytes_received: u64,
    ) -> Result<(), StoreError>;

    /// Remove an upload session.
    async fn delete_upload(&self, tx: Tx<'_>, id: &str) -> Result<(), StoreError>;
}

/// Manifest rows.
#[async_trait::async_trait]
pub trait ManifestStore {
    /// Look up a manifest by id.
    async fn manifest(&self, tx: Tx<'_>, id: &str) -> Result<Option<Manifest>, StoreError>;

    /// Look up a manifest by the digest of its bytes.
    async fn manifest_by_digest(
        &self,
        tx: Tx<'_>,
        repository_id: &str,
        digest: &str,
    ) -> Result<Option<Manifest>, StoreError>;

    /// Look up a manifest by its unique digest.
    async fn manifest_by_unique_digest(
        &self,
        tx: Tx<'_>,
        repository_id: &str,
        unique_digest: &str,
    ) -> Result<Option<Manifest>, StoreError>;

    /// Create a manifest, returning its id.
    async fn create_manifest(&self, tx: Tx<'_>, manifest: NewManifest)
        -> Result<String, StoreError>;
}

/// Tags and their manifest links.
#[async_trait::async_trait]
pub trait TagStore {
    /// Look up a tag by name.
    async fn tag(
        &self,
        tx: Tx<'_>,
        repository_id: &str,
        name: &str,
    ) -> Result<Option<Tag>, StoreError>;

    /// Create an unlinked tag, returning its id.
    async fn create_tag(
        &self,
        tx: Tx<'_>,
        registry_id: &str,
        namespace_id: &str,
        repository_id: &str,
        name: &str,
    ) -> Result<String, StoreError>;

    /// Point a tag at a manifest, replacing any previous link.
    async fn link_manifest(
        &self,
        tx: Tx<'_>,
        tag_id: &str,
        manifest_id: &str,
    ) -> Result<(), StoreError>;

    /// Names of every tag in a repository, sorted.
    async fn tag_names(&self, tx: Tx<'_>, repository_id: &str) -> Result<Vec<String>, StoreError>;
}

/// Pull-through cache entries.
#[async_trait::async_trait]
pub trait CacheStore {
    /// Look up the entry for a tag or digest.
    async fn cache_entry(
        &self,
        tx: Tx<'_>,
        repository_id: &str,
        identifier: &str,
    ) -> Result<Option<CacheEntry>, StoreError>;

    /// Create an entry.
    async fn create_cache_entry(&self, tx: Tx<'_>, entry: CacheEntry) -> Result<(), StoreError>;

    /// Move an entry's expiry.
    async fn refresh_cache_entry(
        &self,
        tx: Tx<'_>,
        repository_id: &str,
        identifier: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Remove an entry.
    async fn delete_cache_entry(
        &self,
        tx: Tx<'_>,
        repository_id: &str,
        identifier: &str,
    ) -> Result<(), StoreError>;
}

/// Everything the registry service persists, plus keyed transactions over it.
pub trait Store:
    TransactionCoordinator
    + NamespaceStore
    + RepositoryStore
    + BlobStore
    + ManifestStore
    + TagStore
    + CacheStore
    + fmt::Debug
    + Send
    + Sync
{
}

impl<T> Store for T where
    T: TransactionCoordinator
        + NamespaceStore
        + RepositoryStore
        + BlobStore
        + ManifestStore
        + TagStore
        + CacheStore
        + fmt::Debug
        + Send
        + Sync
{
}
