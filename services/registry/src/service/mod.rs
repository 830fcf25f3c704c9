//! Registry service: hosted writes and reads, and pull-through caching.
//!
//! A [`RegistryService`] serves one registry. Whether that registry stores
//! pushed content or proxies an upstream is decided once, by the [`Source`]
//! it is built with.

use std::num::NonZeroUsize;
use std::sync::Arc;

use bytes::Bytes;
use keyed_tx::TransactionError;
use lru::LruCache;
use parking_lot::Mutex;

use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::names::{ContentRange, Reference, RepositoryName};
use crate::storage::RegistryStorage;
use crate::store::{Store, StoreError, Tag};

mod hosted;
mod proxied;

pub use hosted::HostedSource;
pub use proxied::{CacheConfig, ProxiedSource};

/// Default number of namespace and repository ids kept in memory.
pub const DEFAULT_ID_CACHE_CAPACITY: usize = 1024;

/// Which registry a service answers for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryIdentity {
    /// Registry id, used in storage paths and store rows.
    pub id: String,
    /// Human readable name.
    pub name: String,
}

impl Default for RegistryIdentity {
    fn default() -> Self {
        Self {
            id: "1".into(),
            name: "hosted".into(),
        }
    }
}

/// Blob metadata, and the content when it was asked for.
#[derive(Debug, Clone)]
pub struct BlobContent {
    /// Blob digest.
    pub digest: Digest,
    /// Size in bytes.
    pub size: u64,
    /// The blob bytes.
    pub content: Option<Bytes>,
}

/// Manifest metadata, and the content when it was asked for.
#[derive(Debug, Clone)]
pub struct ManifestContent {
    /// Digest of the manifest bytes.
    pub digest: Digest,
    /// Media type of the manifest bytes.
    pub media_type: String,
    /// Size in bytes.
    pub size: u64,
    /// The manifest bytes.
    pub content: Option<Bytes>,
}

/// Ids of a repository and its namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RepositoryIds {
    pub(crate) namespace_id: String,
    pub(crate) repository_id: String,
}

/// Memoized namespace and repository ids.
///
/// Ids never change once created, so entries are only evicted for space.
#[derive(Debug)]
pub(crate) struct IdCache {
    entries: Mutex<LruCache<String, String>>,
}

impl IdCache {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub(crate) fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    pub(crate) fn insert(&self, key: String, id: String) {
        self.entries.lock().put(key, id);
    }
}

/// State shared by both kinds of [`Source`].
#[derive(Debug)]
pub(crate) struct RegistryContext {
    pub(crate) identity: RegistryIdentity,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) storage: RegistryStorage,
    ids: IdCache,
}

impl RegistryContext {
    pub(crate) fn new(
        identity: RegistryIdentity,
        store: Arc<dyn Store>,
        storage: RegistryStorage,
        capacity: usize,
    ) -> Self {
        Self {
            identity,
            store,
            storage,
            ids: IdCache::new(capacity),
        }
    }

    pub(crate) fn registry_id(&self) -> &str {
        &self.identity.id
    }

    /// `{kind}:{registry}/{namespace}/{repository}:{resource}`
    pub(crate) fn tx_key(&self, kind: &str, name: &RepositoryName, resource: &str) -> String {
        format!("{kind}:{}/{name}:{resource}", self.identity.id)
    }

    pub(crate) async fn begin(&self, key: &str) -> RegistryResult<()> {
        self.store.begin(key).await?;
        Ok(())
    }

    /// Commit on success, roll back on failure, and hand back the result.
    pub(crate) async fn finish<T>(
        &self,
        key: &str,
        result: RegistryResult<T>,
    ) -> RegistryResult<T> {
        match result {
            Ok(value) => {
                self.store.commit(key).await?;
                Ok(value)
            }
            Err(error) => {
                if let Err(rollback) = self.store.rollback(key).await {
                    tracing::warn!(%key, error = %rollback, "rollback failed");
                }
                Err(error)
            }
        }
    }

    async fn namespace_id(
        &self,
        tx: Option<&str>,
        namespace: &str,
    ) -> RegistryResult<Option<String>> {
        let key = format!("namespace:{}/{namespace}", self.identity.id);
        if let Some(id) = self.ids.get(&key) {
            return Ok(Some(id));
        }

        let id = self
            .store
            .namespace_id(tx, &self.identity.id, namespace)
            .await?;
        if let Some(id) = &id {
            self.ids.insert(key, id.clone());
        }
        Ok(id)
    }

    async fn repository_id(
        &self,
        tx: Option<&str>,
        namespace_id: &str,
        repository: &str,
    ) -> RegistryResult<Option<String>> {
        let key = format!("repository:{namespace_id}/{repository}");
        if let Some(id) = self.ids.get(&key) {
            return Ok(Some(id));
        }

        let id = self.store.repository_id(tx, namespace_id, repository).await?;
        if let Some(id) = &id {
            self.ids.insert(key, id.clone());
        }
        Ok(id)
    }

    /// Ids for an existing repository.
    pub(crate) async fn find_repository(
        &self,
        tx: Option<&str>,
        name: &RepositoryName,
    ) -> RegistryResult<Option<RepositoryIds>> {
        let Some(namespace_id) = self.namespace_id(tx, name.namespace()).await? else {
            return Ok(None);
        };
        let Some(repository_id) = self
            .repository_id(tx, &namespace_id, name.repository())
            .await?
        else {
            return Ok(None);
        };

        Ok(Some(RepositoryIds {
            namespace_id,
            repository_id,
        }))
    }

    /// Ids for a repository, creating the namespace and repository rows as allowed.
    ///
    /// Creation is idempotent: losing a race to create a row reads the winner's id.
    pub(crate) async fn ensure_repository(
        &self,
        name: &RepositoryName,
        create_namespace: bool,
        create_repository: bool,
    ) -> RegistryResult<RepositoryIds> {
        let namespace_id = match self.namespace_id(None, name.namespace()).await? {
            Some(id) => id,
            None if create_namespace => {
                match self
                    .store
                    .create_namespace(None, &self.identity.id, name.namespace())
                    .await
                {
                    Ok(id) => {
                        tracing::debug!(namespace = name.namespace(), "created namespace");
                        id
                    }
                    Err(StoreError::Conflict(_)) => self
                        .namespace_id(None, name.namespace())
                        .await?
                        .ok_or_else(|| RegistryError::NameUnknown(name.to_string()))?,
                    Err(error) => return Err(error.into()),
                }
            }
            None => return Err(RegistryError::NameUnknown(name.to_string())),
        };

        let repository_id = match self
            .repository_id(None, &namespace_id, name.repository())
            .await?
        {
            Some(id) => id,
            None if create_repository => {
                match self
                    .store
                    .create_repository(None, &self.identity.id, &namespace_id, name.repository())
                    .await
                {
                    Ok(id) => {
                        tracing::debug!(repository = %name, "created repository");
                        id
                    }
                    Err(StoreError::Conflict(_)) => self
                        .repository_id(None, &namespace_id, name.repository())
                        .await?
                        .ok_or_else(|| RegistryError::NameUnknown(name.to_string()))?,
                    Err(error) => return Err(error.into()),
                }
            }
            None => return Err(RegistryError::NameUnknown(name.to_string())),
        };

        Ok(RepositoryIds {
            namespace_id,
            repository_id,
        })
    }

    /// The named tag in a repository, created unlinked when missing.
    pub(crate) async fn tag_or_create(
        &self,
        tx: Option<&str>,
        ids: &RepositoryIds,
        name: &str,
    ) -> RegistryResult<Tag> {
        if let Some(tag) = self.store.tag(tx, &ids.repository_id, name).await? {
            return Ok(tag);
        }

        let id = self
            .store
            .create_tag(
                tx,
                &self.identity.id,
                &ids.namespace_id,
                &ids.repository_id,
                name,
            )
            .await?;
        Ok(Tag {
            id,
            registry_id: self.identity.id.clone(),
            namespace_id: ids.namespace_id.clone(),
            repository_id: ids.repository_id.clone(),
            name: name.to_owned(),
            manifest_id: None,
        })
    }
}

/// Blob and manifest lookups, answered locally or through an upstream.
#[async_trait::async_trait]
pub(crate) trait ContentSource: Send + Sync {
    /// Blob metadata and, when `with_content`, its bytes. Unknown blobs are `None`.
    async fn blob(
        &self,
        ctx: &RegistryContext,
        name: &RepositoryName,
        digest: &Digest,
        with_content: bool,
    ) -> RegistryResult<Option<BlobContent>>;

    /// Manifest metadata and, when `with_content`, its bytes. Unknown manifests are `None`.
    async fn manifest(
        &self,
        ctx: &RegistryContext,
        name: &RepositoryName,
        reference: &Reference,
        with_content: bool,
    ) -> RegistryResult<Option<ManifestContent>>;
}

/// Where a registry's content comes from.
#[derive(Debug)]
pub enum Source {
    /// Content pushed by clients.
    Hosted(HostedSource),
    /// Content pulled through from an upstream registry.
    Proxied(ProxiedSource),
}

impl Source {
    fn content(&self) -> &dyn ContentSource {
        match self {
            Source::Hosted(hosted) => hosted,
            Source::Proxied(proxied) => proxied,
        }
    }

    fn hosted(&self) -> RegistryResult<&HostedSource> {
        match self {
            Source::Hosted(hosted) => Ok(hosted),
            Source::Proxied(_) => Err(RegistryError::Unsupported),
        }
    }
}

#[derive(Debug)]
struct ServiceInner {
    context: RegistryContext,
    source: Source,
}

/// The registry protocol engine for one registry.
#[derive(Debug, Clone)]
pub struct RegistryService {
    inner: Arc<ServiceInner>,
}

impl RegistryService {
    /// Create a service with the default id cache size.
    pub fn new(
        identity: RegistryIdentity,
        store: Arc<dyn Store>,
        storage: RegistryStorage,
        source: Source,
    ) -> Self {
        Self::with_id_cache(identity, store, storage, source, DEFAULT_ID_CACHE_CAPACITY)
    }

    /// Create a service memoizing up to `capacity` namespace and repository ids.
    pub fn with_id_cache(
        identity: RegistryIdentity,
        store: Arc<dyn Store>,
        storage: RegistryStorage,
        source: Source,
        capacity: usize,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                context: RegistryContext::new(identity, store, storage, capacity),
                source,
            }),
        }
    }

    /// The registry this service answers for.
    pub fn identity(&self) -> &RegistryIdentity {
        &self.inner.context.identity
    }

    /// Whether clients may push to this registry.
    pub fn is_hosted(&self) -> bool {
        matches!(self.inner.source, Source::Hosted(_))
    }

    fn context(&self) -> &RegistryContext {
        &self.inner.context
    }

    /// Start a blob upload, returning the session id.
    #[tracing::instrument(skip_all, fields(registry = %self.identity().id, repository = %name))]
    pub async fn initiate_upload(&self, name: &RepositoryName) -> RegistryResult<String> {
        self.inner
            .source
            .hosted()?
            .initiate_upload(self.context(), name)
            .await
    }

    /// Write a chunk to an upload session, returning the range it covered.
    #[tracing::instrument(
        skip_all,
        fields(registry = %self.identity().id, repository = %name, %session)
    )]
    pub async fn upload_chunk(
        &self,
        name: &RepositoryName,
        session: &str,
        range: Option<ContentRange>,
        payload: Bytes,
    ) -> RegistryResult<ContentRange> {
        self.inner
            .source
            .hosted()?
            .upload_chunk(self.context(), name, session, range, &payload)
            .await
    }

    /// Complete an upload as the blob `digest`.
    #[tracing::instrument(
        skip_all,
        fields(registry = %self.identity().id, repository = %name, %session, %digest)
    )]
    pub async fn finalize_upload(
        &self,
        name: &RepositoryName,
        session: &str,
        digest: &Digest,
        payload: Bytes,
    ) -> RegistryResult<Digest> {
        self.inner
            .source
            .hosted()?
            .finalize_upload(self.context(), name, session, digest, &payload)
            .await
    }

    /// Look up a blob.
    #[tracing::instrument(
        skip_all,
        fields(registry = %self.identity().id, repository = %name, %digest)
    )]
    pub async fn blob(
        &self,
        name: &RepositoryName,
        digest: &Digest,
        with_content: bool,
    ) -> RegistryResult<BlobContent> {
        self.inner
            .source
            .content()
            .blob(self.context(), name, digest, with_content)
            .await?
            .ok_or_else(|| RegistryError::BlobUnknown(digest.to_string()))
    }

    /// Look up a manifest by tag or digest.
    #[tracing::instrument(
        skip_all,
        fields(registry = %self.identity().id, repository = %name, %reference)
    )]
    pub async fn manifest(
        &self,
        name: &RepositoryName,
        reference: &Reference,
        with_content: bool,
    ) -> RegistryResult<ManifestContent> {
        self.inner
            .source
            .content()
            .manifest(self.context(), name, reference, with_content)
            .await?
            .ok_or_else(|| RegistryError::ManifestUnknown(reference.to_string()))
    }

    /// Store a manifest under a tag or digest, returning the digest now associated with it.
    #[tracing::instrument(
        skip_all,
        fields(registry = %self.identity().id, repository = %name, %reference)
    )]
    pub async fn put_manifest(
        &self,
        name: &RepositoryName,
        reference: &Reference,
        media_type: &str,
        content: Bytes,
    ) -> RegistryResult<Digest> {
        self.inner
            .source
            .hosted()?
            .put_manifest(self.context(), name, reference, media_type, content)
            .await
    }

    /// Remove temp files left by uploads whose session no longer exists.
    ///
    /// Returns the number of files removed.
    #[tracing::instrument(skip_all, fields(registry = %self.identity().id))]
    pub async fn sweep_uploads(&self) -> RegistryResult<usize> {
        self.inner
            .source
            .hosted()?
            .sweep_uploads(self.context())
            .await
    }

    /// Tag names in a repository.
    #[tracing::instrument(skip_all, fields(registry = %self.identity().id, repository = %name))]
    pub async fn tags(&self, name: &RepositoryName) -> RegistryResult<Vec<String>> {
        let ctx = self.context();
        let ids = ctx
            .find_repository(None, name)
            .await?
            .ok_or_else(|| RegistryError::NameUnknown(name.to_string()))?;
        Ok(ctx.store.tag_names(None, &ids.repository_id).await?)
    }
}

/// Whether an error means another request holds the transaction key.
#[cfg(test)]
pub(crate) fn is_busy(error: &RegistryError) -> bool {
    matches!(
        error,
        RegistryError::Transaction(TransactionError::InUse(_))
            | RegistryError::Store(StoreError::Transaction(TransactionError::InUse(_)))
    )
}

/// Whether an error is a unique-constraint violation, raised by a write or at commit.
pub(crate) fn is_conflict(error: &RegistryError) -> bool {
    match error {
        RegistryError::Store(StoreError::Conflict(_)) => true,
        RegistryError::Transaction(TransactionError::Backend(source))
        | RegistryError::Store(StoreError::Transaction(TransactionError::Backend(source))) => {
            matches!(
                source.downcast_ref::<StoreError>(),
                Some(StoreError::Conflict(_))
            )
        }
        _ => false,
    }
}
