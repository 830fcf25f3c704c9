//! In-process [`Store`](super::Store) for development and tests.
//!
//! Transactions run against a snapshot of the tables and record a journal of
//! mutations. Commit replays the journal against the live tables; if any step
//! violates a constraint the live tables are left untouched.
//!
//! Tables are shared copy-on-write, so a snapshot copies a table only when the
//! transaction first writes to it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use keyed_tx::{TransactionBackend, TransactionCoordinator, TransactionError, TransactionManager};
use parking_lot::RwLock;
use uuid::Uuid;

use super::{
    BlobMeta, BlobStore, CacheEntry, CacheStore, Manifest, ManifestStore, Namespace,
    NamespaceStore, NewManifest, Repository, RepositoryStore, StoreError, Tag, TagStore, Tx,
    UploadSession,
};

type Table<K, V> = Arc<HashMap<K, V>>;

#[derive(Debug, Clone, Default)]
struct Tables {
    namespaces: Table<String, Namespace>,
    repositories: Table<String, Repository>,
    blobs: Table<(String, String), BlobMeta>,
    uploads: Table<String, UploadSession>,
    manifests: Table<String, Manifest>,
    tags: Table<String, Tag>,
    cache: Table<(String, String), CacheEntry>,
}

#[derive(Debug, Clone)]
enum Mutation {
    CreateNamespace(Namespace),
    CreateRepository(Repository),
    CreateBlob(BlobMeta),
    CreateUpload(UploadSession),
    UpdateUpload {
        id: String,
        is_chunked: bool,
        bytes_received: u64,
        last_updated: DateTime<Utc>,
    },
    DeleteUpload(String),
    CreateManifest(Manifest),
    CreateTag(Tag),
    LinkTag {
        tag_id: String,
        manifest_id: String,
    },
    CreateCache(CacheEntry),
    RefreshCache {
        repository_id: String,
        identifier: String,
        expires_at: DateTime<Utc>,
    },
    DeleteCache {
        repository_id: String,
        identifier: String,
    },
}

impl Mutation {
    fn apply(&self, tables: &mut Tables) -> Result<(), StoreError> {
        match self {
            Mutation::CreateNamespace(namespace) => {
                if tables
                    .namespaces
                    .values()
                    .any(|n| n.registry_id == namespace.registry_id && n.name == namespace.name)
                {
                    return Err(StoreError::Conflict(format!("namespace {}", namespace.name)));
                }
                Arc::make_mut(&mut tables.namespaces)
                    .insert(namespace.id.clone(), namespace.clone());
            }
            Mutation::CreateRepository(repository) => {
                if !tables.namespaces.contains_key(&repository.namespace_id) {
                    return Err(StoreError::NotFound(format!(
                        "namespace {}",
                        repository.namespace_id
                    )));
                }
                if tables.repositories.values().any(|r| {
                    r.namespace_id == repository.namespace_id && r.name == repository.name
                }) {
                    return Err(StoreError::Conflict(format!(
                        "repository {}",
                        repository.name
                    )));
                }
                Arc::make_mut(&mut tables.repositories)
                    .insert(repository.id.clone(), repository.clone());
            }
            Mutation::CreateBlob(blob) => {
                let key = (blob.repository_id.clone(), blob.digest.clone());
                if tables.blobs.contains_key(&key) {
                    return Err(StoreError::Conflict(format!("blob {}", blob.digest)));
                }
                Arc::make_mut(&mut tables.blobs).insert(key, blob.clone());
            }
            Mutation::CreateUpload(session) => {
                if tables.uploads.contains_key(&session.id) {
                    return Err(StoreError::Conflict(format!("upload {}", session.id)));
                }
                Arc::make_mut(&mut tables.uploads).insert(session.id.clone(), session.clone());
            }
            Mutation::UpdateUpload {
                id,
                is_chunked,
                bytes_received,
                last_updated,
            } => {
                let session = Arc::make_mut(&mut tables.uploads)
                    .get_mut(id)
                    .ok_or_else(|| StoreError::NotFound(format!("upload {id}")))?;
                session.is_chunked = *is_chunked;
                session.bytes_received = *bytes_received;
                session.last_updated = *last_updated;
            }
            Mutation::DeleteUpload(id) => {
                Arc::make_mut(&mut tables.uploads)
                    .remove(id)
                    .ok_or_else(|| StoreError::NotFound(format!("upload {id}")))?;
            }
            Mutation::CreateManifest(manifest) => {
                if tables.manifests.values().any(|m| {
                    m.repository_id == manifest.repository_id && m.digest == manifest.digest
                }) {
                    return Err(StoreError::Conflict(format!("manifest {}", manifest.digest)));
                }
                Arc::make_mut(&mut tables.manifests)
                    .insert(manifest.id.clone(), manifest.clone());
            }
            Mutation::CreateTag(tag) => {
                if tables
                    .tags
                    .values()
                    .any(|t| t.repository_id == tag.repository_id && t.name == tag.name)
                {
                    return Err(StoreError::Conflict(format!("tag {}", tag.name)));
                }
                Arc::make_mut(&mut tables.tags).insert(tag.id.clone(), tag.clone());
            }
            Mutation::LinkTag {
                tag_id,
                manifest_id,
            } => {
                if !tables.manifests.contains_key(manifest_id) {
                    return Err(StoreError::NotFound(format!("manifest {manifest_id}")));
                }
                let tag = Arc::make_mut(&mut tables.tags)
                    .get_mut(tag_id)
                    .ok_or_else(|| StoreError::NotFound(format!("tag {tag_id}")))?;
                tag.manifest_id = Some(manifest_id.clone());
            }
            Mutation::CreateCache(entry) => {
                let key = (entry.repository_id.clone(), entry.identifier.clone());
                if tables.cache.contains_key(&key) {
                    return Err(StoreError::Conflict(format!(
                        "cache entry {}",
                        entry.identifier
                    )));
                }
                Arc::make_mut(&mut tables.cache).insert(key, entry.clone());
            }
            Mutation::RefreshCache {
                repository_id,
                identifier,
                expires_at,
            } => {
                let entry = Arc::make_mut(&mut tables.cache)
                    .get_mut(&(repository_id.clone(), identifier.clone()))
                    .ok_or_else(|| StoreError::NotFound(format!("cache entry {identifier}")))?;
                entry.expires_at = *expires_at;
            }
            Mutation::DeleteCache {
                repository_id,
                identifier,
            } => {
                Arc::make_mut(&mut tables.cache)
                    .remove(&(repository_id.clone(), identifier.clone()))
                    .ok_or_else(|| StoreError::NotFound(format!("cache entry {identifier}")))?;
            }
        }
        Ok(())
    }
}

/// An open transaction: a private copy of the tables plus the writes made to it.
#[derive(Debug)]
pub struct MemoryTransaction {
    snapshot: Tables,
    journal: Vec<Mutation>,
}

/// Owns the live tables.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    tables: RwLock<Tables>,
}

#[async_trait::async_trait]
impl TransactionBackend for MemoryBackend {
    type Transaction = MemoryTransaction;

    async fn begin(&self) -> Result<Self::Transaction, TransactionError> {
        Ok(MemoryTransaction {
            snapshot: self.tables.read().clone(),
            journal: Vec::new(),
        })
    }

    async fn commit(&self, tx: Self::Transaction) -> Result<(), TransactionError> {
        let mut tables = self.tables.write();
        let mut next = tables.clone();
        for mutation in &tx.journal {
            mutation
                .apply(&mut next)
                .map_err(|error| TransactionError::Backend(Box::new(error)))?;
        }
        *tables = next;
        Ok(())
    }

    async fn rollback(&self, _tx: Self::Transaction) -> Result<(), TransactionError> {
        Ok(())
    }
}

/// A [`Store`](super::Store) held entirely in memory.
#[derive(Debug)]
pub struct MemoryStore {
    transactions: TransactionManager<MemoryBackend>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self {
            transactions: TransactionManager::new(MemoryBackend::default()),
        }
    }

    fn read<R>(&self, tx: Tx<'_>, f: impl FnOnce(&Tables) -> R) -> Result<R, StoreError> {
        match tx {
            Some(key) => Ok(self.transactions.with(key, |tx| f(&tx.snapshot))?),
            None => Ok(f(&self.transactions.backend().tables.read())),
        }
    }

    fn write(&self, tx: Tx<'_>, mutation: Mutation) -> Result<(), StoreError> {
        match tx {
            Some(key) => self.transactions.with(key, |tx| -> Result<(), StoreError> {
                mutation.apply(&mut tx.snapshot)?;
                tx.journal.push(mutation);
                Ok(())
            })?,
            None => mutation.apply(&mut self.transactions.backend().tables.write()),
        }
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[async_trait::async_trait]
impl TransactionCoordinator for MemoryStore {
    async fn begin(&self, key: &str) -> Result<(), TransactionError> {
        self.transactions.begin(key).await
    }

    async fn commit(&self, key: &str) -> Result<(), TransactionError> {
        self.transactions.commit(key).await
    }

    async fn rollback(&self, key: &str) -> Result<(), TransactionError> {
        self.transactions.rollback(key).await
    }
}

#[async_trait::async_trait]
impl NamespaceStore for MemoryStore {
    async fn namespace_id(
        &self,
        tx: Tx<'_>,
        registry_id: &str,
        name: &str,
    ) -> Result<Option<String>, StoreError> {
        self.read(tx, |tables| {
            tables
                .namespaces
                .values()
                .find(|n| n.registry_id == registry_id && n.name == name)
                .map(|n| n.id.clone())
        })
    }

    async fn create_namespace(
        &self,
        tx: Tx<'_>,
        registry_id: &str,
        name: &str,
    ) -> Result<String, StoreError> {
        let id = new_id();
        self.write(
            tx,
            Mutation::CreateNamespace(Namespace {
                id: id.clone(),
                registry_id: registry_id.to_owned(),
                name: name.to_owned(),
            }),
        )?;
        Ok(id)
    }
}

#[async_trait::async_trait]
impl RepositoryStore for MemoryStore {
    async fn repository_id(
        &self,
        tx: Tx<'_>,
        namespace_id: &str,
        name: &str,
    ) -> Result<Option<String>, StoreError> {
        self.read(tx, |tables| {
            tables
                .repositories
                .values()
                .find(|r| r.namespace_id == namespace_id && r.name == name)
                .map(|r| r.id.clone())
        })
    }

    async fn create_repository(
        &self,
        tx: Tx<'_>,
        registry_id: &str,
        namespace_id: &str,
        name: &str,
    ) -> Result<String, StoreError> {
        let id = new_id();
        self.write(
            tx,
            Mutation::CreateRepository(Repository {
                id: id.clone(),
                registry_id: registry_id.to_owned(),
                namespace_id: namespace_id.to_owned(),
                name: name.to_owned(),
            }),
        )?;
        Ok(id)
    }
}

#[async_trait::async_trait]
impl BlobStore for MemoryStore {
    async fn blob(
        &self,
        tx: Tx<'_>,
        repository_id: &str,
        digest: &str,
    ) -> Result<Option<BlobMeta>, StoreError> {
        self.read(tx, |tables| {
            tables
                .blobs
                .get(&(repository_id.to_owned(), digest.to_owned()))
                .cloned()
        })
    }

    async fn create_blob(&self, tx: Tx<'_>, blob: BlobMeta) -> Result<(), StoreError> {
        self.write(tx, Mutation::CreateBlob(blob))
    }

    async fn create_upload(&self, tx: Tx<'_>, session: UploadSession) -> Result<(), StoreError> {
        self.write(tx, Mutation::CreateUpload(session))
    }

    async fn upload(&self, tx: Tx<'_>, id: &str) -> Result<Option<UploadSession>, StoreError> {
        self.read(tx, |tables| tables.uploads.get(id).cloned())
    }

    async fn update_upload(
        &self,
        tx: Tx<'_>,
        id: &str,
        is_chunked: bool,
        bytes_received: u64,
    ) -> Result<(), StoreError> {
        self.write(
            tx,
            Mutation::UpdateUpload {
                id: id.to_owned(),
                is_chunked,
                bytes_received,
                last_updated: Utc::now(),
            },
        )
    }

    async fn delete_upload(&self, tx: Tx<'_>, id: &str) -> Result<(), StoreError> {
        self.write(tx, Mutation::DeleteUpload(id.to_owned()))
    }
}

#[async_trait::async_trait]
impl ManifestStore for MemoryStore {
    async fn manifest(&self, tx: Tx<'_>, id: &str) -> Result<Option<Manifest>, StoreError> {
        self.read(tx, |tables| tables.manifests.get(id).cloned())
    }

    async fn manifest_by_digest(
        &self,
        tx: Tx<'_>,
        repository_id: &str,
        digest: &str,
    ) -> Result<Option<Manifest>, StoreError> {
        self.read(tx, |tables| {
            tables
                .manifests
                .values()
                .find(|m| m.repository_id == repository_id && m.digest == digest)
                .cloned()
        })
    }

    async fn manifest_by_unique_digest(
        &self,
        tx: Tx<'_>,
        repository_id: &str,
        unique_digest: &str,
    ) -> Result<Option<Manifest>, StoreError> {
        self.read(tx, |tables| {
            tables
                .manifests
                .values()
                .find(|m| m.repository_id == repository_id && m.unique_digest == unique_digest)
                .cloned()
        })
    }

    async fn create_manifest(
        &self,
        tx: Tx<'_>,
        manifest: NewManifest,
    ) -> Result<String, StoreError> {
        let id = new_id();
        self.write(
            tx,
            Mutation::CreateManifest(Manifest {
                id: id.clone(),
                registry_id: manifest.registry_id,
                namespace_id: manifest.namespace_id,
                repository_id: manifest.repository_id,
                digest: manifest.digest,
                unique_digest: manifest.unique_digest,
                media_type: manifest.media_type,
                content: manifest.content,
            }),
        )?;
        Ok(id)
    }
}

#[async_trait::async_trait]
impl TagStore for MemoryStore {
    async fn tag(
        &self,
        tx: Tx<'_>,
        repository_id: &str,
        name: &str,
    ) -> Result<Option<Tag>, StoreError> {
        self.read(tx, |tables| {
            tables
                .tags
                .values()
                .find(|t| t.repository_id == repository_id && t.name == name)
                .cloned()
        })
    }

    async fn create_tag(
        &self,
        tx: Tx<'_>,
        registry_id: &str,
        namespace_id: &str,
        repository_id: &str,
        name: &str,
    ) -> Result<String, StoreError> {
        let id = new_id();
        self.write(
            tx,
            Mutation::CreateTag(Tag {
                id: id.clone(),
                registry_id: registry_id.to_owned(),
                namespace_id: namespace_id.to_owned(),
                repository_id: repository_id.to_owned(),
                name: name.to_owned(),
                manifest_id: None,
            }),
        )?;
        Ok(id)
    }

    async fn link_manifest(
        &self,
        tx: Tx<'_>,
        tag_id: &str,
        manifest_id: &str,
    ) -> Result<(), StoreError> {
        self.write(
            tx,
            Mutation::LinkTag {
                tag_id: tag_id.to_owned(),
                manifest_id: manifest_id.to_owned(),
            },
        )
    }

    async fn tag_names(&self, tx: Tx<'_>, repository_id: &str) -> Result<Vec<String>, StoreError> {
        self.read(tx, |tables| {
            let mut names: Vec<String> = tables
                .tags
                .values()
                .filter(|t| t.repository_id == repository_id)
                .map(|t| t.name.clone())
                .collect();
            names.sort();
            names
        })
    }
}

#[async_trait::async_trait]
impl CacheStore for MemoryStore {
    async fn cache_entry(
        &self,
        tx: Tx<'_>,
        repository_id: &str,
        identifier: &str,
    ) -> Result<Option<CacheEntry>, StoreError> {
        self.read(tx, |tables| {
            tables
                .cache
                .get(&(repository_id.to_owned(), identifier.to_owned()))
                .cloned()
        })
    }

    async fn create_cache_entry(&self, tx: Tx<'_>, entry: CacheEntry) -> Result<(), StoreError> {
        self.write(tx, Mutation::CreateCache(entry))
    }

    async fn refresh_cache_entry(
        &self,
        tx: Tx<'_>,
        repository_id: &str,
        identifier: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.write(
            tx,
            Mutation::RefreshCache {
                repository_id: repository_id.to_owned(),
                identifier: identifier.to_owned(),
                expires_at,
            },
        )
    }

    async fn delete_cache_entry(
        &self,
        tx: Tx<'_>,
        repository_id: &str,
        identifier: &str,
    ) -> Result<(), StoreError> {
        self.write(
            tx,
            Mutation::DeleteCache {
                repository_id: repository_id.to_owned(),
                identifier: identifier.to_owned(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    async fn repository(store: &MemoryStore) -> (String, String) {
        let ns = store.create_namespace(None, "r", "library").await.unwrap();
        let repo = store
            .create_repository(None, "r", &ns, "alpine")
            .await
            .unwrap();
        (ns, repo)
    }

    fn manifest(ns: &str, repo: &str, digest: &str) -> NewManifest {
        NewManifest {
            registry_id: "r".into(),
            namespace_id: ns.into(),
            repository_id: repo.into(),
            digest: digest.into(),
            unique_digest: format!("unique-{digest}"),
            media_type: "application/vnd.oci.image.manifest.v1+json".into(),
            content: Bytes::from_static(b"{}"),
        }
    }

    #[tokio::test]
    async fn writes_without_transaction_apply_immediately() {
        let store = MemoryStore::new();
        let (ns, repo) = repository(&store).await;

        assert_eq!(
            store.namespace_id(None, "r", "library").await.unwrap(),
            Some(ns.clone())
        );
        assert_eq!(
            store.repository_id(None, &ns, "alpine").await.unwrap(),
            Some(repo)
        );
        assert!(matches!(
            store.create_namespace(None, "r", "library").await,
            Err(StoreError::Conflict(_))
        ));
        // Same name in another registry is a different namespace.
        store.create_namespace(None, "other", "library").await.unwrap();
    }

    #[tokio::test]
    async fn transaction_writes_are_private_until_commit() {
        let store = MemoryStore::new();
        store.begin("k").await.unwrap();

        let ns = store
            .create_namespace(Some("k"), "r", "library")
            .await
            .unwrap();
        assert_eq!(
            store.namespace_id(Some("k"), "r", "library").await.unwrap(),
            Some(ns.clone())
        );
        assert_eq!(store.namespace_id(None, "r", "library").await.unwrap(), None);

        store.commit("k").await.unwrap();
        assert_eq!(
            store.namespace_id(None, "r", "library").await.unwrap(),
            Some(ns)
        );
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let store = MemoryStore::new();
        store.begin("k").await.unwrap();
        store
            .create_namespace(Some("k"), "r", "library")
            .await
            .unwrap();
        store.rollback("k").await.unwrap();

        assert_eq!(store.namespace_id(None, "r", "library").await.unwrap(), None);
        assert!(matches!(
            store.namespace_id(Some("k"), "r", "library").await,
            Err(StoreError::Transaction(TransactionError::Closed(_)))
        ));
    }

    #[tokio::test]
    async fn conflicting_commit_leaves_tables_unchanged() {
        let store = MemoryStore::new();
        store.begin("a").await.unwrap();
        store.begin("b").await.unwrap();

        store.create_namespace(Some("a"), "r", "library").await.unwrap();
        store.create_namespace(Some("b"), "r", "other").await.unwrap();
        store.create_namespace(Some("b"), "r", "library").await.unwrap();

        store.commit("a").await.unwrap();
        assert!(store.commit("b").await.is_err());

        assert!(store.namespace_id(None, "r", "library").await.unwrap().is_some());
        assert_eq!(store.namespace_id(None, "r", "other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn upload_sessions() {
        let store = MemoryStore::new();
        let session = UploadSession {
            id: "s1".into(),
            registry_id: "r".into(),
            namespace: "library".into(),
            repository: "alpine".into(),
            is_chunked: false,
            bytes_received: 0,
            last_updated: Utc::now(),
        };
        store.create_upload(None, session).await.unwrap();
        store.update_upload(None, "s1", true, 42).await.unwrap();

        let session = store.upload(None, "s1").await.unwrap().unwrap();
        assert!(session.is_chunked);
        assert_eq!(session.bytes_received, 42);

        store.delete_upload(None, "s1").await.unwrap();
        assert_eq!(store.upload(None, "s1").await.unwrap(), None);
        assert!(matches!(
            store.update_upload(None, "s1", true, 1).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn tags_link_to_manifests() {
        let store = MemoryStore::new();
        let (ns, repo) = repository(&store).await;

        let first = store
            .create_manifest(None, manifest(&ns, &repo, "sha256:1"))
            .await
            .unwrap();
        let second = store
            .create_manifest(None, manifest(&ns, &repo, "sha256:2"))
            .await
            .unwrap();
        assert!(matches!(
            store
                .create_manifest(None, manifest(&ns, &repo, "sha256:1"))
                .await,
            Err(StoreError::Conflict(_))
        ));

        let tag = store
            .create_tag(None, "r", &ns, &repo, "latest")
            .await
            .unwrap();
        store.link_manifest(None, &tag, &first).await.unwrap();
        store.link_manifest(None, &tag, &second).await.unwrap();
        store.create_tag(None, "r", &ns, &repo, "edge").await.unwrap();

        let latest = store.tag(None, &repo, "latest").await.unwrap().unwrap();
        assert_eq!(latest.manifest_id.as_deref(), Some(second.as_str()));
        assert_eq!(
            store.tag_names(None, &repo).await.unwrap(),
            vec!["edge".to_string(), "latest".to_string()]
        );

        let found = store
            .manifest_by_unique_digest(None, &repo, "unique-sha256:1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, first);
        assert!(matches!(
            store.link_manifest(None, &tag, "missing").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn cache_entries() {
        let store = MemoryStore::new();
        let (ns, repo) = repository(&store).await;
        let now = Utc::now();

        let entry = CacheEntry {
            registry_id: "r".into(),
            namespace_id: ns,
            repository_id: repo.clone(),
            identifier: "latest".into(),
            digest: "sha256:1".into(),
            expires_at: now,
        };
        store.create_cache_entry(None, entry.clone()).await.unwrap();
        assert!(store.create_cache_entry(None, entry).await.is_err());

        let later = now + chrono::Duration::seconds(60);
        store
            .refresh_cache_entry(None, &repo, "latest", later)
            .await
            .unwrap();
        let entry = store
            .cache_entry(None, &repo, "latest")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.expires_at, later);
        assert!(!entry.is_expired(now));

        store.delete_cache_entry(None, &repo, "latest").await.unwrap();
        assert_eq!(store.cache_entry(None, &repo, "latest").await.unwrap(), None);
    }

    #[tokio::test]
    async fn snapshots_copy_a_table_on_first_write() {
        let store = MemoryStore::new();
        let (ns, repo) = repository(&store).await;
        store.begin("k").await.unwrap();

        let shared = |store: &MemoryStore| {
            let live = store.transactions.backend().tables.read().clone();
            store
                .transactions
                .with("k", |tx| {
                    (
                        Arc::ptr_eq(&tx.snapshot.namespaces, &live.namespaces),
                        Arc::ptr_eq(&tx.snapshot.tags, &live.tags),
                    )
                })
                .unwrap()
        };
        assert_eq!(shared(&store), (true, true));

        store
            .create_tag(Some("k"), "r", &ns, &repo, "latest")
            .await
            .unwrap();
        assert_eq!(shared(&store), (true, false));
        assert_eq!(store.tag(None, &repo, "latest").await.unwrap(), None);

        store.commit("k").await.unwrap();
        assert!(store.tag(None, &repo, "latest").await.unwrap().is_some());
    }
}
