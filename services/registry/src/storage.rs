//! Blob content locations for the registry

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use storage::{Storage, StorageBucket};

use crate::digest::Digest;
use crate::error::RegistryResult;
use crate::names::RepositoryName;

/// What a storage location holds.
#[derive(Debug, Clone, Copy)]
pub enum ContentKey<'a> {
    /// Finished content, addressed by digest.
    Blob(&'a Digest),
    /// An in-progress upload, addressed by session id.
    Upload(&'a str),
}

/// Directory holding every in-progress upload of a registry.
pub fn upload_root(registry: &str) -> Utf8PathBuf {
    Utf8PathBuf::from("uploads").join(registry)
}

/// Deterministic storage path for content in a repository.
///
/// Blobs live at `blobs/{registry}/{namespace}/{repository}/{algorithm}/{encoded}`,
/// uploads at `uploads/{registry}/{namespace}/{repository}/{session}`.
pub fn location(registry: &str, name: &RepositoryName, key: ContentKey<'_>) -> Utf8PathBuf {
    let mut path = Utf8PathBuf::from(match key {
        ContentKey::Blob(_) => "blobs",
        ContentKey::Upload(_) => "uploads",
    });
    path.push(registry);
    path.push(name.namespace());
    path.push(name.repository());

    match key {
        ContentKey::Blob(digest) => {
            path.push(digest.algorithm());
            path.push(digest.encoded());
        }
        ContentKey::Upload(session) => path.push(session),
    }
    path
}

/// Blob content storage for one registry bucket.
#[derive(Debug, Clone)]
pub struct RegistryStorage {
    bucket: StorageBucket,
}

impl RegistryStorage {
    /// Use `bucket` within `storage`.
    pub fn new(storage: &Storage, bucket: impl Into<String>) -> Self {
        Self {
            bucket: storage.bucket(bucket),
        }
    }

    /// Write a whole file.
    pub async fn write(&self, path: &Utf8Path, data: &[u8]) -> RegistryResult<()> {
        let mut reader = data;
        self.bucket.upload(path, &mut reader).await?;
        Ok(())
    }

    /// Write a chunk at `offset`.
    pub async fn write_at(&self, path: &Utf8Path, offset: u64, data: &[u8]) -> RegistryResult<()> {
        self.bucket.write_at(path, offset, data).await?;
        Ok(())
    }

    /// Move a file, replacing the destination.
    pub async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> RegistryResult<()> {
        self.bucket.rename(from, to).await?;
        Ok(())
    }

    /// Read a whole file.
    pub async fn read(&self, path: &Utf8Path) -> RegistryResult<Bytes> {
        Ok(Bytes::from(self.bucket.read(path).await?))
    }

    /// Size of a file in bytes.
    pub async fn size(&self, path: &Utf8Path) -> RegistryResult<u64> {
        Ok(self.bucket.metadata(path).await?.size)
    }

    /// Files below `prefix`, as paths within the bucket.
    pub async fn list(&self, prefix: &Utf8Path) -> RegistryResult<Vec<Utf8PathBuf>> {
        let paths = self.bucket.list(Some(prefix)).await?;
        Ok(paths.into_iter().map(Utf8PathBuf::from).collect())
    }

    /// Remove a file, ignoring one that is already gone.
    ///
    /// Used on cleanup paths, so failures are logged rather than returned.
    pub async fn discard(&self, path: &Utf8Path) {
        match self.bucket.delete(path).await {
            Ok(()) => tracing::trace!(%path, "discarded"),
            Err(error) if error.is_not_found() => {}
            Err(error) => tracing::warn!(%path, %error, "failed to discard file"),
        }
    }
}
