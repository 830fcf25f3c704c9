use std::collections::HashMap;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::{io::AsyncWriteExt, sync::RwLock};

use storage_driver::{Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer};

#[derive(Debug)]
struct MemoryFileItem {
    created: DateTime<Utc>,
    data: Vec<u8>,
}

impl AsRef<[u8]> for MemoryFileItem {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl From<Vec<u8>> for MemoryFileItem {
    fn from(data: Vec<u8>) -> Self {
        Self {
            created: Utc::now(),
            data,
        }
    }
}

impl From<&MemoryFileItem> for Metadata {
    fn from(value: &MemoryFileItem) -> Self {
        Self {
            created: value.created,
            size: value.data.len() as u64,
        }
    }
}

type Bucket = HashMap<Utf8PathBuf, MemoryFileItem>;

/// Storage driver that stores files in memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    buckets: RwLock<HashMap<String, Bucket>>,
}

impl MemoryStorage {
    /// Create a new `MemoryStorage` instance, with no buckets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new `MemoryStorage` instance, with the given buckets.
    pub fn with_buckets(buckets: &[&str]) -> Self {
        let mut map = HashMap::new();
        for bucket in buckets {
            map.insert(bucket.to_string(), HashMap::new());
        }

        Self {
            buckets: RwLock::new(map),
        }
    }

    /// Create a new bucket in the storage.
    pub async fn create_bucket(&self, bucket: String) {
        let mut buckets = self.buckets.write().await;
        buckets.insert(bucket, HashMap::new());
    }

    fn missing_bucket(&self, bucket: &str) -> StorageError {
        StorageError::builder(
            self.name(),
            StorageErrorKind::NotFound,
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Bucket not found: {bucket}"),
            ),
        )
        .bucket(bucket)
        .context("bucket not found")
        .build()
    }
}

#[async_trait::async_trait]
impl Driver for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn scheme(&self) -> &str {
        "memory"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let buckets = self.buckets.read().await;
        let bucket_map = buckets
            .get(bucket)
            .ok_or_else(|| self.missing_bucket(bucket))?;
        Ok(bucket_map
            .get(remote)
            .ok_or_else(|| StorageError::not_found(self.name(), bucket, remote.as_str()))?
            .into())
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets
            .get_mut(bucket)
            .ok_or_else(|| self.missing_bucket(bucket))?;
        bucket_map.remove(remote);

        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let mut buf = Vec::new();

        tokio::io::copy(local, &mut buf)
            .await
            .map_err(|err| StorageError::io(self.name(), err))?;

        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets.entry(bucket.to_string()).or_default();
        bucket_map.insert(remote.to_owned(), buf.into());

        Ok(())
    }

    async fn write_at(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        offset: u64,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let start = usize::try_from(offset).map_err(|err| {
            StorageError::builder(self.name(), StorageErrorKind::InvalidRequest, err)
                .bucket(bucket)
                .path(remote.as_str())
                .build()
        })?;
        let end = start + data.len();

        let mut buckets = self.buckets.write().await;
        let item = buckets
            .entry(bucket.to_string())
            .or_default()
            .entry(remote.to_owned())
            .or_insert_with(|| Vec::new().into());

        if item.data.len() < end {
            item.data.resize(end, 0);
        }
        item.data[start..end].copy_from_slice(data);

        Ok(())
    }

    async fn rename(
        &self,
        bucket: &str,
        from: &Utf8Path,
        to: &Utf8Path,
    ) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets
            .get_mut(bucket)
            .ok_or_else(|| self.missing_bucket(bucket))?;
        let item = bucket_map
            .remove(from)
            .ok_or_else(|| StorageError::not_found(self.name(), bucket, from.as_str()))?;
        bucket_map.insert(to.to_owned(), item);
        Ok(())
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let buckets = self.buckets.read().await;
        let bucket_map = buckets
            .get(bucket)
            .ok_or_else(|| self.missing_bucket(bucket))?;
        let mut buf = bucket_map
            .get(remote)
            .ok_or_else(|| StorageError::not_found(self.name(), bucket, remote.as_str()))?
            .as_ref();

        tokio::io::copy(&mut buf, local)
            .await
            .map_err(|err| StorageError::io(self.name(), err))?;

        local
            .flush()
            .await
            .map_err(|err| StorageError::io(self.name(), err))?;

        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        tracing::trace!(%bucket, ?prefix, "list memory bucket");

        let buckets = self.buckets.read().await;
        let bucket_map = buckets
            .get(bucket)
            .ok_or_else(|| self.missing_bucket(bucket))?;

        let mut paths = Vec::new();
        for path in bucket_map.keys() {
            if let Some(prefix) = prefix {
                if path.starts_with(prefix) {
                    paths.push(path.to_string());
                }
            } else {
                paths.push(path.to_string());
            }
        }

        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read(storage: &MemoryStorage, path: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        storage
            .download("b", Utf8Path::new(path), &mut buf)
            .await
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn chunks_are_written_at_offsets() {
        let storage = MemoryStorage::with_buckets(&["b"]);
        let path = Utf8Path::new("uploads/session");

        storage.write_at("b", path, 0, b"hello ").await.unwrap();
        storage.write_at("b", path, 6, b"world").await.unwrap();
        assert_eq!(read(&storage, "uploads/session").await, b"hello world");

        storage.write_at("b", path, 13, b"!").await.unwrap();
        assert_eq!(
            read(&storage, "uploads/session").await,
            b"hello world\0\0!"
        );
        assert_eq!(storage.metadata("b", path).await.unwrap().size, 14);
    }

    #[tokio::test]
    async fn rename_moves_content() {
        let storage = MemoryStorage::with_buckets(&["b"]);
        storage
            .write_at("b", Utf8Path::new("tmp"), 0, b"data")
            .await
            .unwrap();
        storage
            .rename("b", Utf8Path::new("tmp"), Utf8Path::new("final"))
            .await
            .unwrap();

        assert_eq!(read(&storage, "final").await, b"data");
        let err = storage
            .metadata("b", Utf8Path::new("tmp"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let err = storage
            .rename("b", Utf8Path::new("tmp"), Utf8Path::new("other"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn missing_bucket_is_not_found() {
        let storage = MemoryStorage::new();
        let err = storage
            .metadata("nope", Utf8Path::new("x"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.bucket(), Some("nope"));
    }
}
