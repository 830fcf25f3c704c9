use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

use crate::local::LocalDriver;
use storage_driver::{Driver, Metadata, Reader, StorageError, Writer};

/// A storage driver that stores files in a temporary directory.
///
/// The directory is removed when the driver is dropped.
#[derive(Debug)]
pub struct TempDriver {
    #[allow(unused)]
    dir: TempDir,
    driver: LocalDriver,
}

impl TempDriver {
    /// Create a new `TempDriver` instance, storing files in a temporary directory.
    pub fn new() -> io::Result<Self> {
        let tmp = TempDir::new()?;
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_owned()).map_err(|path| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("temporary directory is not utf-8: {}", path.display()),
            )
        })?;

        Ok(Self {
            dir: tmp,
            driver: LocalDriver::new(root),
        })
    }
}

#[async_trait::async_trait]
impl Driver for TempDriver {
    fn name(&self) -> &'static str {
        "temp"
    }

    fn scheme(&self) -> &str {
        "tmp"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.driver.metadata(bucket, remote).await
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(bucket, remote).await
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        self.driver.upload(bucket, remote, local).await
    }

    async fn write_at(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        offset: u64,
        data: &[u8],
    ) -> Result<(), StorageError> {
        self.driver.write_at(bucket, remote, offset, data).await
    }

    async fn rename(
        &self,
        bucket: &str,
        from: &Utf8Path,
        to: &Utf8Path,
    ) -> Result<(), StorageError> {
        self.driver.rename(bucket, from, to).await
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        self.driver.download(bucket, remote, local).await
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        self.driver.list(bucket, prefix).await
    }
}

#[cfg(test)]
mod tests {
    use storage_driver::StorageErrorKind;

    use super::*;

    async fn read(driver: &TempDriver, path: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        driver
            .download("bucket", Utf8Path::new(path), &mut buf)
            .await
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn chunked_write_then_rename() {
        let driver = TempDriver::new().unwrap();
        let upload = Utf8Path::new("uploads/r/n/s");
        let blob = Utf8Path::new("blobs/r/n/sha256/abc");

        driver.write_at("bucket", upload, 0, b"abc").await.unwrap();
        driver.write_at("bucket", upload, 3, b"def").await.unwrap();
        driver.write_at("bucket", upload, 1, b"B").await.unwrap();
        assert_eq!(driver.metadata("bucket", upload).await.unwrap().size, 6);

        driver.rename("bucket", upload, blob).await.unwrap();
        assert_eq!(read(&driver, "blobs/r/n/sha256/abc").await, b"aBcdef");
        assert!(driver
            .metadata("bucket", upload)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn upload_list_delete() {
        let driver = TempDriver::new().unwrap();
        driver
            .upload("bucket", Utf8Path::new("a/one"), &mut &b"1"[..])
            .await
            .unwrap();
        driver
            .upload("bucket", Utf8Path::new("a/two"), &mut &b"2"[..])
            .await
            .unwrap();

        let mut listed = driver
            .list("bucket", Some(Utf8Path::new("a")))
            .await
            .unwrap();
        listed.sort();
        assert_eq!(listed, vec!["a/one".to_string(), "a/two".to_string()]);

        driver
            .delete("bucket", Utf8Path::new("a/one"))
            .await
            .unwrap();
        let err = driver
            .delete("bucket", Utf8Path::new("a/one"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn paths_cannot_leave_the_bucket() {
        let driver = TempDriver::new().unwrap();
        driver
            .upload("bucket", Utf8Path::new("blobs/keep"), &mut &b"kept"[..])
            .await
            .unwrap();
        driver
            .upload("other", Utf8Path::new("file"), &mut &b"other"[..])
            .await
            .unwrap();

        for remote in ["uploads/../blobs/keep", "../../other/b/file", "/etc/hostname"] {
            let remote = Utf8Path::new(remote);
            let err = driver.delete("bucket", remote).await.unwrap_err();
            assert_eq!(err.kind(), StorageErrorKind::InvalidRequest, "{remote}");
            let err = driver.write_at("bucket", remote, 0, b"x").await.unwrap_err();
            assert_eq!(err.kind(), StorageErrorKind::InvalidRequest, "{remote}");
        }
        let err = driver
            .delete("../other", Utf8Path::new("b/file"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidRequest);
        assert!(driver
            .list("bucket", Some(Utf8Path::new("..")))
            .await
            .is_err());

        assert_eq!(read(&driver, "blobs/keep").await, b"kept");
        let mut buf = Vec::new();
        driver
            .download("other", Utf8Path::new("file"), &mut buf)
            .await
            .unwrap();
        assert_eq!(buf, b"other");
    }
}
