use std::io::SeekFrom;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::Instrument;

use storage_driver::{Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer};

/// Storage driver backed by a directory on the local filesystem.
#[derive(Debug)]
pub struct LocalDriver {
    root: Utf8PathBuf,
}

impl LocalDriver {
    /// Store files under `root`.
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    /// Directory holding a bucket's files.
    fn bucket_root(&self, bucket: &str) -> Result<Utf8PathBuf, StorageError> {
        if !confined(Utf8Path::new(bucket)) {
            return Err(self.escaped(bucket, Utf8Path::new("")));
        }
        let mut path = self.root.join(bucket);
        path.push("b");
        Ok(path)
    }

    /// Filesystem path for a file, refusing any path that would leave the bucket.
    fn path(&self, bucket: &str, remote: &Utf8Path) -> Result<Utf8PathBuf, StorageError> {
        let mut path = self.bucket_root(bucket)?;
        if !confined(remote) {
            return Err(self.escaped(bucket, remote));
        }
        path.push(remote);
        Ok(path)
    }

    fn escaped(&self, bucket: &str, remote: &Utf8Path) -> StorageError {
        let err = std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "path must stay within the bucket",
        );
        self.error(bucket, remote, err)
    }

    fn error(&self, bucket: &str, remote: &Utf8Path, err: std::io::Error) -> StorageError {
        StorageError::builder(self.name(), err.kind().into(), err)
            .bucket(bucket)
            .path(remote.as_str())
            .build()
    }

    async fn create_parent(&self, path: &Utf8Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        "local"
    }

    fn scheme(&self) -> &str {
        "local"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let path = self.path(bucket, remote)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|err| self.error(bucket, remote, err))?;
        Ok(Metadata {
            size: metadata.len(),
            created: metadata
                .created()
                .or_else(|_| metadata.modified())
                .map_err(|err| self.error(bucket, remote, err))?
                .into(),
        })
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let path = self.path(bucket, remote)?;
        tokio::fs::remove_file(path)
            .await
            .map_err(|err| self.error(bucket, remote, err))?;
        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let path = self.path(bucket, remote)?;

        self.create_parent(&path)
            .await
            .map_err(|err| self.error(bucket, remote, err))?;

        let mut writer = tokio::io::BufWriter::new(
            tokio::fs::File::create(&path)
                .await
                .map_err(|err| self.error(bucket, remote, err))?,
        );

        tokio::io::copy(local, &mut writer)
            .await
            .map_err(|err| self.error(bucket, remote, err))?;

        writer
            .shutdown()
            .await
            .map_err(|err| self.error(bucket, remote, err))?;
        Ok(())
    }

    async fn write_at(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        offset: u64,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let path = self.path(bucket, remote)?;

        self.create_parent(&path)
            .await
            .map_err(|err| self.error(bucket, remote, err))?;

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await
            .map_err(|err| self.error(bucket, remote, err))?;

        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|err| self.error(bucket, remote, err))?;
        file.write_all(data)
            .await
            .map_err(|err| self.error(bucket, remote, err))?;
        file.flush()
            .await
            .map_err(|err| self.error(bucket, remote, err))?;
        Ok(())
    }

    async fn rename(
        &self,
        bucket: &str,
        from: &Utf8Path,
        to: &Utf8Path,
    ) -> Result<(), StorageError> {
        let source = self.path(bucket, from)?;
        let destination = self.path(bucket, to)?;

        self.create_parent(&destination)
            .await
            .map_err(|err| self.error(bucket, to, err))?;
        tokio::fs::rename(&source, &destination)
            .await
            .map_err(|err| self.error(bucket, from, err))?;
        Ok(())
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let path = self.path(bucket, remote)?;

        let mut reader = tokio::io::BufReader::new(
            tokio::fs::File::open(&path)
                .await
                .map_err(|err| self.error(bucket, remote, err))?,
        );

        tokio::io::copy(&mut reader, local)
            .await
            .map_err(|err| self.error(bucket, remote, err))?;

        local
            .flush()
            .await
            .map_err(|err| self.error(bucket, remote, err))?;

        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        let base = self.bucket_root(bucket)?;
        let target = match prefix {
            Some(part) => self.path(bucket, part)?,
            None => base.clone(),
        };

        let items = tokio::task::spawn_blocking(move || collect_list(&base, &target))
            .in_current_span()
            .await
            .map_err(StorageError::with(self.name(), StorageErrorKind::Other))?
            .map_err(|err| StorageError::io(self.name(), err))?;

        tracing::debug!("Found {} entries", items.len());
        Ok(items.into_iter().map(|p| p.to_string()).collect())
    }
}

/// Whether a relative path names only entries below its starting point.
fn confined(path: &Utf8Path) -> bool {
    path.components()
        .all(|part| matches!(part, Utf8Component::Normal(_) | Utf8Component::CurDir))
}

/// Files below `target`, as paths relative to `base`.
fn collect_list(base: &Utf8Path, target: &Utf8Path) -> std::io::Result<Vec<Utf8PathBuf>> {
    let mut files = Vec::new();
    if target.is_dir() {
        visit(target, &mut files)?;
    }

    Ok(files
        .into_iter()
        .filter_map(|p| p.strip_prefix(base).ok().map(|p| p.to_owned()))
        .collect())
}

fn visit(path: &Utf8Path, files: &mut Vec<Utf8PathBuf>) -> std::io::Result<()> {
    for entry in path.read_dir_utf8()? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            visit(entry.path(), files)?;
        } else {
            files.push(entry.path().to_owned())
        }
    }

    Ok(())
}
