//! Content pushed directly to this registry.

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use uuid::Uuid;

use super::{
    BlobContent, ContentSource, ManifestContent, RegistryContext, RepositoryIds, is_conflict,
};
use crate::digest::{Digest, ManifestDocument, MediaType};
use crate::error::{RegistryError, RegistryResult};
use crate::names::{ContentRange, Reference, RepositoryName, validate_session};
use crate::storage::{ContentKey, location, upload_root};
use crate::store::{BlobMeta, Manifest, NewManifest, StoreError, Tag, UploadSession};

/// Attempts at a manifest push that loses a unique-constraint race.
const MANIFEST_ATTEMPTS: usize = 3;

/// Serves and accepts pushed content.
#[derive(Debug, Clone)]
pub struct HostedSource {
    create_namespace_on_push: bool,
    create_repository_on_push: bool,
}

impl Default for HostedSource {
    fn default() -> Self {
        Self::new(true, true)
    }
}

impl HostedSource {
    /// Whether a push may create missing namespaces and repositories.
    pub fn new(create_namespace_on_push: bool, create_repository_on_push: bool) -> Self {
        Self {
            create_namespace_on_push,
            create_repository_on_push,
        }
    }

    async fn ensure_repository(
        &self,
        ctx: &RegistryContext,
        name: &RepositoryName,
    ) -> RegistryResult<RepositoryIds> {
        ctx.ensure_repository(
            name,
            self.create_namespace_on_push,
            self.create_repository_on_push,
        )
        .await
    }

    pub(crate) async fn initiate_upload(
        &self,
        ctx: &RegistryContext,
        name: &RepositoryName,
    ) -> RegistryResult<String> {
        self.ensure_repository(ctx, name).await?;

        let session = Uuid::new_v4().to_string();
        let key = ctx.tx_key("upload", name, &session);
        ctx.begin(&key).await?;
        let result = ctx
            .store
            .create_upload(
                Some(&key),
                UploadSession {
                    id: session.clone(),
                    registry_id: ctx.registry_id().to_owned(),
                    namespace: name.namespace().to_owned(),
                    repository: name.repository().to_owned(),
                    is_chunked: false,
                    bytes_received: 0,
                    last_updated: Utc::now(),
                },
            )
            .await
            .map_err(RegistryError::from);
        ctx.finish(&key, result).await?;

        tracing::debug!(%session, "upload started");
        Ok(session)
    }

    async fn session(
        &self,
        ctx: &RegistryContext,
        tx: Option<&str>,
        name: &RepositoryName,
        session: &str,
    ) -> RegistryResult<UploadSession> {
        ctx.store
            .upload(tx, session)
            .await?
            .filter(|upload| {
                upload.registry_id == ctx.registry_id()
                    && upload.namespace == name.namespace()
                    && upload.repository == name.repository()
            })
            .ok_or_else(|| RegistryError::BlobUploadUnknown(session.to_owned()))
    }

    pub(crate) async fn upload_chunk(
        &self,
        ctx: &RegistryContext,
        name: &RepositoryName,
        session: &str,
        range: Option<ContentRange>,
        payload: &[u8],
    ) -> RegistryResult<ContentRange> {
        validate_session(session)?;
        let key = ctx.tx_key("upload", name, session);
        ctx.begin(&key).await?;
        let result = self
            .write_chunk(ctx, &key, name, session, range, payload)
            .await;
        ctx.finish(&key, result).await
    }

    async fn write_chunk(
        &self,
        ctx: &RegistryContext,
        key: &str,
        name: &RepositoryName,
        session: &str,
        range: Option<ContentRange>,
        payload: &[u8],
    ) -> RegistryResult<ContentRange> {
        let upload = self.session(ctx, Some(key), name, session).await?;

        let range = match range {
            Some(range) => {
                range.check_payload(payload.len())?;
                range
            }
            None if upload.is_chunked => {
                return Err(RegistryError::InvalidRange(
                    "Content-Range is required after the first chunk".into(),
                ));
            }
            None => ContentRange {
                start: upload.bytes_received,
                end: upload.bytes_received + payload.len() as u64,
            },
        };

        if !payload.is_empty() {
            let temp = location(ctx.registry_id(), name, ContentKey::Upload(session));
            ctx.storage.write_at(&temp, range.start, payload).await?;
        }

        let received = upload.bytes_received.max(range.end);
        ctx.store
            .update_upload(Some(key), session, true, received)
            .await?;

        tracing::trace!(%range, received, "chunk written");
        Ok(range)
    }

    pub(crate) async fn finalize_upload(
        &self,
        ctx: &RegistryContext,
        name: &RepositoryName,
        session: &str,
        digest: &Digest,
        payload: &[u8],
    ) -> RegistryResult<Digest> {
        validate_session(session)?;
        // Nothing is cleaned up for a session this repository never started.
        self.session(ctx, None, name, session).await?;

        let key = ctx.tx_key("upload", name, session);
        ctx.begin(&key).await?;

        let mut written = None;
        let result = self
            .complete(ctx, &key, name, session, digest, payload, &mut written)
            .await;
        let mut result = ctx.finish(&key, result).await;

        // Another upload of the same content committed first.
        if let Err(error) = &result {
            if is_conflict(error) && self.blob_recorded(ctx, name, digest).await {
                tracing::debug!(%error, "blob recorded by a concurrent upload");
                result = Ok(digest.clone());
            }
        }

        // The session and its temp file go away whether or not finalizing worked.
        match ctx.store.delete_upload(None, session).await {
            Ok(()) | Err(StoreError::NotFound(_)) => {}
            Err(error) => tracing::warn!(%error, "failed to delete upload session"),
        }
        let temp = location(ctx.registry_id(), name, ContentKey::Upload(session));
        ctx.storage.discard(&temp).await;

        if let (Err(error), Some(path)) = (&result, written) {
            if !self.blob_recorded(ctx, name, digest).await {
                tracing::debug!(%error, %path, "removing unconfirmed blob");
                ctx.storage.discard(&path).await;
            }
        }

        if result.is_ok() {
            tracing::debug!("upload finalized");
        }
        result
    }

    async fn blob_recorded(
        &self,
        ctx: &RegistryContext,
        name: &RepositoryName,
        digest: &Digest,
    ) -> bool {
        let Ok(Some(ids)) = ctx.find_repository(None, name).await else {
            return false;
        };
        matches!(
            ctx.store.blob(None, &ids.repository_id, digest.as_str()).await,
            Ok(Some(_))
        )
    }

    #[allow(clippy::too_many_arguments)]
    async fn complete(
        &self,
        ctx: &RegistryContext,
        key: &str,
        name: &RepositoryName,
        session: &str,
        digest: &Digest,
        payload: &[u8],
        written: &mut Option<Utf8PathBuf>,
    ) -> RegistryResult<Digest> {
        let upload = self.session(ctx, Some(key), name, session).await?;
        let ids = ctx
            .find_repository(Some(key), name)
            .await?
            .ok_or_else(|| RegistryError::NameUnknown(name.to_string()))?;

        let existing = ctx
            .store
            .blob(Some(key), &ids.repository_id, digest.as_str())
            .await?;
        let target = location(ctx.registry_id(), name, ContentKey::Blob(digest));

        let size = if !upload.is_chunked {
            let actual = Digest::sha256(payload);
            if actual != *digest {
                return Err(RegistryError::DigestMismatch {
                    expected: digest.to_string(),
                    actual: actual.to_string(),
                });
            }
            if existing.is_some() {
                return Ok(digest.clone());
            }

            *written = Some(target.clone());
            ctx.storage.write(&target, payload).await?;
            payload.len() as u64
        } else {
            let temp = location(ctx.registry_id(), name, ContentKey::Upload(session));
            let mut received = upload.bytes_received;
            if !payload.is_empty() {
                ctx.storage.write_at(&temp, received, payload).await?;
                received += payload.len() as u64;
            }

            let size = ctx.storage.size(&temp).await?;
            if size != received {
                tracing::warn!(size, received, "upload size does not match received bytes");
                return Err(RegistryError::BlobUploadInvalid(format!(
                    "uploaded {size} bytes but {received} were declared"
                )));
            }

            let actual = Digest::sha256(&ctx.storage.read(&temp).await?);
            if actual != *digest {
                return Err(RegistryError::DigestMismatch {
                    expected: digest.to_string(),
                    actual: actual.to_string(),
                });
            }
            if existing.is_some() {
                return Ok(digest.clone());
            }

            *written = Some(target.clone());
            ctx.storage.rename(&temp, &target).await?;
            size
        };

        ctx.store
            .create_blob(
                Some(key),
                BlobMeta {
                    registry_id: ctx.registry_id().to_owned(),
                    namespace_id: ids.namespace_id,
                    repository_id: ids.repository_id,
                    digest: digest.to_string(),
                    size,
                    location: target.to_string(),
                    media_type: None,
                },
            )
            .await?;

        Ok(digest.clone())
    }

    pub(crate) async fn put_manifest(
        &self,
        ctx: &RegistryContext,
        name: &RepositoryName,
        reference: &Reference,
        media_type: &str,
        content: Bytes,
    ) -> RegistryResult<Digest> {
        let media_type: MediaType = media_type.parse()?;
        let document = ManifestDocument::parse(media_type, &content)?;
        let unique = document.unique_digest();
        let raw = Digest::sha256(&content);

        if let Reference::Digest(expected) = reference {
            if *expected != raw {
                return Err(RegistryError::DigestMismatch {
                    expected: expected.to_string(),
                    actual: raw.to_string(),
                });
            }
        }

        let ids = self.ensure_repository(ctx, name).await?;
        let record = NewManifest {
            registry_id: ctx.registry_id().to_owned(),
            namespace_id: ids.namespace_id.clone(),
            repository_id: ids.repository_id.clone(),
            digest: raw.to_string(),
            unique_digest: unique.to_string(),
            media_type: media_type.as_str().to_owned(),
            content,
        };

        let key = ctx.tx_key("manifest", name, reference.as_str());
        let mut attempt = 1;
        loop {
            ctx.begin(&key).await?;
            let result = match reference {
                Reference::Tag(tag) => {
                    self.tag_manifest(ctx, &key, &ids, tag, record.clone()).await
                }
                Reference::Digest(_) => {
                    self.store_untagged(ctx, &key, &ids, record.clone()).await
                }
            };
            match ctx.finish(&key, result).await {
                Err(error) if is_conflict(&error) && attempt < MANIFEST_ATTEMPTS => {
                    tracing::debug!(%error, attempt, "manifest push raced another, retrying");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Remove upload temp files that no session row accounts for.
    pub(crate) async fn sweep_uploads(&self, ctx: &RegistryContext) -> RegistryResult<usize> {
        let mut removed = 0;
        for path in ctx.storage.list(&upload_root(ctx.registry_id())).await? {
            let Some(session) = path.file_name() else {
                continue;
            };
            if ctx.store.upload(None, session).await?.is_none() {
                tracing::debug!(%path, "removing orphaned upload");
                ctx.storage.discard(&path).await;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn tag_manifest(
        &self,
        ctx: &RegistryContext,
        key: &str,
        ids: &RepositoryIds,
        tag: &str,
        record: NewManifest,
    ) -> RegistryResult<Digest> {
        let tx = Some(key);
        let store = &ctx.store;

        let existing = store
            .manifest_by_unique_digest(tx, &ids.repository_id, &record.unique_digest)
            .await?;

        let tag = ctx.tag_or_create(tx, ids, tag).await?;

        let (manifest_id, digest) = match existing {
            Some(manifest) => {
                tracing::debug!(digest = %manifest.digest, "manifest content already stored");
                (manifest.id, manifest.digest)
            }
            None => {
                let digest = record.digest.clone();
                (store.create_manifest(tx, record).await?, digest)
            }
        };

        if tag.manifest_id.as_deref() != Some(manifest_id.as_str()) {
            store.link_manifest(tx, &tag.id, &manifest_id).await?;
            tracing::debug!(tag = %tag.name, %digest, "tag linked");
        }

        digest.parse()
    }

    async fn store_untagged(
        &self,
        ctx: &RegistryContext,
        key: &str,
        ids: &RepositoryIds,
        record: NewManifest,
    ) -> RegistryResult<Digest> {
        let tx = Some(key);
        if ctx
            .store
            .manifest_by_digest(tx, &ids.repository_id, &record.digest)
            .await?
            .is_none()
        {
            let digest = record.digest.clone();
            ctx.store.create_manifest(tx, record).await?;
            return digest.parse();
        }
        record.digest.parse()
    }
}

pub(crate) fn manifest_content(
    manifest: Manifest,
    with_content: bool,
) -> RegistryResult<ManifestContent> {
    Ok(ManifestContent {
        digest: manifest.digest.parse()?,
        size: manifest.size(),
        media_type: manifest.media_type,
        content: with_content.then_some(manifest.content),
    })
}

#[async_trait::async_trait]
impl ContentSource for HostedSource {
    async fn blob(
        &self,
        ctx: &RegistryContext,
        name: &RepositoryName,
        digest: &Digest,
        with_content: bool,
    ) -> RegistryResult<Option<BlobContent>> {
        let Some(ids) = ctx.find_repository(None, name).await? else {
            return Ok(None);
        };
        let Some(meta) = ctx
            .store
            .blob(None, &ids.repository_id, digest.as_str())
            .await?
        else {
            return Ok(None);
        };

        let content = if with_content {
            Some(ctx.storage.read(Utf8Path::new(&meta.location)).await?)
        } else {
            None
        };

        Ok(Some(BlobContent {
            digest: digest.clone(),
            size: meta.size,
            content,
        }))
    }

    async fn manifest(
        &self,
        ctx: &RegistryContext,
        name: &RepositoryName,
        reference: &Reference,
        with_content: bool,
    ) -> RegistryResult<Option<ManifestContent>> {
        let Some(ids) = ctx.find_repository(None, name).await? else {
            return Ok(None);
        };

        let manifest = match reference {
            Reference::Digest(digest) => {
                ctx.store
                    .manifest_by_digest(None, &ids.repository_id, digest.as_str())
                    .await?
            }
            Reference::Tag(tag) => match ctx.store.tag(None, &ids.repository_id, tag).await? {
                Some(Tag {
                    manifest_id: Some(id),
                    ..
                }) => ctx.store.manifest(None, &id).await?,
                _ => None,
            },
        };

        manifest
            .map(|manifest| manifest_content(manifest, with_content))
            .transpose()
    }
}
