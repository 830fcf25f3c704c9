//! Pull-through caching in front of an upstream registry.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use camino::Utf8Path;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;

use super::hosted::manifest_content;
use super::{BlobContent, ContentSource, ManifestContent, RegistryContext, RepositoryIds};
use crate::digest::Digest;
use crate::error::RegistryResult;
use crate::names::{Reference, RepositoryName};
use crate::storage::{ContentKey, location};
use crate::store::{BlobMeta, CacheEntry, NewManifest, StoreError};
use crate::upstream::{UpstreamClient, UpstreamManifest, seconds};

/// Whether and for how long upstream content is cached locally.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CacheConfig {
    /// Cache upstream content. When off, every read goes upstream.
    pub enabled: bool,
    /// How long a cached tag or digest is served before upstream is asked again.
    #[serde(deserialize_with = "seconds")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(3600),
        }
    }
}

/// Serves content from an upstream registry, caching it locally.
#[derive(Debug, Clone)]
pub struct ProxiedSource {
    upstream: Arc<dyn UpstreamClient>,
    cache: CacheConfig,
}

impl ProxiedSource {
    /// Proxy `upstream` with the given cache settings.
    pub fn new(upstream: Arc<dyn UpstreamClient>, cache: CacheConfig) -> Self {
        Self { upstream, cache }
    }

    /// The cache settings.
    pub fn cache(&self) -> &CacheConfig {
        &self.cache
    }

    fn expires_at(&self) -> DateTime<Utc> {
        let ttl = TimeDelta::from_std(self.cache.ttl).unwrap_or(TimeDelta::MAX);
        Utc::now()
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// A cache entry that may still be served.
    async fn fresh_entry(
        &self,
        ctx: &RegistryContext,
        name: &RepositoryName,
        identifier: &str,
    ) -> RegistryResult<Option<(RepositoryIds, CacheEntry)>> {
        let Some(ids) = ctx.find_repository(None, name).await? else {
            return Ok(None);
        };
        let Some(entry) = ctx
            .store
            .cache_entry(None, &ids.repository_id, identifier)
            .await?
        else {
            return Ok(None);
        };

        // Expired entries stay put: upstream may not have changed.
        if entry.is_expired(Utc::now()) {
            tracing::debug!(%identifier, expires_at = %entry.expires_at, "cache entry expired");
            return Ok(None);
        }
        Ok(Some((ids, entry)))
    }

    async fn forget(&self, ctx: &RegistryContext, ids: &RepositoryIds, identifier: &str) {
        match ctx
            .store
            .delete_cache_entry(None, &ids.repository_id, identifier)
            .await
        {
            Ok(()) | Err(StoreError::NotFound(_)) => {}
            Err(error) => tracing::warn!(%identifier, %error, "failed to delete cache entry"),
        }
    }

    async fn upsert_entry(
        &self,
        ctx: &RegistryContext,
        tx: Option<&str>,
        ids: &RepositoryIds,
        identifier: &str,
        digest: &str,
        expires_at: DateTime<Utc>,
    ) -> RegistryResult<()> {
        let store = &ctx.store;
        if store
            .cache_entry(tx, &ids.repository_id, identifier)
            .await?
            .is_some()
        {
            store
                .refresh_cache_entry(tx, &ids.repository_id, identifier, expires_at)
                .await?;
        } else {
            store
                .create_cache_entry(
                    tx,
                    CacheEntry {
                        registry_id: ctx.registry_id().to_owned(),
                        namespace_id: ids.namespace_id.clone(),
                        repository_id: ids.repository_id.clone(),
                        identifier: identifier.to_owned(),
                        digest: digest.to_owned(),
                        expires_at,
                    },
                )
                .await?;
        }
        Ok(())
    }

    async fn cached_blob(
        &self,
        ctx: &RegistryContext,
        name: &RepositoryName,
        digest: &Digest,
        with_content: bool,
    ) -> RegistryResult<Option<BlobContent>> {
        let Some((ids, _)) = self.fresh_entry(ctx, name, digest.as_str()).await? else {
            return Ok(None);
        };
        let Some(meta) = ctx
            .store
            .blob(None, &ids.repository_id, digest.as_str())
            .await?
        else {
            self.forget(ctx, &ids, digest.as_str()).await;
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

    async fn cache_blob(
        &self,
        ctx: &RegistryContext,
        name: &RepositoryName,
        digest: &Digest,
        content: &Bytes,
    ) -> RegistryResult<()> {
        let ids = ctx.ensure_repository(name, true, true).await?;
        let key = ctx.tx_key("blob", name, digest.as_str());
        ctx.begin(&key).await?;
        let result = self
            .store_blob(ctx, &key, &ids, name, digest, content)
            .await;
        ctx.finish(&key, result).await
    }

    async fn store_blob(
        &self,
        ctx: &RegistryContext,
        key: &str,
        ids: &RepositoryIds,
        name: &RepositoryName,
        digest: &Digest,
        content: &Bytes,
    ) -> RegistryResult<()> {
        let tx = Some(key);
        if ctx
            .store
            .blob(tx, &ids.repository_id, digest.as_str())
            .await?
            .is_none()
        {
            let path = location(ctx.registry_id(), name, ContentKey::Blob(digest));
            ctx.storage.write(&path, content).await?;
            ctx.store
                .create_blob(
                    tx,
                    BlobMeta {
                        registry_id: ctx.registry_id().to_owned(),
                        namespace_id: ids.namespace_id.clone(),
                        repository_id: ids.repository_id.clone(),
                        digest: digest.to_string(),
                        size: content.len() as u64,
                        location: path.to_string(),
                        media_type: None,
                    },
                )
                .await?;
        }

        self.upsert_entry(
            ctx,
            tx,
            ids,
            digest.as_str(),
            digest.as_str(),
            self.expires_at(),
        )
        .await
    }

    async fn cached_manifest(
        &self,
        ctx: &RegistryContext,
        name: &RepositoryName,
        identifier: &str,
        with_content: bool,
    ) -> RegistryResult<Option<ManifestContent>> {
        let Some((ids, entry)) = self.fresh_entry(ctx, name, identifier).await? else {
            return Ok(None);
        };
        let Some(manifest) = ctx
            .store
            .manifest_by_digest(None, &ids.repository_id, &entry.digest)
            .await?
        else {
            tracing::debug!(%identifier, digest = %entry.digest, "cached manifest is gone");
            self.forget(ctx, &ids, identifier).await;
            return Ok(None);
        };

        manifest_content(manifest, with_content).map(Some)
    }

    async fn cache_manifest(
        &self,
        ctx: &RegistryContext,
        name: &RepositoryName,
        reference: &Reference,
        manifest: &UpstreamManifest,
    ) -> RegistryResult<()> {
        let ids = ctx.ensure_repository(name, true, true).await?;
        let key = ctx.tx_key("manifest", name, reference.as_str());
        ctx.begin(&key).await?;
        let result = self
            .store_manifest(ctx, &key, &ids, reference, manifest)
            .await;
        ctx.finish(&key, result).await
    }

    async fn store_manifest(
        &self,
        ctx: &RegistryContext,
        key: &str,
        ids: &RepositoryIds,
        reference: &Reference,
        manifest: &UpstreamManifest,
    ) -> RegistryResult<()> {
        let tx = Some(key);
        let store = &ctx.store;
        let digest = manifest.digest.to_string();
        let expires_at = self.expires_at();

        let manifest_id = match store
            .manifest_by_digest(tx, &ids.repository_id, &digest)
            .await?
        {
            Some(existing) => existing.id,
            None => {
                // Upstream bytes are served as-is, so identity is the raw digest.
                store
                    .create_manifest(
                        tx,
                        NewManifest {
                            registry_id: ctx.registry_id().to_owned(),
                            namespace_id: ids.namespace_id.clone(),
                            repository_id: ids.repository_id.clone(),
                            digest: digest.clone(),
                            unique_digest: digest.clone(),
                            media_type: manifest.media_type.clone(),
                            content: manifest.content.clone(),
                        },
                    )
                    .await?
            }
        };

        let Reference::Tag(tag_name) = reference else {
            return self
                .upsert_entry(ctx, tx, ids, &digest, &digest, expires_at)
                .await;
        };

        let tag = ctx.tag_or_create(tx, ids, tag_name).await?;
        match store.cache_entry(tx, &ids.repository_id, tag_name).await? {
            Some(entry) if entry.digest == digest => {
                store
                    .refresh_cache_entry(tx, &ids.repository_id, tag_name, expires_at)
                    .await?;
            }
            Some(entry) => {
                tracing::debug!(
                    tag = %tag_name,
                    old = %entry.digest,
                    new = %digest,
                    "upstream tag moved"
                );
                store
                    .delete_cache_entry(tx, &ids.repository_id, tag_name)
                    .await?;
                if store
                    .cache_entry(tx, &ids.repository_id, &entry.digest)
                    .await?
                    .is_some()
                {
                    store
                        .delete_cache_entry(tx, &ids.repository_id, &entry.digest)
                        .await?;
                }
                self.upsert_entry(ctx, tx, ids, tag_name, &digest, expires_at)
                    .await?;
            }
            None => {
                self.upsert_entry(ctx, tx, ids, tag_name, &digest, expires_at)
                    .await?;
            }
        }

        if tag.manifest_id.as_deref() != Some(manifest_id.as_str()) {
            store.link_manifest(tx, &tag.id, &manifest_id).await?;
        }

        self.upsert_entry(ctx, tx, ids, &digest, &digest, expires_at)
            .await
    }

    async fn uncached_manifest(
        &self,
        name: &RepositoryName,
        reference: &Reference,
        with_content: bool,
    ) -> RegistryResult<Option<ManifestContent>> {
        if !with_content {
            if let Some(head) = self
                .upstream
                .head_manifest(name, reference.as_str())
                .await?
            {
                if let Some(digest) = head.digest {
                    return Ok(Some(ManifestContent {
                        digest,
                        media_type: head.media_type,
                        size: head.size,
                        content: None,
                    }));
                }
            } else {
                return Ok(None);
            }
        }

        Ok(self
            .upstream
            .get_manifest(name, reference.as_str())
            .await?
            .map(|manifest| upstream_content(manifest, with_content)))
    }
}

fn upstream_content(manifest: UpstreamManifest, with_content: bool) -> ManifestContent {
    ManifestContent {
        digest: manifest.digest,
        media_type: manifest.media_type,
        size: manifest.content.len() as u64,
        content: with_content.then_some(manifest.content),
    }
}

#[async_trait::async_trait]
impl ContentSource for ProxiedSource {
    async fn blob(
        &self,
        ctx: &RegistryContext,
        name: &RepositoryName,
        digest: &Digest,
        with_content: bool,
    ) -> RegistryResult<Option<BlobContent>> {
        if !self.cache.enabled {
            if with_content {
                return Ok(self
                    .upstream
                    .get_blob(name, digest)
                    .await?
                    .map(|content| BlobContent {
                        digest: digest.clone(),
                        size: content.len() as u64,
                        content: Some(content),
                    }));
            }
            return Ok(self
                .upstream
                .head_blob(name, digest)
                .await?
                .map(|head| BlobContent {
                    digest: digest.clone(),
                    size: head.size,
                    content: None,
                }));
        }

        if let Some(hit) = self.cached_blob(ctx, name, digest, with_content).await? {
            tracing::debug!("blob cache hit");
            return Ok(Some(hit));
        }
        tracing::debug!("blob cache miss");

        let Some(content) = self.upstream.get_blob(name, digest).await? else {
            return Ok(None);
        };

        let actual = Digest::sha256(&content);
        if actual != *digest {
            tracing::warn!(%actual, "upstream blob does not match its digest, not caching");
        } else if let Err(error) = self.cache_blob(ctx, name, digest, &content).await {
            tracing::warn!(%error, "serving blob without caching it");
        }

        Ok(Some(BlobContent {
            digest: digest.clone(),
            size: content.len() as u64,
            content: with_content.then_some(content),
        }))
    }

    async fn manifest(
        &self,
        ctx: &RegistryContext,
        name: &RepositoryName,
        reference: &Reference,
        with_content: bool,
    ) -> RegistryResult<Option<ManifestContent>> {
        if !self.cache.enabled {
            return self.uncached_manifest(name, reference, with_content).await;
        }

        let identifier = reference.as_str();
        if let Some(hit) = self
            .cached_manifest(ctx, name, identifier, with_content)
            .await?
        {
            tracing::debug!("manifest cache hit");
            return Ok(Some(hit));
        }
        tracing::debug!("manifest cache miss");

        let Some(manifest) = self.upstream.get_manifest(name, identifier).await? else {
            return Ok(None);
        };

        match reference {
            Reference::Digest(expected) if *expected != manifest.digest => {
                tracing::warn!(
                    actual = %manifest.digest,
                    "upstream manifest does not match its digest, not caching"
                );
            }
            _ => {
                if let Err(error) = self.cache_manifest(ctx, name, reference, &manifest).await {
                    tracing::warn!(%error, "serving manifest without caching it");
                }
            }
        }

        Ok(Some(upstream_content(manifest, with_content)))
    }
}
