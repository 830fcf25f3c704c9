//! Manifest operations for the registry

use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderName, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use serde::Deserialize;

use crate::api::{CONTENT_DIGEST, RepositoryPath, ensure_writable};
use crate::error::{RegistryError, RegistryResult};
use crate::names::{Reference, RepositoryName};
use crate::service::{ManifestContent, RegistryService};

/// Router for manifest operations
pub fn router() -> Router<RegistryService> {
    Router::new()
        .route(
            "/v2/{name}/manifests/{reference}",
            get(get_manifest).head(head_manifest).put(put_manifest),
        )
        .route(
            "/v2/{name}/{repository}/manifests/{reference}",
            get(get_manifest).head(head_manifest).put(put_manifest),
        )
        .route("/v2/{name}/tags/list", get(list_tags))
        .route("/v2/{name}/{repository}/tags/list", get(list_tags))
}

#[derive(Debug, Deserialize)]
struct ManifestPath {
    name: String,
    repository: Option<String>,
    reference: String,
}

impl ManifestPath {
    fn parse(&self) -> RegistryResult<(RepositoryName, Reference)> {
        Ok((
            RepositoryName::from_segments(&self.name, self.repository.as_deref())?,
            self.reference.parse()?,
        ))
    }
}

fn manifest_headers(manifest: &ManifestContent) -> [(HeaderName, String); 3] {
    [
        (header::CONTENT_TYPE, manifest.media_type.clone()),
        (CONTENT_DIGEST, manifest.digest.to_string()),
        (header::CONTENT_LENGTH, manifest.size.to_string()),
    ]
}

/// Get a manifest
async fn get_manifest(
    State(service): State<RegistryService>,
    Path(path): Path<ManifestPath>,
) -> RegistryResult<Response> {
    let (name, reference) = path.parse()?;

    let mut manifest = service.manifest(&name, &reference, true).await?;
    let data = manifest.content.take().unwrap_or_default();

    Ok((StatusCode::OK, manifest_headers(&manifest), data).into_response())
}

/// Check if a manifest exists
async fn head_manifest(
    State(service): State<RegistryService>,
    Path(path): Path<ManifestPath>,
) -> RegistryResult<Response> {
    let (name, reference) = path.parse()?;

    let manifest = service.manifest(&name, &reference, false).await?;
    Ok((StatusCode::OK, manifest_headers(&manifest)).into_response())
}

/// Put a manifest
async fn put_manifest(
    State(service): State<RegistryService>,
    Path(path): Path<ManifestPath>,
    headers: HeaderMap,
    body: Bytes,
) -> RegistryResult<Response> {
    ensure_writable(&service)?;
    let (name, reference) = path.parse()?;

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| RegistryError::InvalidManifest("missing Content-Type".to_string()))?;

    let digest = service
        .put_manifest(&name, &reference, content_type, body)
        .await?;

    let location = format!("/v2/{name}/manifests/{digest}");

    Ok((
        StatusCode::CREATED,
        [
            (header::LOCATION, location),
            (CONTENT_DIGEST, digest.to_string()),
            (header::CONTENT_LENGTH, "0".to_string()),
        ],
    )
        .into_response())
}

/// List tags for a repository
async fn list_tags(
    State(service): State<RegistryService>,
    Path(path): Path<RepositoryPath>,
) -> RegistryResult<Json<TagList>> {
    let name = path.repository_name()?;

    let tags = service.tags(&name).await?;

    Ok(Json(TagList {
        name: name.to_string(),
        tags,
    }))
}

/// Tag list response
#[derive(Debug, serde::Serialize)]
struct TagList {
    name: String,
    tags: Vec<String>,
}
