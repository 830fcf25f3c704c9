//! Blob operations for the registry

use axum::Router;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{HeaderMap, HeaderName, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use bytes::Bytes;
use serde::Deserialize;

use crate::api::{CONTENT_DIGEST, RepositoryPath, UPLOAD_UUID, ensure_writable};
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::names::{ContentRange, RepositoryName, validate_session};
use crate::service::{BlobContent, RegistryService};

/// Router for blob operations
pub fn router() -> Router<RegistryService> {
    let uploads = Router::new()
        .route("/v2/{name}/blobs/uploads/", post(start_blob_upload))
        .route(
            "/v2/{name}/{repository}/blobs/uploads/",
            post(start_blob_upload),
        )
        .route(
            "/v2/{name}/blobs/uploads/{session}",
            patch(upload_blob_chunk).put(complete_blob_upload),
        )
        .route(
            "/v2/{name}/{repository}/blobs/uploads/{session}",
            patch(upload_blob_chunk).put(complete_blob_upload),
        )
        .layer(DefaultBodyLimit::disable());

    Router::new()
        .route(
            "/v2/{name}/blobs/{digest}",
            get(get_blob).head(head_blob),
        )
        .route(
            "/v2/{name}/{repository}/blobs/{digest}",
            get(get_blob).head(head_blob),
        )
        .merge(uploads)
}

#[derive(Debug, Deserialize)]
struct BlobPath {
    name: String,
    repository: Option<String>,
    digest: String,
}

#[derive(Debug, Deserialize)]
struct UploadPath {
    name: String,
    repository: Option<String>,
    session: String,
}

impl UploadPath {
    fn parse(&self) -> RegistryResult<RepositoryName> {
        let name = RepositoryName::from_segments(&self.name, self.repository.as_deref())?;
        validate_session(&self.session)?;
        Ok(name)
    }
}

#[derive(Debug, Deserialize)]
struct DigestQuery {
    digest: Option<String>,
}

fn blob_location(name: &RepositoryName, digest: &Digest) -> String {
    format!("/v2/{name}/blobs/{digest}")
}

fn upload_location(name: &RepositoryName, session: &str) -> String {
    format!("/v2/{name}/blobs/uploads/{session}")
}

fn blob_headers(blob: &BlobContent) -> [(HeaderName, String); 3] {
    [
        (header::CONTENT_TYPE, "application/octet-stream".to_string()),
        (CONTENT_DIGEST, blob.digest.to_string()),
        (header::CONTENT_LENGTH, blob.size.to_string()),
    ]
}

/// Get a blob
async fn get_blob(
    State(service): State<RegistryService>,
    Path(path): Path<BlobPath>,
) -> RegistryResult<Response> {
    let name = RepositoryName::from_segments(&path.name, path.repository.as_deref())?;
    let digest: Digest = path.digest.parse()?;

    let mut blob = service.blob(&name, &digest, true).await?;
    let data = blob.content.take().unwrap_or_default();

    Ok((StatusCode::OK, blob_headers(&blob), data).into_response())
}

/// Check if a blob exists
async fn head_blob(
    State(service): State<RegistryService>,
    Path(path): Path<BlobPath>,
) -> RegistryResult<Response> {
    let name = RepositoryName::from_segments(&path.name, path.repository.as_deref())?;
    let digest: Digest = path.digest.parse()?;

    let blob = service.blob(&name, &digest, false).await?;
    Ok((StatusCode::OK, blob_headers(&blob)).into_response())
}

/// Start a blob upload session
async fn start_blob_upload(
    State(service): State<RegistryService>,
    Path(path): Path<RepositoryPath>,
) -> RegistryResult<Response> {
    ensure_writable(&service)?;
    let name = path.repository_name()?;

    let session = service.initiate_upload(&name).await?;

    Ok((
        StatusCode::ACCEPTED,
        [
            (header::LOCATION, upload_location(&name, &session)),
            (header::RANGE, "0-0".to_string()),
            (UPLOAD_UUID, session),
        ],
    )
        .into_response())
}

fn content_range(headers: &HeaderMap) -> RegistryResult<Option<ContentRange>> {
    let Some(value) = headers.get(header::CONTENT_RANGE) else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| RegistryError::InvalidRange("Content-Range is not ASCII".into()))?;
    value.parse().map(Some)
}

/// Upload one chunk of a blob
async fn upload_blob_chunk(
    State(service): State<RegistryService>,
    Path(path): Path<UploadPath>,
    headers: HeaderMap,
    body: Bytes,
) -> RegistryResult<Response> {
    ensure_writable(&service)?;
    let name = path.parse()?;
    let range = content_range(&headers)?;

    let range = service
        .upload_chunk(&name, &path.session, range, body)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        [
            (header::LOCATION, upload_location(&name, &path.session)),
            (header::RANGE, range.to_string()),
            (UPLOAD_UUID, path.session),
        ],
    )
        .into_response())
}

/// Complete a blob upload
async fn complete_blob_upload(
    State(service): State<RegistryService>,
    Path(path): Path<UploadPath>,
    Query(query): Query<DigestQuery>,
    body: Bytes,
) -> RegistryResult<Response> {
    ensure_writable(&service)?;
    let name = path.parse()?;

    let digest: Digest = query
        .digest
        .ok_or_else(|| RegistryError::BlobUploadInvalid("missing digest parameter".to_string()))?
        .parse()?;

    let digest = service
        .finalize_upload(&name, &path.session, &digest, body)
        .await?;

    Ok((
        StatusCode::CREATED,
        [
            (header::LOCATION, blob_location(&name, &digest)),
            (UPLOAD_UUID, path.session),
            (CONTENT_DIGEST, digest.to_string()),
            (header::CONTENT_LENGTH, "0".to_string()),
        ],
    )
        .into_response())
}
