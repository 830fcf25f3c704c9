//! Integration tests for the registry router

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode, header};
use bytes::Bytes;
use registry::digest::Digest;
use registry::names::RepositoryName;
use registry::upstream::{BlobHead, ManifestHead, UpstreamClient, UpstreamError, UpstreamManifest};
use registry::{CacheConfig, ProxiedSource, RegistryBuilder, RegistryIdentity};
use storage::MemoryStorage;
use tower::ServiceExt;

const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Helper to create a test registry
fn test_registry() -> Router {
    let storage = MemoryStorage::with_buckets(&["test-registry"]);
    RegistryBuilder::new()
        .storage(storage.into())
        .bucket("test-registry")
        .build()
}

async fn send(app: &Router, request: Request<Body>) -> Response<Body> {
    app.clone().oneshot(request).await.unwrap()
}

fn request(method: &str, uri: impl AsRef<str>) -> axum::http::request::Builder {
    Request::builder().method(method).uri(uri.as_ref())
}

async fn body(response: Response<Body>) -> Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
}

async fn error_code(response: Response<Body>) -> String {
    let value: serde_json::Value = serde_json::from_slice(&body(response).await).unwrap();
    value["errors"][0]["code"].as_str().unwrap().to_string()
}

fn header_str<'a>(response: &'a Response<Body>, name: &str) -> &'a str {
    response.headers().get(name).unwrap().to_str().unwrap()
}

fn manifest(layers: &[&str], pretty: bool) -> Vec<u8> {
    let layers: Vec<_> = layers
        .iter()
        .map(|digest| serde_json::json!({"mediaType": "layer", "size": 1, "digest": digest}))
        .collect();
    let value = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": DOCKER_MANIFEST,
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "size": 1234,
            "digest": "sha256:abc"
        },
        "layers": layers,
    });
    if pretty {
        serde_json::to_vec_pretty(&value).unwrap()
    } else {
        serde_json::to_vec(&value).unwrap()
    }
}

async fn start_upload(app: &Router, repository: &str) -> String {
    let response = send(
        app,
        request("POST", format!("/v2/{repository}/blobs/uploads/"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(header_str(&response, "range"), "0-0");
    assert!(response.headers().contains_key("docker-upload-uuid"));
    header_str(&response, "location").to_string()
}

async fn put_manifest(app: &Router, reference: &str, content: Vec<u8>) -> Response<Body> {
    send(
        app,
        request("PUT", format!("/v2/library/test-repo/manifests/{reference}"))
            .header(header::CONTENT_TYPE, DOCKER_MANIFEST)
            .body(Body::from(content))
            .unwrap(),
    )
    .await
}

#[tokio::test]
async fn test_api_version_check() {
    let app = test_registry();

    let response = send(&app, request("GET", "/v2/").body(Body::empty()).unwrap()).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        header_str(&response, "docker-distribution-api-version"),
        "registry/2.0"
    );
    let value: serde_json::Value = serde_json::from_slice(&body(response).await).unwrap();
    assert_eq!(value["Docker-Distribution-API-Version"], "registry/2.0");
}

#[tokio::test]
async fn test_blob_upload_and_download() {
    let app = test_registry();

    let data = b"Hello, OCI Registry!";
    let digest = Digest::sha256(data);

    let upload_url = start_upload(&app, "test-repo").await;
    assert!(upload_url.starts_with("/v2/library/test-repo/blobs/uploads/"));

    let response = send(
        &app,
        request("PUT", format!("{upload_url}?digest={digest}"))
            .body(Body::from(Bytes::from_static(data)))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(header_str(&response, "docker-content-digest"), digest.as_str());
    assert_eq!(
        header_str(&response, "location"),
        format!("/v2/library/test-repo/blobs/{digest}")
    );

    let response = send(
        &app,
        request("GET", format!("/v2/test-repo/blobs/{digest}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        header_str(&response, "content-type"),
        "application/octet-stream"
    );
    assert_eq!(body(response).await, Bytes::from_static(data));

    // The single-segment name lives in the default namespace.
    let response = send(
        &app,
        request("HEAD", format!("/v2/library/test-repo/blobs/{digest}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, "content-length"), data.len().to_string());
    assert_eq!(header_str(&response, "docker-content-digest"), digest.as_str());
}

#[tokio::test]
async fn test_chunked_upload() {
    let app = test_registry();
    let data: Vec<u8> = (0..100u8).collect();
    let digest = Digest::sha256(&data);

    let upload_url = start_upload(&app, "acme/widgets").await;

    let response = send(
        &app,
        request("PATCH", &upload_url)
            .header(header::CONTENT_RANGE, "0-60")
            .body(Body::from(data[..60].to_vec()))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(header_str(&response, "range"), "0-60");

    let response = send(
        &app,
        request("PATCH", &upload_url)
            .header(header::CONTENT_RANGE, "60-100")
            .body(Body::from(data[60..].to_vec()))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(header_str(&response, "range"), "60-100");

    let response = send(
        &app,
        request("PUT", format!("{upload_url}?digest={digest}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = send(
        &app,
        request("GET", format!("/v2/acme/widgets/blobs/{digest}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body(response).await, Bytes::from(data));

    // The session is gone once the upload is finalized.
    let response = send(
        &app,
        request("PATCH", &upload_url)
            .header(header::CONTENT_RANGE, "100-101")
            .body(Body::from("x"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "BLOB_UPLOAD_UNKNOWN");
}

#[tokio::test]
async fn test_short_chunk_is_rejected() {
    let app = test_registry();
    let upload_url = start_upload(&app, "test-repo").await;

    let response = send(
        &app,
        request("PATCH", &upload_url)
            .header(header::CONTENT_RANGE, "0-100")
            .body(Body::from("only a few bytes"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "RANGE_INVALID");

    let response = send(
        &app,
        request("PATCH", &upload_url)
            .header(header::CONTENT_RANGE, "bytes=0-10")
            .body(Body::from("0123456789"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_upload_requires_digest() {
    let app = test_registry();
    let upload_url = start_upload(&app, "test-repo").await;

    let response = send(
        &app,
        request("PUT", &upload_url)
            .body(Body::from("content"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "BLOB_UPLOAD_INVALID");
}

#[tokio::test]
async fn test_upload_digest_mismatch() {
    let app = test_registry();
    let upload_url = start_upload(&app, "test-repo").await;
    let wrong = Digest::sha256(b"something else");

    let response = send(
        &app,
        request("PUT", format!("{upload_url}?digest={wrong}"))
            .body(Body::from("content"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "DIGEST_INVALID");
}

#[tokio::test]
async fn test_manifest_upload_and_download() {
    let app = test_registry();
    let manifest_bytes = manifest(&["sha256:d1", "sha256:d2"], false);

    let response = put_manifest(&app, "latest", manifest_bytes.clone()).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let digest = header_str(&response, "docker-content-digest").to_string();
    assert_eq!(digest, Digest::sha256(&manifest_bytes).to_string());
    assert_eq!(
        header_str(&response, "location"),
        format!("/v2/library/test-repo/manifests/{digest}")
    );

    for reference in ["latest", digest.as_str()] {
        let response = send(
            &app,
            request("GET", format!("/v2/test-repo/manifests/{reference}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_str(&response, "content-type"), DOCKER_MANIFEST);
        assert_eq!(header_str(&response, "docker-content-digest"), digest);
        assert_eq!(&body(response).await[..], &manifest_bytes[..]);
    }

    let response = send(
        &app,
        request("HEAD", "/v2/test-repo/manifests/latest")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        header_str(&response, "content-length"),
        manifest_bytes.len().to_string()
    );
}

#[tokio::test]
async fn test_reformatted_manifest_keeps_original_digest() {
    let app = test_registry();
    let compact = manifest(&["sha256:d1", "sha256:d2"], false);
    let pretty = manifest(&["sha256:d1", "sha256:d2"], true);

    let response = put_manifest(&app, "v1", compact.clone()).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let original = header_str(&response, "docker-content-digest").to_string();

    let response = put_manifest(&app, "v1", pretty).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(header_str(&response, "docker-content-digest"), original);

    let response = send(
        &app,
        request("GET", "/v2/library/test-repo/manifests/v1")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(&body(response).await[..], &compact[..]);
}

#[tokio::test]
async fn test_manifest_put_validation() {
    let app = test_registry();

    let response = send(
        &app,
        request("PUT", "/v2/test-repo/manifests/v1")
            .body(Body::from(manifest(&[], false)))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "MANIFEST_INVALID");

    let response = send(
        &app,
        request("PUT", "/v2/test-repo/manifests/v1")
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from(manifest(&[], false)))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = put_manifest(&app, ".bad", manifest(&[], false)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "TAG_INVALID");
}

#[tokio::test]
async fn test_list_tags() {
    let app = test_registry();
    let manifest_bytes = manifest(&[], false);

    for tag in ["v1.0", "v1.1", "latest"] {
        let response = put_manifest(&app, tag, manifest_bytes.clone()).await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let response = send(
        &app,
        request("GET", "/v2/test-repo/tags/list")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let tag_list: serde_json::Value = serde_json::from_slice(&body(response).await).unwrap();
    assert_eq!(tag_list["name"], "library/test-repo");
    assert_eq!(tag_list["tags"], serde_json::json!(["latest", "v1.0", "v1.1"]));
}

#[tokio::test]
async fn test_not_found() {
    let app = test_registry();
    let digest = Digest::sha256(b"missing");

    let response = send(
        &app,
        request("GET", format!("/v2/test-repo/blobs/{digest}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "BLOB_UNKNOWN");

    let response = send(
        &app,
        request("GET", "/v2/test-repo/manifests/nonexistent")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "MANIFEST_UNKNOWN");

    let response = send(
        &app,
        request("GET", "/v2/test-repo/tags/list")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "NAME_UNKNOWN");
}

#[tokio::test]
async fn test_invalid_names() {
    let app = test_registry();

    let response = send(
        &app,
        request("GET", "/v2/test-repo/blobs/invalid-digest")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "DIGEST_INVALID");

    let response = send(
        &app,
        request("POST", "/v2/bad.name/blobs/uploads/")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "NAME_INVALID");
}

#[derive(Debug, Default)]
struct StaticUpstream {
    manifest: Vec<u8>,
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl UpstreamClient for StaticUpstream {
    async fn get_manifest(
        &self,
        _: &RepositoryName,
        reference: &str,
    ) -> Result<Option<UpstreamManifest>, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok((reference == "latest").then(|| UpstreamManifest {
            digest: Digest::sha256(&self.manifest),
            media_type: DOCKER_MANIFEST.to_string(),
            content: Bytes::from(self.manifest.clone()),
        }))
    }

    async fn head_manifest(
        &self,
        _: &RepositoryName,
        _: &str,
    ) -> Result<Option<ManifestHead>, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }

    async fn get_blob(
        &self,
        _: &RepositoryName,
        _: &Digest,
    ) -> Result<Option<Bytes>, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }

    async fn head_blob(
        &self,
        _: &RepositoryName,
        _: &Digest,
    ) -> Result<Option<BlobHead>, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }
}

fn proxy(upstream: Arc<StaticUpstream>) -> Router {
    RegistryBuilder::new()
        .identity(RegistryIdentity {
            id: "2".into(),
            name: "docker-hub".into(),
        })
        .proxied(ProxiedSource::new(upstream, CacheConfig::default()))
        .build()
}

#[tokio::test]
async fn test_proxy_serves_and_caches() {
    let upstream = Arc::new(StaticUpstream {
        manifest: manifest(&["sha256:d1"], false),
        ..Default::default()
    });
    let app = proxy(upstream.clone());

    for _ in 0..2 {
        let response = send(
            &app,
            request("GET", "/v2/library/alpine/manifests/latest")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(&body(response).await[..], &upstream.manifest[..]);
    }
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);

    let response = send(
        &app,
        request("GET", "/v2/alpine/manifests/missing")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_proxy_rejects_writes() {
    let upstream = Arc::new(StaticUpstream::default());
    let app = proxy(upstream.clone());

    let response = send(
        &app,
        request("POST", "/v2/alpine/blobs/uploads/")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(error_code(response).await, "UNSUPPORTED");

    // Rejected before the bad name or missing content type is looked at.
    let response = send(
        &app,
        request("PUT", "/v2/bad.name/manifests/v1")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    let response = send(
        &app,
        request("PATCH", "/v2/alpine/blobs/uploads/session")
            .header(header::CONTENT_RANGE, "nonsense")
            .body(Body::from("x"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_chunked_upload_on_disk() {
    let storage = storage::TempDriver::new().unwrap();
    let app = RegistryBuilder::new()
        .storage(storage.into())
        .bucket("registry")
        .build();
    let digest = Digest::sha256(b"hello world");

    let upload_url = start_upload(&app, "test-repo").await;
    let response = send(
        &app,
        request("PATCH", &upload_url)
            .body(Body::from("hello "))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(header_str(&response, "range"), "0-6");

    let response = send(
        &app,
        request("PUT", format!("{upload_url}?digest={digest}"))
            .body(Body::from("world"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = send(
        &app,
        request("GET", format!("/v2/test-repo/blobs/{digest}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(body(response).await, Bytes::from_static(b"hello world"));
}

#[tokio::test]
async fn test_upload_session_cannot_escape_uploads() {
    let storage = storage::TempDriver::new().unwrap();
    let app = RegistryBuilder::new()
        .storage(storage.into())
        .bucket("registry")
        .build();
    let data = b"committed layer";
    let digest = Digest::sha256(data);

    let upload_url = start_upload(&app, "test-repo").await;
    let response = send(
        &app,
        request("PUT", format!("{upload_url}?digest={digest}"))
            .body(Body::from(Bytes::from_static(data)))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let session = format!(
        "..%2F..%2F..%2F..%2Fblobs%2F1%2Flibrary%2Ftest-repo%2Fsha256%2F{}",
        digest.encoded()
    );
    for method in ["PATCH", "PUT"] {
        let response = send(
            &app,
            request(
                method,
                format!("/v2/test-repo/blobs/uploads/{session}?digest={digest}"),
            )
            .body(Body::empty())
            .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{method}");
        assert_eq!(error_code(response).await, "BLOB_UPLOAD_UNKNOWN");
    }

    let response = send(
        &app,
        request("GET", format!("/v2/test-repo/blobs/{digest}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body(response).await, Bytes::from_static(data));
}
