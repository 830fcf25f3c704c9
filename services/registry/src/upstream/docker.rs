//! Docker Registry V2 client with bearer tokens and retries.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use http_body_util::BodyExt as _;
use hyperdriver::Body;
use hyperdriver::client::SharedClientService;
use hyperdriver::service::SharedService;
use serde::{Deserialize, Deserializer};
use tokio::time::Instant;
use tower::ServiceExt as _;
use tower::retry::{Policy, Retry};

use super::credential::basic_auth;
use super::{BlobHead, Credential, ManifestHead, UpstreamClient, UpstreamError, UpstreamManifest};
use crate::digest::{Digest, MediaType};
use crate::names::RepositoryName;

type Request = http::Request<Body>;
type Response = http::Response<Body>;

/// Docker Hub's registry endpoint.
pub const DEFAULT_REGISTRY_URL: &str = "https://registry-1.docker.io";

/// Docker Hub's token endpoint.
pub const DEFAULT_TOKEN_URL: &str = "https://auth.docker.io/token";

/// Docker Hub's token service name.
pub const DEFAULT_TOKEN_SERVICE: &str = "registry.docker.io";

const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(60);
const MAX_REDIRECTS: usize = 5;

pub(crate) fn seconds<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}

/// Timeouts and retry behavior for upstream requests.
///
/// Durations are written in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct NetworkConfig {
    /// TCP connect timeout.
    #[serde(deserialize_with = "seconds")]
    pub connect_timeout: Duration,
    /// Timeout for a single request.
    #[serde(deserialize_with = "seconds")]
    pub request_timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: usize,
    /// Delay before the first retry.
    #[serde(deserialize_with = "seconds")]
    pub retry_delay: Duration,
    /// Upper bound on any single retry delay.
    #[serde(deserialize_with = "seconds")]
    pub max_retry_delay: Duration,
    /// Factor applied to the delay after each retry.
    pub backoff_multiplier: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            max_retry_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

/// Where and how to reach an upstream registry.
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Registry base URL.
    pub url: String,
    /// Token endpoint. Requests are anonymous without one.
    pub token_url: Option<String>,
    /// `service` parameter sent to the token endpoint.
    pub service: String,
    /// Username for the token endpoint.
    pub username: Option<String>,
    /// Password for the token endpoint.
    pub password: Option<Credential>,
    /// Timeouts and retries.
    pub network: NetworkConfig,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_REGISTRY_URL.into(),
            token_url: Some(DEFAULT_TOKEN_URL.into()),
            service: DEFAULT_TOKEN_SERVICE.into(),
            username: None,
            password: None,
            network: NetworkConfig::default(),
        }
    }
}

/// Multiplicative backoff with a cap on the delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// The delay before the next retry.
    pub delay: Duration,

    /// Factor applied to the delay after each retry.
    pub multiplier: f64,

    /// The maximum delay.
    pub max_delay: Duration,
}

impl Backoff {
    /// Create a new backoff policy.
    pub fn new(delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            delay,
            multiplier,
            max_delay,
        }
    }

    /// The policy for the retry after this one.
    pub fn increment(&self) -> Self {
        let delay = Duration::try_from_secs_f64(self.delay.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        Self {
            delay,
            multiplier: self.multiplier,
            max_delay: self.max_delay,
        }
    }
}

/// Retries transport errors and server errors a fixed number of times.
#[derive(Debug, Clone)]
struct RetryPolicy {
    backoff: Backoff,
    remaining: usize,
}

impl RetryPolicy {
    fn new(network: &NetworkConfig) -> Self {
        Self {
            backoff: Backoff::new(
                network.retry_delay.min(network.max_retry_delay),
                network.backoff_multiplier,
                network.max_retry_delay,
            ),
            remaining: network.max_retries,
        }
    }
}

impl<E> Policy<Request, Response, E> for RetryPolicy {
    type Future = tokio::time::Sleep;

    fn retry(
        &mut self,
        req: &mut Request,
        result: &mut Result<Response, E>,
    ) -> Option<Self::Future> {
        let reason = match result {
            Ok(res) if res.status().is_server_error() => "server error",
            Ok(_) => return None,
            Err(_) => "transport error",
        };
        if self.remaining == 0 {
            return None;
        }

        self.remaining -= 1;
        let delay = self.backoff.delay;
        self.backoff = self.backoff.increment();
        tracing::debug!(
            uri = %req.uri(),
            ?delay,
            remaining = self.remaining,
            "retrying upstream request after {reason}"
        );
        Some(tokio::time::sleep(delay))
    }

    fn clone_request(&mut self, req: &Request) -> Option<Request> {
        let body = req.body().try_clone()?;

        let mut next = http::Request::builder()
            .method(req.method().clone())
            .uri(req.uri().clone())
            .version(req.version())
            .body(body)
            .ok()?;

        *next.extensions_mut() = req.extensions().clone();
        *next.headers_mut() = req.headers().clone();

        Some(next)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: String,
    #[serde(default)]
    access_token: String,
    expires_in: Option<u64>,
}

struct CachedToken {
    token: Credential,
    expires_at: Instant,
}

/// [`UpstreamClient`] for registries speaking the Docker Registry V2 API.
#[derive(Clone)]
pub struct DockerClient {
    config: Arc<DockerConfig>,
    base: Arc<str>,
    service: SharedClientService<Body, Body>,
    tokens: Arc<DashMap<String, CachedToken>>,
}

impl std::fmt::Debug for DockerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerClient")
            .field("base", &self.base)
            .field("config", &self.config)
            .field("tokens", &self.tokens.len())
            .finish()
    }
}

impl DockerClient {
    /// Connect over TCP with TLS using the configured timeouts.
    pub fn new(config: DockerConfig) -> Result<Self, UpstreamError> {
        let mut builder = hyperdriver::Client::build_tcp_http();
        builder.transport().config_mut().connect_timeout = Some(config.network.connect_timeout);

        let service = builder
            .with_default_tls()
            .with_timeout(config.network.request_timeout)
            .build_service();

        Self::with_service(config, service)
    }

    /// Send requests through `service` instead of the network.
    pub fn with_service<S>(config: DockerConfig, service: S) -> Result<Self, UpstreamError>
    where
        S: tower::Service<Request, Response = Response, Error = hyperdriver::client::Error>
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        config.url.parse::<Uri>()?;
        if let Some(token_url) = &config.token_url {
            token_url.parse::<Uri>()?;
        }

        let service = tower::ServiceBuilder::new()
            .layer(SharedService::layer())
            .service(service);

        Ok(Self {
            base: config.url.trim_end_matches('/').into(),
            config: Arc::new(config),
            service,
            tokens: Default::default(),
        })
    }

    async fn send(&self, request: Request) -> Result<Response, UpstreamError> {
        let url = request.uri().to_string();
        let retry = Retry::new(RetryPolicy::new(&self.config.network), self.service.clone());
        let response = retry.oneshot(request).await.map_err(UpstreamError::Request)?;

        let status = response.status();
        if status.is_server_error() {
            return Err(UpstreamError::RetriesExhausted {
                status,
                url,
                attempts: self.config.network.max_retries + 1,
            });
        }
        Ok(response)
    }

    async fn authorization(
        &self,
        name: &RepositoryName,
    ) -> Result<Option<HeaderValue>, UpstreamError> {
        let Some(token_url) = &self.config.token_url else {
            return Ok(None);
        };

        let scope = format!("repository:{}/{}:pull", name.namespace(), name.repository());
        if let Some(cached) = self.tokens.get(&scope) {
            if cached.expires_at > Instant::now() {
                return cached.token.bearer().map(Some).map_err(|_| UpstreamError::Token);
            }
        }

        let url = format!("{token_url}?service={}&scope={scope}", self.config.service);
        let mut builder = http::Request::builder().method(Method::GET).uri(url.as_str());
        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            builder = builder.header(AUTHORIZATION, basic_auth(username, password));
        }

        let response = self.send(builder.body(Body::empty())?).await?;
        if !response.status().is_success() {
            return Err(UpstreamError::Status {
                status: response.status(),
                url,
            });
        }

        let body: TokenResponse = serde_json::from_slice(&read_body(response).await?)?;
        let token = if body.token.is_empty() {
            body.access_token
        } else {
            body.token
        };
        if token.is_empty() {
            return Err(UpstreamError::Token);
        }

        let token = Credential::new(token);
        let header = token.bearer().map_err(|_| UpstreamError::Token)?;
        let lifetime = body
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME);

        tracing::debug!(%scope, ?lifetime, "fetched upstream token");
        self.tokens.insert(
            scope,
            CachedToken {
                token,
                expires_at: Instant::now() + lifetime,
            },
        );
        Ok(Some(header))
    }

    /// Request `/v2/{namespace}/{repository}/{path}`, following redirects.
    ///
    /// A 404 is `Ok(None)`.
    async fn fetch(
        &self,
        method: Method,
        name: &RepositoryName,
        path: &str,
        accept: Option<&str>,
    ) -> Result<Option<Response>, UpstreamError> {
        let mut url = format!(
            "{}/v2/{}/{}/{path}",
            self.base,
            name.namespace(),
            name.repository()
        );

        let mut builder = http::Request::builder().method(method.clone()).uri(url.as_str());
        if let Some(accept) = accept {
            builder = builder.header(ACCEPT, accept);
        }
        if let Some(authorization) = self.authorization(name).await? {
            builder = builder.header(AUTHORIZATION, authorization);
        }
        let mut response = self.send(builder.body(Body::empty())?).await?;

        // Blob storage is often behind a redirect to a CDN, which gets no credentials.
        for _ in 0..MAX_REDIRECTS {
            if !response.status().is_redirection() {
                break;
            }
            let Some(location) = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
            else {
                break;
            };

            url = location.to_owned();
            tracing::trace!(%url, "following upstream redirect");
            let request = http::Request::builder()
                .method(method.clone())
                .uri(url.as_str())
                .body(Body::empty())?;
            response = self.send(request).await?;
        }

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response)),
            status => Err(UpstreamError::Status { status, url }),
        }
    }
}

async fn read_body(response: Response) -> Result<Bytes, UpstreamError> {
    let collected = response
        .into_body()
        .collect()
        .await
        .map_err(|err| UpstreamError::Body(err.into()))?;
    Ok(collected.to_bytes())
}

fn content_length(headers: &HeaderMap) -> u64 {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn content_type(headers: &HeaderMap) -> Option<String> {
    header_str(headers, CONTENT_TYPE.as_str()).map(|value| {
        value
            .split(';')
            .next()
            .unwrap_or(value)
            .trim()
            .to_owned()
    })
}

fn content_digest(headers: &HeaderMap) -> Option<Digest> {
    header_str(headers, "docker-content-digest").and_then(|value| value.parse().ok())
}

#[derive(Deserialize)]
struct MediaTypeField {
    #[serde(rename = "mediaType")]
    media_type: Option<String>,
}

#[async_trait::async_trait]
impl UpstreamClient for DockerClient {
    #[tracing::instrument(skip(self), fields(upstream = %self.base))]
    async fn get_manifest(
        &self,
        name: &RepositoryName,
        reference: &str,
    ) -> Result<Option<UpstreamManifest>, UpstreamError> {
        let accept = MediaType::accept_header();
        let Some(response) = self
            .fetch(Method::GET, name, &format!("manifests/{reference}"), Some(accept.as_str()))
            .await?
        else {
            return Ok(None);
        };

        let reported = content_digest(response.headers());
        let header_type = content_type(response.headers());
        let content = read_body(response).await?;

        let media_type = match header_type {
            Some(media_type) if !media_type.is_empty() => media_type,
            _ => serde_json::from_slice::<MediaTypeField>(&content)
                .ok()
                .and_then(|field| field.media_type)
                .unwrap_or_default(),
        };

        let digest = Digest::sha256(&content);
        if let Some(reported) = reported.filter(|reported| *reported != digest) {
            tracing::debug!(%reported, %digest, "upstream digest header differs from content");
        }

        Ok(Some(UpstreamManifest {
            digest,
            media_type,
            content,
        }))
    }

    #[tracing::instrument(skip(self), fields(upstream = %self.base))]
    async fn head_manifest(
        &self,
        name: &RepositoryName,
        reference: &str,
    ) -> Result<Option<ManifestHead>, UpstreamError> {
        let accept = MediaType::accept_header();
        let Some(response) = self
            .fetch(Method::HEAD, name, &format!("manifests/{reference}"), Some(accept.as_str()))
            .await?
        else {
            return Ok(None);
        };

        let headers = response.headers();
        Ok(Some(ManifestHead {
            digest: content_digest(headers),
            media_type: content_type(headers).unwrap_or_default(),
            size: content_length(headers),
        }))
    }

    #[tracing::instrument(skip(self), fields(upstream = %self.base))]
    async fn get_blob(
        &self,
        name: &RepositoryName,
        digest: &Digest,
    ) -> Result<Option<Bytes>, UpstreamError> {
        match self
            .fetch(Method::GET, name, &format!("blobs/{digest}"), None)
            .await?
        {
            Some(response) => Ok(Some(read_body(response).await?)),
            None => Ok(None),
        }
    }

    #[tracing::instrument(skip(self), fields(upstream = %self.base))]
    async fn head_blob(
        &self,
        name: &RepositoryName,
        digest: &Digest,
    ) -> Result<Option<BlobHead>, UpstreamError> {
        Ok(self
            .fetch(Method::HEAD, name, &format!("blobs/{digest}"), None)
            .await?
            .map(|response| BlobHead {
                size: content_length(response.headers()),
            }))
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    type Seen = Arc<Mutex<Vec<http::request::Parts>>>;

    fn network() -> NetworkConfig {
        NetworkConfig {
            max_retries: 2,
            retry_delay: Duration::from_millis(1),
            max_retry_delay: Duration::from_millis(4),
            ..Default::default()
        }
    }

    fn config() -> DockerConfig {
        DockerConfig {
            url: "https://registry.test".into(),
            token_url: Some("https://auth.test/token".into()),
            service: "registry.test".into(),
            username: Some("user".into()),
            password: Some(Credential::new("pass")),
            network: network(),
        }
    }

    fn respond(status: StatusCode, headers: &[(&str, &str)], body: &'static [u8]) -> Response {
        let mut builder = http::Response::builder().status(status);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::from(Bytes::from_static(body))).unwrap()
    }

    fn mock<F>(config: DockerConfig, handler: F) -> (DockerClient, Seen)
    where
        F: Fn(&http::request::Parts) -> Response + Clone + Send + Sync + 'static,
    {
        let seen = Seen::default();
        let recorded = seen.clone();
        let service = tower::service_fn(move |request: Request| {
            let (parts, _) = request.into_parts();
            let response = handler(&parts);
            recorded.lock().push(parts);
            async move { Ok::<_, hyperdriver::client::Error>(response) }
        });

        (DockerClient::with_service(config, service).unwrap(), seen)
    }

    fn registry(parts: &http::request::Parts) -> Response {
        match parts.uri.path() {
            "/token" => respond(
                StatusCode::OK,
                &[],
                br#"{"token":"t0k3n","expires_in":300}"#,
            ),
            "/v2/library/alpine/manifests/latest" => respond(
                StatusCode::OK,
                &[("content-type", "application/vnd.oci.image.manifest.v1+json")],
                br#"{"schemaVersion":2}"#,
            ),
            _ => respond(StatusCode::NOT_FOUND, &[], b""),
        }
    }

    fn alpine() -> RepositoryName {
        RepositoryName::from_segments("alpine", None).unwrap()
    }

    #[test]
    fn backoff_is_capped() {
        let backoff = Backoff::new(Duration::from_secs(5), 2.0, Duration::from_secs(12));
        let backoff = backoff.increment();
        assert_eq!(backoff.delay, Duration::from_secs(10));
        let backoff = backoff.increment();
        assert_eq!(backoff.delay, Duration::from_secs(12));
        assert_eq!(backoff.increment().delay, Duration::from_secs(12));
    }

    #[tokio::test]
    async fn fetches_manifest_with_cached_token() {
        let (client, seen) = mock(config(), registry);

        for _ in 0..2 {
            let manifest = client.get_manifest(&alpine(), "latest").await.unwrap().unwrap();
            assert_eq!(manifest.content, Bytes::from_static(br#"{"schemaVersion":2}"#));
            assert_eq!(manifest.digest, Digest::sha256(br#"{"schemaVersion":2}"#));
            assert_eq!(
                manifest.media_type,
                "application/vnd.oci.image.manifest.v1+json"
            );
        }

        let seen = seen.lock();
        let token_requests: Vec<_> = seen.iter().filter(|p| p.uri.path() == "/token").collect();
        assert_eq!(token_requests.len(), 1);

        let query = token_requests[0].uri.query().unwrap();
        assert!(query.contains("service=registry.test"));
        assert!(query.contains("scope=repository:library/alpine:pull"));
        assert_eq!(
            token_requests[0].headers[AUTHORIZATION],
            basic_auth("user", &Credential::new("pass"))
        );

        let manifest_request = seen
            .iter()
            .find(|p| p.uri.path().ends_with("/manifests/latest"))
            .unwrap();
        assert_eq!(manifest_request.headers[AUTHORIZATION], "Bearer t0k3n");
        let accept = manifest_request.headers[ACCEPT].to_str().unwrap();
        for media_type in MediaType::ALL {
            assert!(accept.contains(media_type.as_str()));
        }
    }

    #[tokio::test]
    async fn access_token_is_used_when_token_is_empty() {
        let (client, seen) = mock(config(), |parts| match parts.uri.path() {
            "/token" => respond(StatusCode::OK, &[], br#"{"token":"","access_token":"fallback"}"#),
            _ => respond(StatusCode::OK, &[("content-length", "7")], b""),
        });

        let head = client
            .head_blob(&alpine(), &Digest::sha256(b"layer"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(head.size, 7);
        assert_eq!(seen.lock()[1].headers[AUTHORIZATION], "Bearer fallback");
    }

    #[tokio::test]
    async fn anonymous_without_token_url() {
        let config = DockerConfig {
            token_url: None,
            ..config()
        };
        let (client, seen) = mock(config, registry);

        assert!(client.get_manifest(&alpine(), "latest").await.unwrap().is_some());
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(!seen[0].headers.contains_key(AUTHORIZATION));
    }

    #[tokio::test]
    async fn not_found_is_none_and_not_retried() {
        let (client, seen) = mock(config(), registry);

        let missing = client
            .get_blob(&alpine(), &Digest::sha256(b"missing"))
            .await
            .unwrap();
        assert!(missing.is_none());

        let blob_requests = seen
            .lock()
            .iter()
            .filter(|p| p.uri.path().contains("/blobs/"))
            .count();
        assert_eq!(blob_requests, 1);
    }

    #[tokio::test]
    async fn server_errors_are_retried() {
        let config = DockerConfig {
            token_url: None,
            ..config()
        };
        let (client, seen) = mock(config, |_| respond(StatusCode::SERVICE_UNAVAILABLE, &[], b""));

        let error = client.get_manifest(&alpine(), "latest").await.unwrap_err();
        assert!(matches!(
            error,
            UpstreamError::RetriesExhausted {
                status: StatusCode::SERVICE_UNAVAILABLE,
                attempts: 3,
                ..
            }
        ));
        assert_eq!(seen.lock().len(), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let config = DockerConfig {
            token_url: None,
            ..config()
        };
        let (client, seen) = mock(config, |_| respond(StatusCode::UNAUTHORIZED, &[], b""));

        let error = client.head_manifest(&alpine(), "latest").await.unwrap_err();
        assert!(matches!(
            error,
            UpstreamError::Status {
                status: StatusCode::UNAUTHORIZED,
                ..
            }
        ));
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn blob_redirects_are_followed_without_credentials() {
        let (client, seen) = mock(config(), |parts| match parts.uri.path() {
            "/token" => respond(StatusCode::OK, &[], br#"{"token":"t"}"#),
            "/cdn/layer" => respond(StatusCode::OK, &[], b"layer"),
            _ => respond(
                StatusCode::TEMPORARY_REDIRECT,
                &[("location", "https://cdn.test/cdn/layer")],
                b"",
            ),
        });

        let blob = client
            .get_blob(&alpine(), &Digest::sha256(b"layer"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(blob, Bytes::from_static(b"layer"));

        let seen = seen.lock();
        let cdn = seen.iter().find(|p| p.uri.path() == "/cdn/layer").unwrap();
        assert!(!cdn.headers.contains_key(AUTHORIZATION));
    }

    #[test]
    fn network_config_reads_seconds() {
        let network: NetworkConfig =
            toml_edit::de::from_str("retry-delay = 0.5\nmax-retries = 1\nconnect-timeout = 3")
                .unwrap();
        assert_eq!(network.retry_delay, Duration::from_millis(500));
        assert_eq!(network.connect_timeout, Duration::from_secs(3));
        assert_eq!(network.max_retries, 1);
        assert_eq!(network.request_timeout, Duration::from_secs(30));
    }
}
