//! Server configuration, read from TOML.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use storage::StorageConfig;

use crate::service::{CacheConfig, DEFAULT_ID_CACHE_CAPACITY, HostedSource, RegistryIdentity};
use crate::upstream::{
    Credential, DEFAULT_REGISTRY_URL, DEFAULT_TOKEN_SERVICE, DEFAULT_TOKEN_URL, DockerConfig,
    NetworkConfig,
};

/// Errors loading a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("reading {path}: {source}")]
    Io {
        /// The configuration file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid configuration TOML.
    #[error("parsing configuration: {0}")]
    Parse(#[from] toml_edit::de::Error),

    /// The values parse but cannot be served together.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RegistryConfig {
    /// Hosted listener.
    pub server: ServerConfig,
    /// Blob content storage.
    pub storage: StorageSection,
    /// The hosted registry.
    pub hosted: HostedConfig,
    /// Namespace and repository id memoization.
    pub id_cache: IdCacheConfig,
    /// Pull-through caches, one listener each.
    pub upstream: Vec<UpstreamConfig>,
}

/// `[server]`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ServerConfig {
    /// Address the hosted registry listens on.
    pub address: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([0, 0, 0, 0], 5000)),
        }
    }
}

/// `[storage]`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct StorageSection {
    /// Bucket holding all registry content.
    pub bucket: String,
    /// Storage backend.
    pub driver: StorageConfig,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            bucket: "registry".into(),
            driver: StorageConfig::Memory {
                bucket: "registry".into(),
            },
        }
    }
}

/// `[hosted]`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct HostedConfig {
    /// Registry id.
    pub id: String,
    /// Registry name.
    pub name: String,
    /// Create missing namespaces when content is pushed.
    pub create_namespace_on_push: bool,
    /// Create missing repositories when content is pushed.
    pub create_repository_on_push: bool,
}

impl Default for HostedConfig {
    fn default() -> Self {
        let identity = RegistryIdentity::default();
        Self {
            id: identity.id,
            name: identity.name,
            create_namespace_on_push: true,
            create_repository_on_push: true,
        }
    }
}

impl HostedConfig {
    /// The hosted registry's identity.
    pub fn identity(&self) -> RegistryIdentity {
        RegistryIdentity {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }

    /// The hosted content source.
    pub fn source(&self) -> HostedSource {
        HostedSource::new(self.create_namespace_on_push, self.create_repository_on_push)
    }
}

/// `[id-cache]`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct IdCacheConfig {
    /// Maximum number of memoized ids.
    pub capacity: usize,
}

impl Default for IdCacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_ID_CACHE_CAPACITY,
        }
    }
}

fn default_url() -> String {
    DEFAULT_REGISTRY_URL.into()
}

fn default_token_url() -> String {
    DEFAULT_TOKEN_URL.into()
}

fn default_service() -> String {
    DEFAULT_TOKEN_SERVICE.into()
}

/// `[[upstream]]`: one pull-through cache.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UpstreamConfig {
    /// Registry id.
    pub id: String,
    /// Registry name.
    pub name: String,
    /// Address this cache listens on.
    pub address: SocketAddr,
    /// Upstream base URL.
    #[serde(default = "default_url")]
    pub url: String,
    /// Token endpoint. An empty value means anonymous access.
    #[serde(default = "default_token_url")]
    pub token_url: String,
    /// `service` sent to the token endpoint.
    #[serde(default = "default_service")]
    pub service: String,
    /// Username for the token endpoint.
    #[serde(default)]
    pub username: Option<String>,
    /// Password for the token endpoint.
    #[serde(default)]
    pub password: Option<Credential>,
    /// Timeouts and retries.
    #[serde(default)]
    pub network: NetworkConfig,
    /// Local caching.
    #[serde(default)]
    pub cache: CacheConfig,
}

impl UpstreamConfig {
    /// The cache registry's identity.
    pub fn identity(&self) -> RegistryIdentity {
        RegistryIdentity {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }

    /// Client settings for the upstream.
    pub fn client(&self) -> DockerConfig {
        DockerConfig {
            url: self.url.clone(),
            token_url: (!self.token_url.is_empty()).then(|| self.token_url.clone()),
            service: self.service.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            network: self.network.clone(),
        }
    }
}

impl RegistryConfig {
    /// Read and validate a configuration file.
    pub fn from_path(path: &Utf8Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        text.parse()
    }

    /// Check that every registry has a distinct id and listener.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ids = HashSet::from([self.hosted.id.as_str()]);
        let mut addresses = HashSet::from([self.server.address]);

        for upstream in &self.upstream {
            if !ids.insert(upstream.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "registry id {:?} is used more than once",
                    upstream.id
                )));
            }
            if !addresses.insert(upstream.address) {
                return Err(ConfigError::Invalid(format!(
                    "upstream {:?} listens on {}, which is already taken",
                    upstream.name, upstream.address
                )));
            }
        }
        Ok(())
    }
}

impl FromStr for RegistryConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: RegistryConfig = toml_edit::de::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: RegistryConfig = "".parse().unwrap();
        assert_eq!(config.server.address, "0.0.0.0:5000".parse().unwrap());
        assert_eq!(config.storage.bucket, "registry");
        assert_eq!(config.hosted.identity(), RegistryIdentity::default());
        assert!(config.hosted.create_repository_on_push);
        assert_eq!(config.id_cache.capacity, DEFAULT_ID_CACHE_CAPACITY);
        assert!(config.upstream.is_empty());
    }

    #[test]
    fn full_config() {
        let config: RegistryConfig = r#"
            [server]
            address = "127.0.0.1:5000"

            [storage]
            bucket = "images"
            driver = { local = { path = "/var/lib/registry" } }

            [hosted]
            create-namespace-on-push = false

            [id-cache]
            capacity = 16

            [[upstream]]
            id = "2"
            name = "docker-hub"
            address = "127.0.0.1:5001"
            username = "robot"
            password = "hunter2"

            [upstream.network]
            max-retries = 5
            retry-delay = 0.5

            [upstream.cache]
            ttl = 600

            [[upstream]]
            id = "3"
            name = "mirror"
            address = "127.0.0.1:5002"
            url = "https://mirror.example.com"
            token-url = ""

            [upstream.cache]
            enabled = false
        "#
        .parse()
        .unwrap();

        assert_eq!(config.storage.bucket, "images");
        assert!(matches!(config.storage.driver, StorageConfig::Local { .. }));
        assert!(!config.hosted.create_namespace_on_push);
        assert!(config.hosted.create_repository_on_push);
        assert_eq!(config.id_cache.capacity, 16);

        let hub = &config.upstream[0];
        let client = hub.client();
        assert_eq!(client.url, DEFAULT_REGISTRY_URL);
        assert_eq!(client.token_url.as_deref(), Some(DEFAULT_TOKEN_URL));
        assert_eq!(client.password.unwrap().revealed(), "hunter2");
        assert_eq!(client.network.max_retries, 5);
        assert_eq!(client.network.retry_delay, Duration::from_millis(500));
        assert_eq!(client.network.request_timeout, Duration::from_secs(30));
        assert_eq!(hub.cache.ttl, Duration::from_secs(600));
        assert!(hub.cache.enabled);

        let mirror = &config.upstream[1];
        assert_eq!(mirror.client().token_url, None);
        assert!(!mirror.cache.enabled);
        assert_eq!(mirror.identity().name, "mirror");
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let error = r#"
            [[upstream]]
            id = "1"
            name = "clash"
            address = "127.0.0.1:5001"
        "#
        .parse::<RegistryConfig>()
        .unwrap_err();
        assert!(matches!(error, ConfigError::Invalid(_)));
    }

    #[test]
    fn shared_addresses_are_rejected() {
        let error = r#"
            [[upstream]]
            id = "2"
            name = "clash"
            address = "0.0.0.0:5000"
        "#
        .parse::<RegistryConfig>()
        .unwrap_err();
        assert!(matches!(error, ConfigError::Invalid(_)));
    }

    #[test]
    fn from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\naddress = \"127.0.0.1:6000\"").unwrap();
        let path = Utf8Path::from_path(file.path()).unwrap();

        let config = RegistryConfig::from_path(path).unwrap();
        assert_eq!(config.server.address, "127.0.0.1:6000".parse().unwrap());
    }

    #[test]
    fn missing_file() {
        let error =
            RegistryConfig::from_path(Utf8Path::new("/nonexistent/registry.toml")).unwrap_err();
        assert!(matches!(error, ConfigError::Io { .. }));
    }
}
