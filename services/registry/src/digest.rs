//! Content digests and manifest content identity.
//!
//! Every manifest has two digests:
//!
//! - the raw digest, the sha256 of the exact bytes stored and served, and
//! - the unique digest, the sha256 of the content references the manifest makes
//!   (config and layer digests for an image, entry digests for an index).
//!
//! Two serializations of the same image share a unique digest even when their
//! raw digests differ, which is what manifest deduplication keys on.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use sha2::{Digest as _, Sha256};

use crate::error::{RegistryError, RegistryResult};

/// A content digest of the form `algorithm:encoded`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    value: String,
    split: usize,
}

impl Digest {
    /// The sha256 digest of `data`.
    pub fn sha256(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        Digest {
            value: format!("sha256:{}", hex::encode(hash)),
            split: "sha256".len(),
        }
    }

    /// The algorithm portion, e.g. `sha256`.
    pub fn algorithm(&self) -> &str {
        &self.value[..self.split]
    }

    /// The encoded hash portion.
    pub fn encoded(&self) -> &str {
        &self.value[self.split + 1..]
    }

    /// The full `algorithm:encoded` form.
    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// Whether `value` looks like a digest rather than a tag.
    pub fn is_digest(value: &str) -> bool {
        value.contains(':')
    }
}

fn valid_algorithm(algorithm: &str) -> bool {
    let component = |part: &str| {
        !part.is_empty()
            && part
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
    };
    !algorithm.is_empty() && algorithm.split(['+', '.', '_', '-']).all(component)
}

fn valid_encoding(algorithm: &str, encoded: &str) -> bool {
    let lower_hex = |len: usize| {
        encoded.len() == len && encoded.bytes().all(|b| matches!(b, b'a'..=b'f' | b'0'..=b'9'))
    };

    match algorithm {
        "sha256" => lower_hex(64),
        "sha512" => lower_hex(128),
        _ => {
            !encoded.is_empty()
                && encoded
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'=' | b'_' | b'-'))
        }
    }
}

impl FromStr for Digest {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, encoded) = s
            .split_once(':')
            .ok_or_else(|| RegistryError::InvalidDigest(s.to_owned()))?;

        if !valid_algorithm(algorithm) || !valid_encoding(algorithm, encoded) {
            return Err(RegistryError::InvalidDigest(s.to_owned()));
        }

        Ok(Digest {
            value: s.to_owned(),
            split: algorithm.len(),
        })
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl AsRef<str> for Digest {
    fn as_ref(&self) -> &str {
        &self.value
    }
}

/// The manifest media types this registry understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    /// `application/vnd.docker.distribution.manifest.v2+json`
    DockerManifest,
    /// `application/vnd.docker.distribution.manifest.list.v2+json`
    DockerManifestList,
    /// `application/vnd.oci.image.manifest.v1+json`
    OciManifest,
    /// `application/vnd.oci.image.index.v1+json`
    OciIndex,
}

impl MediaType {
    /// Every supported media type.
    pub const ALL: [MediaType; 4] = [
        MediaType::DockerManifest,
        MediaType::DockerManifestList,
        MediaType::OciManifest,
        MediaType::OciIndex,
    ];

    /// The media type string.
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::DockerManifest => "application/vnd.docker.distribution.manifest.v2+json",
            MediaType::DockerManifestList => {
                "application/vnd.docker.distribution.manifest.list.v2+json"
            }
            MediaType::OciManifest => "application/vnd.oci.image.manifest.v1+json",
            MediaType::OciIndex => "application/vnd.oci.image.index.v1+json",
        }
    }

    /// A single `Accept` header value naming every supported type.
    pub fn accept_header() -> String {
        MediaType::ALL
            .iter()
            .map(MediaType::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl FromStr for MediaType {
    type Err = RegistryError;

    /// Parameters such as `; charset=utf-8` are ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let essence = s.split(';').next().unwrap_or_default().trim();
        MediaType::ALL
            .into_iter()
            .find(|media_type| media_type.as_str().eq_ignore_ascii_case(essence))
            .ok_or_else(|| RegistryError::UnsupportedMediaType(s.to_owned()))
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default, Deserialize)]
struct Descriptor {
    #[serde(default)]
    digest: String,
}

/// An image manifest: one config and an ordered list of layers.
#[derive(Debug, Deserialize)]
pub struct ImageManifest {
    #[serde(default)]
    config: Descriptor,
    #[serde(default)]
    layers: Vec<Descriptor>,
}

/// An image index: an ordered list of platform manifests.
#[derive(Debug, Deserialize)]
struct ImageIndex {
    manifests: Option<Vec<Descriptor>>,
}

/// A parsed manifest of one of the supported media types.
#[derive(Debug)]
pub enum ManifestDocument {
    /// Docker image manifest, schema 2.
    DockerManifest(ImageManifest),
    /// Docker manifest list.
    DockerManifestList(Vec<String>),
    /// OCI image manifest.
    OciManifest(ImageManifest),
    /// OCI image index.
    OciIndex(Vec<String>),
}

fn index_entries(content: &[u8]) -> RegistryResult<Vec<String>> {
    let index: ImageIndex = serde_json::from_slice(content)
        .map_err(|err| RegistryError::InvalidManifest(err.to_string()))?;
    let manifests = index
        .manifests
        .ok_or_else(|| RegistryError::InvalidManifest("index has no manifests".into()))?;
    Ok(manifests.into_iter().map(|entry| entry.digest).collect())
}

fn image(content: &[u8]) -> RegistryResult<ImageManifest> {
    serde_json::from_slice(content).map_err(|err| RegistryError::InvalidManifest(err.to_string()))
}

impl ManifestDocument {
    /// Parse `content` as a manifest of `media_type`.
    pub fn parse(media_type: MediaType, content: &[u8]) -> RegistryResult<Self> {
        Ok(match media_type {
            MediaType::DockerManifest => ManifestDocument::DockerManifest(image(content)?),
            MediaType::DockerManifestList => {
                ManifestDocument::DockerManifestList(index_entries(content)?)
            }
            MediaType::OciManifest => ManifestDocument::OciManifest(image(content)?),
            MediaType::OciIndex => ManifestDocument::OciIndex(index_entries(content)?),
        })
    }

    /// The media type this document was parsed as.
    pub fn media_type(&self) -> MediaType {
        match self {
            ManifestDocument::DockerManifest(_) => MediaType::DockerManifest,
            ManifestDocument::DockerManifestList(_) => MediaType::DockerManifestList,
            ManifestDocument::OciManifest(_) => MediaType::OciManifest,
            ManifestDocument::OciIndex(_) => MediaType::OciIndex,
        }
    }

    /// The ordered content references that define this manifest's identity.
    pub fn references(&self) -> Vec<&str> {
        match self {
            ManifestDocument::DockerManifest(manifest)
            | ManifestDocument::OciManifest(manifest) => {
                std::iter::once(manifest.config.digest.as_str())
                    .chain(manifest.layers.iter().map(|layer| layer.digest.as_str()))
                    .collect()
            }
            ManifestDocument::DockerManifestList(entries) | ManifestDocument::OciIndex(entries) => {
                entries.iter().map(String::as_str).collect()
            }
        }
    }

    /// The canonical digest over [`ManifestDocument::references`].
    pub fn unique_digest(&self) -> Digest {
        Digest::sha256(self.references().join(":").as_bytes())
    }
}

/// Compute the unique digest of `content` declared as `media_type`.
pub fn unique_digest(media_type: &str, content: &[u8]) -> RegistryResult<Digest> {
    let media_type: MediaType = media_type.parse()?;
    Ok(ManifestDocument::parse(media_type, content)?.unique_digest())
}
