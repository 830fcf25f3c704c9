//! Repository names, references and request parameters.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};

/// Namespace used when a request names only a repository.
pub const DEFAULT_NAMESPACE: &str = "library";

fn valid_component(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-'))
}

/// A validated `namespace/repository` pair.
///
/// Both components are restricted to `[a-zA-Z0-9_-]` since they become part of
/// storage paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepositoryName {
    namespace: String,
    repository: String,
}

impl RepositoryName {
    /// Validate a namespace and repository.
    pub fn new(namespace: &str, repository: &str) -> RegistryResult<Self> {
        if !valid_component(namespace) || !valid_component(repository) {
            return Err(RegistryError::InvalidName(format!("{namespace}/{repository}")));
        }

        Ok(Self {
            namespace: namespace.to_owned(),
            repository: repository.to_owned(),
        })
    }

    /// Build from path segments, where a missing namespace means [`DEFAULT_NAMESPACE`].
    pub fn from_segments(first: &str, second: Option<&str>) -> RegistryResult<Self> {
        match second {
            Some(repository) => Self::new(first, repository),
            None => Self::new(DEFAULT_NAMESPACE, first),
        }
    }

    /// The namespace component.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The repository component.
    pub fn repository(&self) -> &str {
        &self.repository
    }
}

impl fmt::Display for RepositoryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.repository)
    }
}

/// Validate a tag name: `[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}`.
pub fn validate_tag(tag: &str) -> RegistryResult<()> {
    let mut bytes = tag.bytes();
    let valid = match bytes.next() {
        Some(first) if first.is_ascii_alphanumeric() || first == b'_' => {
            tag.len() <= 128
                && bytes.all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
        }
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidTag(tag.to_owned()))
    }
}

/// Check that an upload session id is a UUID, the only form handed out.
///
/// Session ids become storage path components, so anything else is unknown.
pub fn validate_session(session: &str) -> RegistryResult<()> {
    Uuid::parse_str(session)
        .map(|_| ())
        .map_err(|_| RegistryError::BlobUploadUnknown(session.to_owned()))
}

/// A manifest reference: a tag or a digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    /// A mutable tag.
    Tag(String),
    /// An immutable content digest.
    Digest(Digest),
}

impl Reference {
    /// The reference as it appears in a URL.
    pub fn as_str(&self) -> &str {
        match self {
            Reference::Tag(tag) => tag,
            Reference::Digest(digest) => digest.as_str(),
        }
    }
}

impl FromStr for Reference {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if Digest::is_digest(s) {
            Ok(Reference::Digest(s.parse()?))
        } else {
            validate_tag(s)?;
            Ok(Reference::Tag(s.to_owned()))
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chunk range from a `Content-Range` header, as `start-end`.
///
/// `end` is exclusive, so a chunk of `n` bytes at offset 0 is `0-n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    /// First byte offset.
    pub start: u64,
    /// Offset one past the last byte.
    pub end: u64,
}

impl ContentRange {
    /// Number of bytes covered.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Whether the range covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Check that a payload of `len` bytes fills the range exactly.
    pub fn check_payload(&self, len: usize) -> RegistryResult<()> {
        if self.len() != len as u64 {
            return Err(RegistryError::InvalidRange(format!(
                "{self} covers {} bytes but {len} were sent",
                self.len()
            )));
        }
        Ok(())
    }
}

impl FromStr for ContentRange {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RegistryError::InvalidRange(s.to_owned());
        let (start, end) = s.split_once('-').ok_or_else(invalid)?;

        let number = |value: &str| {
            if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            value.parse::<u64>().map_err(|_| invalid())
        };

        let range = ContentRange {
            start: number(start)?,
            end: number(end)?,
        };
        if range.end < range.start {
            return Err(invalid());
        }
        Ok(range)
    }
}

impl fmt::Display for ContentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}
