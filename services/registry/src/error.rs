//! Error types for the registry

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use keyed_tx::TransactionError;

use crate::store::StoreError;
use crate::upstream::UpstreamError;

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Error types for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Blob not found
    #[error("blob unknown to registry: {0}")]
    BlobUnknown(String),

    /// Upload session not found
    #[error("blob upload unknown to registry: {0}")]
    BlobUploadUnknown(String),

    /// Manifest not found
    #[error("manifest unknown to registry: {0}")]
    ManifestUnknown(String),

    /// Namespace or repository not found
    #[error("repository name not known to registry: {0}")]
    NameUnknown(String),

    /// Invalid digest format
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// Content did not hash to the digest the client supplied
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Expected digest
        expected: String,
        /// Actual digest
        actual: String,
    },

    /// Invalid namespace or repository name
    #[error("invalid repository name: {0}")]
    InvalidName(String),

    /// Invalid tag
    #[error("invalid tag: {0}")]
    InvalidTag(String),

    /// Missing, malformed or short `Content-Range`
    #[error("invalid content range: {0}")]
    InvalidRange(String),

    /// Upload could not be completed as requested
    #[error("blob upload invalid: {0}")]
    BlobUploadInvalid(String),

    /// Malformed manifest
    #[error("manifest invalid: {0}")]
    InvalidManifest(String),

    /// Unsupported manifest media type
    #[error("unsupported manifest media type: {0}")]
    UnsupportedMediaType(String),

    /// The operation is not available on this registry
    #[error("the operation is unsupported")]
    Unsupported,

    /// Persistence failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Blob content storage failure
    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    /// Upstream registry failure
    #[error("upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    /// Keyed transaction failure
    #[error("transaction error: {0}")]
    Transaction(#[from] TransactionError),
}

impl RegistryError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::BlobUnknown(_)
            | RegistryError::BlobUploadUnknown(_)
            | RegistryError::ManifestUnknown(_)
            | RegistryError::NameUnknown(_) => StatusCode::NOT_FOUND,
            RegistryError::InvalidDigest(_)
            | RegistryError::DigestMismatch { .. }
            | RegistryError::InvalidName(_)
            | RegistryError::InvalidTag(_)
            | RegistryError::InvalidRange(_)
            | RegistryError::BlobUploadInvalid(_)
            | RegistryError::InvalidManifest(_)
            | RegistryError::UnsupportedMediaType(_) => StatusCode::BAD_REQUEST,
            RegistryError::Unsupported => StatusCode::METHOD_NOT_ALLOWED,
            RegistryError::Store(_)
            | RegistryError::Storage(_)
            | RegistryError::Upstream(_)
            | RegistryError::Transaction(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for Distribution API error responses
    pub fn error_code(&self) -> &'static str {
        match self {
            RegistryError::BlobUnknown(_) => "BLOB_UNKNOWN",
            RegistryError::BlobUploadUnknown(_) => "BLOB_UPLOAD_UNKNOWN",
            RegistryError::ManifestUnknown(_) => "MANIFEST_UNKNOWN",
            RegistryError::NameUnknown(_) => "NAME_UNKNOWN",
            RegistryError::InvalidDigest(_) | RegistryError::DigestMismatch { .. } => {
                "DIGEST_INVALID"
            }
            RegistryError::InvalidName(_) => "NAME_INVALID",
            RegistryError::InvalidTag(_) => "TAG_INVALID",
            RegistryError::InvalidRange(_) => "RANGE_INVALID",
            RegistryError::BlobUploadInvalid(_) => "BLOB_UPLOAD_INVALID",
            RegistryError::InvalidManifest(_) | RegistryError::UnsupportedMediaType(_) => {
                "MANIFEST_INVALID"
            }
            RegistryError::Unsupported => "UNSUPPORTED",
            RegistryError::Store(_)
            | RegistryError::Storage(_)
            | RegistryError::Upstream(_)
            | RegistryError::Transaction(_) => "UNKNOWN",
        }
    }

    fn detail(&self) -> Option<serde_json::Value> {
        match self {
            RegistryError::DigestMismatch { expected, actual } => Some(serde_json::json!({
                "expected": expected,
                "actual": actual,
            })),
            _ => None,
        }
    }
}

/// Distribution API error response format
#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, serde::Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();

        // Internal failures are logged, never echoed to the client.
        let message = if status.is_server_error() {
            tracing::error!(error = %self, code, "request failed");
            "internal server error".to_string()
        } else {
            tracing::debug!(error = %self, code, "request rejected");
            self.to_string()
        };

        let body = ErrorResponse {
            errors: vec![ErrorDetail {
                code,
                message,
                detail: self.detail(),
            }],
        };

        (status, axum::Json(body)).into_response()
    }
}
