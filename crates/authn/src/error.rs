//! Authentication error types.
//!
//! This module defines the errors that can reach a caller of the binding and
//! attestation caches. Persistence failures never do: they are logged and
//! swallowed by `mtls-binding-storage`. The [`AuthError::Storage`] variant
//! exists for callers that use the storage crate directly through this one.

use mtls_binding_storage::StorageError;
use thiserror::Error;

/// Errors from certificate binding and attestation operations.
///
/// # Non-exhaustive
///
/// This enum is marked `#[non_exhaustive]`: new variants may be added in
/// future minor releases without a semver-breaking change. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuthError {
    // ========== Signing request errors ==========
    /// Hash or padding the signing request builder does not implement.
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Subject or attribute data cannot be encoded into a signing request.
    #[error("Invalid signing request: {0}")]
    InvalidSigningRequest(String),

    /// Key is unsuitable for a signing request (e.g. too small).
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Private key cannot sign.
    #[error("Private key unusable: {0}")]
    KeyUnusable(String),

    // ========== Issuance errors ==========
    /// The issuer answered, but the response is malformed.
    #[error("Invalid issuance response from {source_name}: {message}")]
    InvalidIssuanceResponse {
        /// Which collaborator produced the response.
        source_name: String,
        /// Transport status code, when known.
        status_code: Option<u16>,
        /// What was wrong with it.
        message: String,
    },

    /// The issuer refused or failed the request.
    #[error("Certificate issuance failed at {source_name}: {message}")]
    IssuanceFailed {
        /// Which collaborator failed.
        source_name: String,
        /// Transport status code, when known.
        status_code: Option<u16>,
        /// Failure description.
        message: String,
    },

    /// The attestation provider failed to mint a token.
    #[error("Attestation failed: {0}")]
    AttestationFailed(String),

    /// The caller cancelled while waiting for a gate or a mint.
    #[error("Operation cancelled")]
    Cancelled,

    /// Storage error surfaced through this crate.
    ///
    /// Wraps the original [`StorageError`] to preserve the full error source
    /// chain for debugging and structured logging.
    #[error("Storage error: {0}")]
    Storage(
        /// The underlying storage error.
        #[source]
        StorageError,
    ),
}

impl AuthError {
    /// Creates an [`AuthError::UnsupportedAlgorithm`].
    #[must_use]
    pub fn unsupported_algorithm(what: impl Into<String>) -> Self {
        Self::UnsupportedAlgorithm(what.into())
    }

    /// Creates an [`AuthError::InvalidSigningRequest`].
    #[must_use]
    pub fn invalid_signing_request(message: impl Into<String>) -> Self {
        Self::InvalidSigningRequest(message.into())
    }

    /// Creates an [`AuthError::InvalidKey`].
    #[must_use]
    pub fn invalid_key(message: impl Into<String>) -> Self {
        Self::InvalidKey(message.into())
    }

    /// Creates an [`AuthError::KeyUnusable`].
    #[must_use]
    pub fn key_unusable(message: impl Into<String>) -> Self {
        Self::KeyUnusable(message.into())
    }

    /// Creates an [`AuthError::InvalidIssuanceResponse`].
    #[must_use]
    pub fn invalid_issuance_response(
        source_name: impl Into<String>,
        status_code: Option<u16>,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidIssuanceResponse {
            source_name: source_name.into(),
            status_code,
            message: message.into(),
        }
    }

    /// Creates an [`AuthError::IssuanceFailed`].
    #[must_use]
    pub fn issuance_failed(
        source_name: impl Into<String>,
        status_code: Option<u16>,
        message: impl Into<String>,
    ) -> Self {
        Self::IssuanceFailed { source_name: source_name.into(), status_code, message: message.into() }
    }

    /// Creates an [`AuthError::AttestationFailed`].
    #[must_use]
    pub fn attestation_failed(message: impl Into<String>) -> Self {
        Self::AttestationFailed(message.into())
    }

    /// Whether the error means the certificate's key can no longer be used,
    /// so the binding should be evicted and re-minted.
    #[must_use]
    pub fn is_key_failure(&self) -> bool {
        matches!(self, Self::KeyUnusable(_) | Self::Storage(StorageError::KeyUnusable { .. }))
    }
}

impl From<StorageError> for AuthError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::KeyUnusable { message, .. } => AuthError::KeyUnusable(message),
            other => AuthError::Storage(other),
        }
    }
}

/// Result type alias for authentication operations.
pub type Result<T> = std::result::Result<T, AuthError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::error::Error;

    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            AuthError::unsupported_algorithm("SHA-384").to_string(),
            "Unsupported algorithm: SHA-384"
        );
        assert_eq!(AuthError::Cancelled.to_string(), "Operation cancelled");
        assert_eq!(
            AuthError::invalid_issuance_response("imds", Some(200), "missing client_id").to_string(),
            "Invalid issuance response from imds: missing client_id"
        );
    }

    #[test]
    fn test_issuance_errors_carry_status() {
        let err = AuthError::issuance_failed("issuer", Some(503), "unavailable");
        let AuthError::IssuanceFailed { status_code, .. } = err else {
            panic!("wrong variant");
        };
        assert_eq!(status_code, Some(503));
    }

    #[test]
    fn test_storage_key_failure_maps_to_key_unusable() {
        let err: AuthError = StorageError::key_unusable("probe failed").into();
        assert!(matches!(err, AuthError::KeyUnusable(_)));
        assert!(err.is_key_failure());
    }

    #[test]
    fn test_storage_error_preserves_source_chain() {
        let err: AuthError = StorageError::internal("disk on fire").into();
        let source = err.source().expect("source chain must be preserved");
        assert_eq!(source.to_string(), "Internal error: disk on fire");
        assert!(!err.is_key_failure());
    }
}
