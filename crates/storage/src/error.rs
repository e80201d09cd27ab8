//! Storage error types and result alias.
//!
//! Every failure the persistence layer can observe is mapped to one of the
//! [`StorageError`] variants. Callers on the authentication hot path never see
//! these directly: the best-effort wrappers in [`crate::durable`] and
//! [`crate::token_file`] log and swallow them.
//!
//! # Error Types
//!
//! - [`StorageError::NotFound`] - A record or file does not exist
//! - [`StorageError::Io`] - Filesystem failure while reading or writing
//! - [`StorageError::Serialization`] - A record could not be encoded or decoded
//! - [`StorageError::InvalidTag`] - An alias or endpoint cannot be encoded in a record tag
//! - [`StorageError::KeyUnusable`] - A private key is missing or refuses to sign
//! - [`StorageError::LockTimeout`] - The interprocess lock was not acquired in time
//! - [`StorageError::PermissionDenied`] - The store or lock scope is not accessible
//! - [`StorageError::Unsupported`] - The platform has no durable store
//! - [`StorageError::Internal`] - Anything else
//!
//! # Example
//!
//! ```
//! use mtls_binding_storage::{StorageError, StorageResult};
//!
//! fn lookup(id: &str) -> StorageResult<Vec<u8>> {
//!     Err(StorageError::not_found(id))
//! }
//! ```

use std::sync::Arc;

use thiserror::Error;

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur while persisting or loading credentials.
///
/// Errors preserve their source chain via `#[source]` so that the log line
/// emitted when a best-effort operation is skipped carries the full context.
///
/// # Non-exhaustive
///
/// This enum is marked `#[non_exhaustive]`. Downstream match expressions must
/// include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// The requested record does not exist.
    #[error("Record not found: {id}")]
    NotFound {
        /// Identifier of the missing record.
        id: String,
    },

    /// Filesystem failure.
    #[error("I/O error: {message}")]
    Io {
        /// What was being attempted.
        message: String,
        /// The underlying I/O error.
        #[source]
        source: Option<BoxError>,
    },

    /// A record could not be encoded or decoded.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the serialization error.
        message: String,
        /// The underlying error that caused serialization to fail.
        #[source]
        source: Option<BoxError>,
    },

    /// A value cannot be placed in a persisted-record tag.
    #[error("Invalid record tag: {message}")]
    InvalidTag {
        /// Why the tag was rejected.
        message: String,
    },

    /// The private key is missing or cannot produce a signature.
    #[error("Private key unusable: {message}")]
    KeyUnusable {
        /// Description of the key failure.
        message: String,
        /// The underlying crypto error.
        #[source]
        source: Option<BoxError>,
    },

    /// The interprocess lock could not be acquired within its timeout.
    #[error("Lock not acquired: {name}")]
    LockTimeout {
        /// Derived lock name.
        name: String,
    },

    /// The store or lock scope exists but the process may not use it.
    #[error("Permission denied: {message}")]
    PermissionDenied {
        /// Description of what was denied.
        message: String,
    },

    /// No durable store is available on this platform or it is disabled.
    #[error("Durable store unsupported: {message}")]
    Unsupported {
        /// Description of the missing capability.
        message: String,
    },

    /// Catch-all for failures that fit nowhere else.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },
}

impl StorageError {
    /// Creates a new `NotFound` error.
    #[must_use]
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Creates a new `Io` error wrapping `source`.
    #[must_use]
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            return Self::PermissionDenied { message: format!("{}: {source}", message.into()) };
        }
        Self::Io { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Serialization` error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into(), source: None }
    }

    /// Creates a new `Serialization` error with a message and source error.
    #[must_use]
    pub fn serialization_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `InvalidTag` error.
    #[must_use]
    pub fn invalid_tag(message: impl Into<String>) -> Self {
        Self::InvalidTag { message: message.into() }
    }

    /// Creates a new `KeyUnusable` error with the given message.
    #[must_use]
    pub fn key_unusable(message: impl Into<String>) -> Self {
        Self::KeyUnusable { message: message.into(), source: None }
    }

    /// Creates a new `KeyUnusable` error with a message and source error.
    #[must_use]
    pub fn key_unusable_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::KeyUnusable { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `LockTimeout` error.
    #[must_use]
    pub fn lock_timeout(name: impl Into<String>) -> Self {
        Self::LockTimeout { name: name.into() }
    }

    /// Creates a new `PermissionDenied` error.
    #[must_use]
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied { message: message.into() }
    }

    /// Creates a new `Unsupported` error.
    #[must_use]
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported { message: message.into() }
    }

    /// Creates a new `Internal` error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Creates a new `Internal` error with a message and source error.
    #[must_use]
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal { message: message.into(), source: Some(Arc::new(source)) }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::error::Error;

    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(StorageError::not_found("rec-1").to_string(), "Record not found: rec-1");
        assert_eq!(
            StorageError::invalid_tag("alias contains '|'").to_string(),
            "Invalid record tag: alias contains '|'"
        );
        assert_eq!(StorageError::lock_timeout("mtls-abc").to_string(), "Lock not acquired: mtls-abc");
    }

    #[test]
    fn test_io_permission_denied_is_classified() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err = StorageError::io("open store", io);
        assert!(matches!(err, StorageError::PermissionDenied { .. }));
    }

    #[test]
    fn test_io_preserves_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing file");
        let err = StorageError::io("read record", io);

        let source = err.source().expect("source chain must be preserved");
        assert_eq!(source.to_string(), "missing file");
    }
}
