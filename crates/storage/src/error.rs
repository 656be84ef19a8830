//! Storage error types and result alias.
//!
//! Every backend maps its internal failures onto [`StorageError`], so callers
//! above the storage layer never see engine-specific error types.
//!
//! # Error Types
//!
//! - [`StorageError::Conflict`] - A compare-and-set precondition did not hold
//! - [`StorageError::Serialization`] - Stored bytes could not be decoded
//! - [`StorageError::Io`] - Filesystem failure while opening or using a backend
//! - [`StorageError::Internal`] - Engine-specific failure
//!
//! # Example
//!
//! ```
//! use tenantkv_storage::{StorageError, StorageResult};
//!
//! fn decode_counter(raw: &[u8]) -> StorageResult<u64> {
//!     let bytes: [u8; 8] =
//!         raw.try_into().map_err(|_| StorageError::serialization("counter must be 8 bytes"))?;
//!     Ok(u64::from_be_bytes(bytes))
//! }
//! ```

use std::sync::Arc;

use thiserror::Error;

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
///
/// Errors preserve their source chain via `#[source]` so that log output can
/// show the underlying engine or filesystem error.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// Compare-and-set conflict: the current value did not match the
    /// expected value. The caller may re-read and retry.
    #[error("Transaction conflict")]
    Conflict,

    /// Stored bytes could not be decoded.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the decoding failure.
        message: String,
        /// The underlying error, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// Filesystem error.
    #[error("I/O error: {message}")]
    Io {
        /// Description of the failed operation.
        message: String,
        /// The underlying I/O error.
        #[source]
        source: Option<BoxError>,
    },

    /// Internal storage engine error.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
        /// The underlying error that caused this failure.
        #[source]
        source: Option<BoxError>,
    },
}

impl StorageError {
    /// Creates a new `Conflict` error.
    #[must_use]
    pub fn conflict() -> Self {
        Self::Conflict
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

    /// Creates a new `Io` error with a message and source error.
    #[must_use]
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io { message: message.into(), source: Some(Arc::new(source)) }
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

    /// Returns `true` for errors a caller can resolve by re-reading and
    /// retrying the operation.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn serialization_display_includes_message() {
        let err = StorageError::serialization("unknown entry tag");
        assert_eq!(err.to_string(), "Serialization error: unknown entry tag");
    }

    #[test]
    fn io_error_keeps_source_chain() {
        let inner = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = StorageError::io("opening shop.db", inner);
        let source = err.source().expect("io error should carry a source");
        assert_eq!(source.to_string(), "denied");
    }

    #[test]
    fn only_conflict_is_retryable() {
        assert!(StorageError::conflict().is_conflict());
        assert!(!StorageError::internal("boom").is_conflict());
    }
}
