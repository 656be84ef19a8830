//! Gateway error taxonomy.
//!
//! Every request ends in exactly one [`GatewayError`] or a success. Each
//! variant maps to one HTTP status through [`GatewayError::status`], so the
//! transport layer never has to inspect messages.
//!
//! | Variant | Status |
//! |---------|--------|
//! | `MissingToken`, `InvalidToken`, `Forbidden` | 401 |
//! | `MalformedRequest`, `QuotaExceeded` | 400 |
//! | `NotFound` | 404 |
//! | `ReadOnly`, `MethodNotAllowed` | 405 |
//! | `RateLimited` | 429 |
//! | `Storage` | 500 |

use std::{path::PathBuf, time::Duration};

use http::StatusCode;
use tenantkv_storage::StorageError;
use thiserror::Error;

/// Result alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors surfaced to a gateway caller.
///
/// Authorization, quota and rate errors are terminal for the request and
/// never retried by the gateway.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// No bearer credential in the header or the target.
    #[error("Missing authorization token")]
    MissingToken,

    /// The bearer credential is not a known token.
    #[error("Invalid token")]
    InvalidToken,

    /// The token is valid but not scoped to the requested namespace.
    #[error("Token not authorized for namespace {namespace}")]
    Forbidden {
        /// The namespace the caller asked for.
        namespace: String,
    },

    /// Write or delete attempted with a read-only token.
    #[error("Token is read-only")]
    ReadOnly,

    /// The key does not exist in the namespace.
    #[error("Key not found: {key}")]
    NotFound {
        /// The missing key.
        key: String,
    },

    /// Storing the payload would exceed the token's quota.
    #[error("Quota exceeded: {requested} bytes requested, {remaining} bytes remaining")]
    QuotaExceeded {
        /// Bytes the write needed (or had consumed when it was aborted).
        requested: u64,
        /// Bytes the token could still store.
        remaining: u64,
    },

    /// The client exhausted its request window.
    #[error("Rate limit exceeded (retry after {}ms)", retry_after.as_millis())]
    RateLimited {
        /// Time until the client's window resets.
        retry_after: Duration,
    },

    /// The request target could not be parsed.
    #[error("Malformed request: {reason}")]
    MalformedRequest {
        /// What was wrong with the request.
        reason: String,
    },

    /// The protocol method has no mapping onto a gateway operation.
    #[error("Method not allowed: {method}")]
    MethodNotAllowed {
        /// The rejected method.
        method: String,
    },

    /// The storage engine or blob area failed.
    #[error("Storage failure: {0}")]
    Storage(#[from] StorageError),
}

impl GatewayError {
    /// Creates a new `Forbidden` error for the given namespace.
    #[must_use]
    pub fn forbidden(namespace: impl Into<String>) -> Self {
        Self::Forbidden { namespace: namespace.into() }
    }

    /// Creates a new `NotFound` error for the given key.
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Creates a new `MalformedRequest` error.
    #[must_use]
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedRequest { reason: reason.into() }
    }

    /// Returns the HTTP status this error is reported with.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingToken | Self::InvalidToken | Self::Forbidden { .. } => {
                StatusCode::UNAUTHORIZED
            },
            Self::MalformedRequest { .. } | Self::QuotaExceeded { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::ReadOnly | Self::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Errors raised while loading or validating [`GatewayConfig`](crate::GatewayConfig).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A numeric setting is below its allowed minimum.
    #[error("{field} must be at least {min}, got {value}")]
    BelowMinimum {
        /// The offending setting.
        field: &'static str,
        /// The smallest accepted value.
        min: String,
        /// The configured value.
        value: String,
    },

    /// The configuration file could not be read.
    #[error("failed to read config file {}", path.display())]
    Read {
        /// The file that failed.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for [`GatewayConfig`](crate::GatewayConfig).
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}
