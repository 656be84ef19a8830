//! Permission records and the grants resolved from them.
//!
//! A token's permissions are stored as JSON under the token itself in the
//! reserved [`AUTH_NAMESPACE`]:
//!
//! ```json
//! {"databases": ["shop"], "ratelimit": 0, "readonly": false,
//!  "max_storing_size": 1073741824, "used_bytes": 0}
//! ```
//!
//! Every field is optional on disk. [`StoredPermissions`] is the lenient
//! on-disk shape; [`StoredPermissions::normalize`] fills the gaps and
//! produces the [`PermissionRecord`] the gateway works with.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Name of the reserved namespace holding permission records.
pub const AUTH_NAMESPACE: &str = "auth";

/// Quota applied when a record does not set one (1 GiB).
pub const DEFAULT_QUOTA_BYTES: u64 = 1024 * 1024 * 1024;

/// Permission record as found in the auth namespace.
///
/// Accepts the legacy `Readonly` / `MaxStoringSize` spellings and ignores
/// unknown fields so hand-written records never lock a tenant out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPermissions {
    #[serde(default, rename = "databases", skip_serializing_if = "Option::is_none")]
    pub scope: Option<BTreeSet<String>>,

    #[serde(default, rename = "ratelimit", skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<i64>,

    #[serde(default, rename = "readonly", alias = "Readonly", skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,

    #[serde(
        default,
        rename = "max_storing_size",
        alias = "MaxStoringSize",
        skip_serializing_if = "Option::is_none"
    )]
    pub quota_bytes: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_bytes: Option<u64>,
}

impl StoredPermissions {
    /// Fills every absent field with its default.
    #[must_use]
    pub fn normalize(self, default_quota: u64) -> PermissionRecord {
        PermissionRecord {
            scope: self.scope.unwrap_or_default(),
            rate_limit: self.rate_limit.unwrap_or(0),
            read_only: self.read_only.unwrap_or(false),
            quota_bytes: self.quota_bytes.unwrap_or(default_quota),
            used_bytes: self.used_bytes.unwrap_or(0),
        }
    }
}

/// What a token may do.
///
/// # Example
///
/// ```
/// use tenantkv_gateway::PermissionRecord;
///
/// let record = PermissionRecord::builder()
///     .scope(["shop".to_owned()].into())
///     .quota_bytes(4096)
///     .build();
///
/// assert!(record.allows("shop"));
/// assert!(!record.allows("auth"));
/// assert_eq!(record.remaining_quota(), 4096);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
pub struct PermissionRecord {
    /// Namespaces this token may access.
    #[serde(rename = "databases")]
    #[builder(default)]
    pub scope: BTreeSet<String>,

    /// `0` inherits the service default, negative is unlimited, positive
    /// is an explicit cap per window.
    #[serde(rename = "ratelimit")]
    #[builder(default)]
    pub rate_limit: i64,

    /// Forbids writes and deletes.
    #[serde(rename = "readonly")]
    #[builder(default)]
    pub read_only: bool,

    /// Maximum bytes this token may have stored.
    #[serde(rename = "max_storing_size")]
    #[builder(default = DEFAULT_QUOTA_BYTES)]
    pub quota_bytes: u64,

    /// Bytes currently charged to this token.
    #[builder(default)]
    pub used_bytes: u64,
}

impl PermissionRecord {
    /// Returns `true` if the token may access `namespace`.
    ///
    /// The auth namespace is never reachable through an ordinary record,
    /// even if a record lists it.
    #[must_use]
    pub fn allows(&self, namespace: &str) -> bool {
        namespace != AUTH_NAMESPACE && self.scope.contains(namespace)
    }

    /// Bytes the token can still store.
    #[must_use]
    pub fn remaining_quota(&self) -> u64 {
        self.quota_bytes.saturating_sub(self.used_bytes)
    }

    /// Rate-limit policy derived from [`rate_limit`](Self::rate_limit).
    #[must_use]
    pub fn rate_policy(&self) -> RateLimitPolicy {
        RateLimitPolicy::from(self.rate_limit)
    }
}

/// How the rate limiter treats a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitPolicy {
    /// Never limited; no window is tracked.
    Unlimited,
    /// Use the service-wide default limit.
    ServiceDefault,
    /// Use this many requests per window.
    Explicit(u64),
}

impl From<i64> for RateLimitPolicy {
    fn from(value: i64) -> Self {
        match value {
            v if v < 0 => Self::Unlimited,
            0 => Self::ServiceDefault,
            v => Self::Explicit(v.unsigned_abs()),
        }
    }
}

/// The outcome of a successful authentication.
#[derive(Clone)]
pub enum Grant {
    /// The process super-token, valid only for the auth namespace.
    Admin,
    /// An ordinary token and its normalized record.
    Tenant {
        /// The bearer token, used as the key for usage accounting.
        token: Zeroizing<String>,
        /// The token's permissions at resolve time.
        record: PermissionRecord,
    },
}

impl std::fmt::Debug for Grant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Admin => f.write_str("Admin"),
            Self::Tenant { record, .. } => f
                .debug_struct("Tenant")
                .field("token", &"<redacted>")
                .field("record", record)
                .finish(),
        }
    }
}

impl Grant {
    /// Creates a tenant grant.
    #[must_use]
    pub fn tenant(token: &str, record: PermissionRecord) -> Self {
        Self::Tenant { token: Zeroizing::new(token.to_owned()), record }
    }

    /// Returns `true` when writes and deletes must be refused.
    #[must_use]
    pub fn read_only(&self) -> bool {
        match self {
            Self::Admin => false,
            Self::Tenant { record, .. } => record.read_only,
        }
    }

    /// Rate-limit policy for this grant. The super-token is unlimited.
    #[must_use]
    pub fn rate_policy(&self) -> RateLimitPolicy {
        match self {
            Self::Admin => RateLimitPolicy::Unlimited,
            Self::Tenant { record, .. } => record.rate_policy(),
        }
    }

    /// Bytes this grant may still store. The super-token has no quota.
    #[must_use]
    pub fn remaining_quota(&self) -> u64 {
        match self {
            Self::Admin => u64::MAX,
            Self::Tenant { record, .. } => record.remaining_quota(),
        }
    }

    /// The token whose usage is charged, if any.
    #[must_use]
    pub fn accounting_token(&self) -> Option<&str> {
        match self {
            Self::Admin => None,
            Self::Tenant { token, .. } => Some(token.as_str()),
        }
    }
}
