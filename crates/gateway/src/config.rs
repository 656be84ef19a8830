//! Gateway configuration.
//!
//! [`GatewayConfig`] is read from an optional TOML file; every field has a
//! default, so an empty file (or no file) yields a working local setup:
//!
//! ```toml
//! listen = "0.0.0.0:8080"
//! data_dir = "dbs"
//! blob_dir = "dbs/blobs"
//! default_rate_limit = 10
//! rate_window = "1m"
//! default_quota = 1073741824
//! engine = "redb"
//! ```

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    permission::DEFAULT_QUOTA_BYTES,
    rate_limit::RateLimitConfig,
};

/// Storage engine backing every namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// One redb file per namespace under `data_dir`.
    #[default]
    Redb,
    /// In-memory namespaces, lost on exit.
    Memory,
}

impl std::str::FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "redb" => Ok(Self::Redb),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown engine '{other}' (expected 'redb' or 'memory')")),
        }
    }
}

/// Configuration for a [`Gateway`](crate::Gateway).
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use tenantkv_gateway::{EngineKind, GatewayConfig};
///
/// let config = GatewayConfig::builder()
///     .engine(EngineKind::Memory)
///     .default_rate_limit(100)
///     .rate_window(Duration::from_secs(10))
///     .build();
///
/// assert!(config.validate().is_ok());
/// assert_eq!(config.blob_dir, std::path::PathBuf::from("dbs/blobs"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
#[serde(deny_unknown_fields, default)]
pub struct GatewayConfig {
    /// Address the HTTP server binds.
    #[builder(default = default_listen())]
    pub listen: SocketAddr,

    /// Directory holding one database file per namespace.
    #[builder(default = PathBuf::from("dbs"), into)]
    pub data_dir: PathBuf,

    /// Directory holding offloaded values.
    #[builder(default = PathBuf::from("dbs/blobs"), into)]
    pub blob_dir: PathBuf,

    /// Requests per window for tokens without their own limit.
    #[builder(default = 10)]
    pub default_rate_limit: u64,

    /// Rate limit window length.
    #[serde(with = "humantime_serde")]
    #[builder(default = Duration::from_secs(60))]
    pub rate_window: Duration,

    /// Quota for permission records that don't set one.
    #[builder(default = DEFAULT_QUOTA_BYTES)]
    pub default_quota: u64,

    /// Storage engine.
    #[builder(default)]
    pub engine: EngineKind,

    /// Super-token for the auth namespace. Generated at startup when unset.
    #[serde(skip_serializing)]
    #[builder(into)]
    pub admin_token: Option<String>,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl GatewayConfig {
    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for invalid TOML or unknown keys, and
    /// any validation error from [`validate`](Self::validate).
    pub fn from_toml(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the file cannot be read, otherwise
    /// as [`from_toml`](Self::from_toml).
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let source = std::fs::read_to_string(&path)
            .map_err(|source| ConfigError::Read { path: path.clone(), source })?;
        Self::from_toml(&source)
    }

    /// Checks that limits are usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BelowMinimum`] for a zero rate limit, window
    /// or quota.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_rate_limit == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "default_rate_limit",
                min: "1".into(),
                value: "0".into(),
            });
        }
        if self.rate_window.is_zero() {
            return Err(ConfigError::BelowMinimum {
                field: "rate_window",
                min: "1ms".into(),
                value: format!("{:?}", self.rate_window),
            });
        }
        if self.default_quota == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "default_quota",
                min: "1".into(),
                value: "0".into(),
            });
        }
        Ok(())
    }

    /// Rate limiter settings derived from this configuration.
    #[must_use]
    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig::new(self.default_rate_limit, self.rate_window)
    }
}
