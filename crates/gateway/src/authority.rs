//! Token resolution and per-token usage accounting.
//!
//! The [`TokenAuthority`] owns the reserved `auth` namespace. Each key in
//! that namespace is a bearer token and each value is a tagged JSON
//! [`StoredPermissions`] document. The authority also holds the process
//! super-token, which is only ever valid for the auth namespace itself.
//!
//! Usage accounting is eager: every write and delete adjusts `used_bytes`
//! on the token's record with a compare-and-set loop, so concurrent
//! requests on one token never lose an update.

use std::{path::PathBuf, sync::Arc};

use bytes::Bytes;
use rand::{Rng, distributions::Alphanumeric};
use tenantkv_storage::{StorageBackend, StorageError};
use zeroize::Zeroizing;

use crate::{
    entry::StoredEntry,
    error::{GatewayError, GatewayResult},
    permission::{AUTH_NAMESPACE, DEFAULT_QUOTA_BYTES, Grant, PermissionRecord, StoredPermissions},
};

/// Length of each of the three token segments.
pub const TOKEN_SEGMENT_LEN: usize = 30;

/// Attempts made by a usage update before giving up on contention.
const MAX_USAGE_ATTEMPTS: usize = 16;

/// Generates a fresh bearer token.
///
/// Tokens are three 30-character alphanumeric segments joined by `-`.
#[must_use]
pub fn generate_token() -> String {
    let mut rng = rand::thread_rng();
    let mut segment = || -> String {
        (&mut rng).sample_iter(&Alphanumeric).take(TOKEN_SEGMENT_LEN).map(char::from).collect()
    };
    let (first, second, third) = (segment(), segment(), segment());
    format!("{first}-{second}-{third}")
}

/// Resolves bearer tokens against the auth namespace.
///
/// Cheap to clone; clones share the backend and the super-token.
#[derive(Clone)]
pub struct TokenAuthority<B> {
    backend: B,
    admin_token: Arc<Zeroizing<String>>,
    default_quota: u64,
}

impl<B> std::fmt::Debug for TokenAuthority<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAuthority")
            .field("admin_token", &"<redacted>")
            .field("default_quota", &self.default_quota)
            .finish_non_exhaustive()
    }
}

impl<B: StorageBackend> TokenAuthority<B> {
    /// Creates an authority over an opened auth namespace.
    #[must_use]
    pub fn new(backend: B, admin_token: impl Into<String>) -> Self {
        Self {
            backend,
            admin_token: Arc::new(Zeroizing::new(admin_token.into())),
            default_quota: DEFAULT_QUOTA_BYTES,
        }
    }

    /// Overrides the quota applied to records that don't set one.
    #[must_use]
    pub fn with_default_quota(mut self, default_quota: u64) -> Self {
        self.default_quota = default_quota;
        self
    }

    /// The auth namespace backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The process super-token.
    pub fn admin_token(&self) -> &str {
        &self.admin_token
    }

    /// Resolves `token` for access to `namespace`.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::Forbidden`] if the token is valid but not scoped to
    ///   `namespace` (the super-token is scoped to `auth` only)
    /// - [`GatewayError::InvalidToken`] if the token has no record
    /// - [`GatewayError::Storage`] if the record cannot be read or decoded
    #[tracing::instrument(skip(self, token), fields(namespace = %namespace))]
    pub async fn resolve(&self, token: &str, namespace: &str) -> GatewayResult<Grant> {
        if token == self.admin_token.as_str() {
            return if namespace == AUTH_NAMESPACE {
                Ok(Grant::Admin)
            } else {
                Err(GatewayError::forbidden(namespace))
            };
        }

        let record = self.lookup(token).await?;
        if !record.allows(namespace) {
            return Err(GatewayError::forbidden(namespace));
        }
        Ok(Grant::tenant(token, record))
    }

    /// Reads and normalizes the record stored for `token`.
    ///
    /// When the stored bytes differ from the normalized encoding the record
    /// is written back. The write-back is best-effort: losing a race to a
    /// concurrent update is fine, and any failure is only logged.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidToken`] if no record exists and
    /// [`GatewayError::Storage`] if it cannot be read or decoded.
    pub async fn lookup(&self, token: &str) -> GatewayResult<PermissionRecord> {
        let raw = self.backend.get(token.as_bytes()).await?.ok_or(GatewayError::InvalidToken)?;
        let (record, blob) = self.decode_record(&raw).await?;

        let normalized = encode_record(&record)?;
        if normalized != raw[..] {
            match self.backend.compare_and_set(token.as_bytes(), Some(&raw), normalized).await {
                Ok(()) => {
                    tracing::debug!("normalized stored permission record");
                    if let Some(path) = blob {
                        remove_record_blob(path).await;
                    }
                },
                Err(e) => tracing::debug!(error = %e, "permission record write-back skipped"),
            }
        }

        Ok(record)
    }

    /// Stores `record` for `token`, replacing any existing record.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Storage`] if the write fails.
    pub async fn store(&self, token: &str, record: &PermissionRecord) -> GatewayResult<()> {
        self.backend.set(token.as_bytes().to_vec(), encode_record(record)?).await?;
        Ok(())
    }

    /// Generates a new token, stores `record` for it and returns the token.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Storage`] if the write fails.
    pub async fn issue(&self, record: &PermissionRecord) -> GatewayResult<Zeroizing<String>> {
        let token = Zeroizing::new(generate_token());
        self.store(&token, record).await?;
        Ok(token)
    }

    /// Charges `bytes` to the token's usage.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::QuotaExceeded`] if the charge would take the
    /// token past its quota. Nothing is charged in that case.
    #[tracing::instrument(skip(self, token))]
    pub async fn reserve(&self, token: &str, bytes: u64) -> GatewayResult<()> {
        if bytes == 0 {
            return Ok(());
        }
        self.update_usage(token, |record| {
            let remaining = record.remaining_quota();
            if bytes > remaining {
                return Err(GatewayError::QuotaExceeded { requested: bytes, remaining });
            }
            record.used_bytes += bytes;
            Ok(())
        })
        .await
    }

    /// Credits `bytes` back to the token's usage, saturating at zero.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Storage`] if the record cannot be updated.
    #[tracing::instrument(skip(self, token))]
    pub async fn release(&self, token: &str, bytes: u64) -> GatewayResult<()> {
        if bytes == 0 {
            return Ok(());
        }
        self.update_usage(token, |record| {
            record.used_bytes = record.used_bytes.saturating_sub(bytes);
            Ok(())
        })
        .await
    }

    async fn update_usage<F>(&self, token: &str, apply: F) -> GatewayResult<()>
    where
        F: Fn(&mut PermissionRecord) -> GatewayResult<()>,
    {
        for _ in 0..MAX_USAGE_ATTEMPTS {
            let raw =
                self.backend.get(token.as_bytes()).await?.ok_or(GatewayError::InvalidToken)?;
            let (mut record, blob) = self.decode_record(&raw).await?;
            apply(&mut record)?;

            let encoded = encode_record(&record)?;
            match self.backend.compare_and_set(token.as_bytes(), Some(&raw), encoded).await {
                Ok(()) => {
                    if let Some(path) = blob {
                        remove_record_blob(path).await;
                    }
                    return Ok(());
                },
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e.into()),
            }
        }

        tracing::warn!(attempts = MAX_USAGE_ATTEMPTS, "usage update gave up under contention");
        Err(StorageError::conflict().into())
    }

    async fn decode_record(
        &self,
        raw: &Bytes,
    ) -> GatewayResult<(PermissionRecord, Option<PathBuf>)> {
        let (json, blob) = match StoredEntry::decode(raw.clone())? {
            StoredEntry::Inline(payload) => (payload, None),
            // Large records written through the gateway land in the blob area.
            StoredEntry::Blob(path) => {
                let bytes = tokio::fs::read(&path).await.map_err(|e| {
                    StorageError::io(format!("reading permission blob {}", path.display()), e)
                })?;
                (Bytes::from(bytes), Some(path))
            },
        };

        let stored: StoredPermissions = serde_json::from_slice(&json).map_err(|e| {
            StorageError::serialization_with_source("permission record is not valid JSON", e)
        })?;
        Ok((stored.normalize(self.default_quota), blob))
    }
}

fn encode_record(record: &PermissionRecord) -> GatewayResult<Vec<u8>> {
    let json = serde_json::to_vec(record).map_err(|e| {
        StorageError::serialization_with_source("encoding permission record", e)
    })?;
    Ok(StoredEntry::Inline(Bytes::from(json)).encode())
}

async fn remove_record_blob(path: PathBuf) {
    if let Err(e) = tokio::fs::remove_file(&path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove superseded record blob");
    }
}
