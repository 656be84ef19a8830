//! Runtime-selected storage engine.
//!
//! [`StorageBackend`] has a generic range method, so it cannot be used as a
//! trait object. [`Backend`] wraps every shipped engine instead, letting the
//! gateway pick one from configuration while keeping static dispatch.
//!
//! ```
//! use tenantkv_storage::{Backend, StorageBackend};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = Backend::memory();
//! backend.set(b"key".to_vec(), b"value".to_vec()).await?;
//! assert!(backend.get(b"key").await?.is_some());
//! # Ok(())
//! # }
//! ```

use std::ops::RangeBounds;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    MemoryBackend, RedbBackend, StorageBackend, StorageResult, Transaction, types::KeyValue,
};

/// Any storage engine the gateway can run on.
#[derive(Clone)]
pub enum Backend {
    /// In-memory engine for tests and ephemeral deployments.
    Memory(MemoryBackend),
    /// Durable single-file engine.
    Redb(RedbBackend),
}

impl Backend {
    /// Creates a fresh in-memory backend.
    #[must_use]
    pub fn memory() -> Self {
        Self::Memory(MemoryBackend::new())
    }

    /// Returns true if this is a memory backend.
    #[must_use]
    pub fn is_memory(&self) -> bool {
        matches!(self, Self::Memory(_))
    }
}

impl From<MemoryBackend> for Backend {
    fn from(backend: MemoryBackend) -> Self {
        Self::Memory(backend)
    }
}

impl From<RedbBackend> for Backend {
    fn from(backend: RedbBackend) -> Self {
        Self::Redb(backend)
    }
}

#[async_trait]
impl StorageBackend for Backend {
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        match self {
            Self::Memory(b) => b.get(key).await,
            Self::Redb(b) => b.get(key).await,
        }
    }

    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        match self {
            Self::Memory(b) => b.set(key, value).await,
            Self::Redb(b) => b.set(key, value).await,
        }
    }

    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
    ) -> StorageResult<()> {
        match self {
            Self::Memory(b) => b.compare_and_set(key, expected, new_value).await,
            Self::Redb(b) => b.compare_and_set(key, expected, new_value).await,
        }
    }

    async fn delete(&self, key: &[u8]) -> StorageResult<()> {
        match self {
            Self::Memory(b) => b.delete(key).await,
            Self::Redb(b) => b.delete(key).await,
        }
    }

    async fn get_range<R>(&self, range: R) -> StorageResult<Vec<KeyValue>>
    where
        R: RangeBounds<Vec<u8>> + Send,
    {
        match self {
            Self::Memory(b) => b.get_range(range).await,
            Self::Redb(b) => b.get_range(range).await,
        }
    }

    async fn transaction(&self) -> StorageResult<Box<dyn Transaction>> {
        match self {
            Self::Memory(b) => b.transaction().await,
            Self::Redb(b) => b.transaction().await,
        }
    }

    async fn health_check(&self) -> StorageResult<()> {
        match self {
            Self::Memory(b) => b.health_check().await,
            Self::Redb(b) => b.health_check().await,
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory(_) => write!(f, "Backend::Memory"),
            Self::Redb(b) => write!(f, "Backend::Redb({})", b.path().display()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_variant_delegates() {
        let backend = Backend::memory();
        assert!(backend.is_memory());

        backend.set(b"k".to_vec(), b"v".to_vec()).await.unwrap();
        assert_eq!(backend.get(b"k").await.unwrap(), Some(Bytes::from("v")));
        backend.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn redb_variant_delegates() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::from(RedbBackend::open(dir.path().join("ns.db")).unwrap());
        assert!(!backend.is_memory());

        backend.set(b"b".to_vec(), b"2".to_vec()).await.unwrap();
        backend.set(b"a".to_vec(), b"1".to_vec()).await.unwrap();
        let keys: Vec<_> = backend.get_range(..).await.unwrap().into_iter().map(|kv| kv.key).collect();
        assert_eq!(keys, vec![Bytes::from("a"), Bytes::from("b")]);
        assert!(format!("{backend:?}").contains("ns.db"));
    }
}
