//! Lazy, shared per-namespace backend handles.
//!
//! The registry maps a namespace name to a slot holding a
//! [`tokio::sync::OnceCell`]. Looking up an opened namespace only takes the
//! read lock. A first access takes the write lock just long enough to insert
//! an empty slot; the open itself happens inside the slot's once-cell with
//! no map lock held, so racing requests wait on the same open and exactly
//! one backend is created per name.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use parking_lot::RwLock;
use tenantkv_storage::{Backend, RedbBackend, StorageError, StorageResult};
use tokio::sync::OnceCell;

use crate::error::GatewayResult;

/// Creates the backend for a namespace on first access.
#[async_trait]
pub trait NamespaceOpener: Send + Sync {
    /// Opens (or creates) the storage for `name`.
    async fn open(&self, name: &str) -> StorageResult<Backend>;
}

/// Opens a fresh in-memory backend per namespace.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryOpener;

#[async_trait]
impl NamespaceOpener for MemoryOpener {
    async fn open(&self, _name: &str) -> StorageResult<Backend> {
        Ok(Backend::memory())
    }
}

/// Opens `<data_dir>/<name>.db` with redb.
#[derive(Debug, Clone)]
pub struct RedbOpener {
    data_dir: PathBuf,
}

impl RedbOpener {
    /// Creates an opener rooted at `data_dir`.
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into() }
    }

    /// Path of the database file for `name`.
    #[must_use]
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{name}.db"))
    }
}

#[async_trait]
impl NamespaceOpener for RedbOpener {
    async fn open(&self, name: &str) -> StorageResult<Backend> {
        let path = self.path_for(name);
        tokio::task::spawn_blocking(move || RedbBackend::open(path))
            .await
            .map_err(|e| StorageError::internal_with_source("namespace open task failed", e))?
            .map(Backend::Redb)
    }
}

type Slot = Arc<OnceCell<Backend>>;

/// Process-wide cache of opened namespaces.
pub struct NamespaceRegistry {
    opener: Arc<dyn NamespaceOpener>,
    slots: RwLock<HashMap<String, Slot>>,
}

impl std::fmt::Debug for NamespaceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceRegistry").field("open", &self.len()).finish_non_exhaustive()
    }
}

impl NamespaceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(opener: Arc<dyn NamespaceOpener>) -> Self {
        Self { opener, slots: RwLock::new(HashMap::new()) }
    }

    /// Returns the handle for `name`, opening it on first access.
    ///
    /// A failed open leaves the slot empty; the next request retries.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Storage`](crate::GatewayError::Storage) if
    /// the namespace cannot be opened.
    pub async fn get(&self, name: &str) -> GatewayResult<Backend> {
        let slot = self.slot(name);
        let backend = slot
            .get_or_try_init(|| async {
                match self.opener.open(name).await {
                    Ok(backend) => {
                        tracing::info!(namespace = %name, "opened namespace");
                        Ok(backend)
                    },
                    Err(e) => {
                        tracing::warn!(namespace = %name, error = %e, "failed to open namespace");
                        Err(e)
                    },
                }
            })
            .await?;
        Ok(backend.clone())
    }

    fn slot(&self, name: &str) -> Slot {
        if let Some(slot) = self.slots.read().get(name) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write();
        Arc::clone(slots.entry(name.to_owned()).or_default())
    }

    /// Number of namespaces currently open.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.read().values().filter(|slot| slot.initialized()).count()
    }

    /// Returns `true` if no namespace has been opened.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every handle, closing the underlying engines once in-flight
    /// requests release their clones. Returns how many were open.
    pub fn shutdown(&self) -> usize {
        let slots = std::mem::take(&mut *self.slots.write());
        let closed = slots.values().filter(|slot| slot.initialized()).count();
        tracing::info!(namespaces = closed, "closed namespace handles");
        closed
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tenantkv_storage::StorageBackend;

    use super::*;

    /// Counts opens and fails the first `fail_first` of them.
    #[derive(Default)]
    struct CountingOpener {
        opens: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl NamespaceOpener for CountingOpener {
        async fn open(&self, _name: &str) -> StorageResult<Backend> {
            let n = self.opens.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            if n < self.fail_first {
                return Err(StorageError::internal("engine unavailable"));
            }
            Ok(Backend::memory())
        }
    }

    #[tokio::test]
    async fn repeated_gets_share_one_handle() {
        let registry = NamespaceRegistry::new(Arc::new(MemoryOpener));

        let first = registry.get("shop").await.unwrap();
        first.set(b"k".to_vec(), b"v".to_vec()).await.unwrap();
        let second = registry.get("shop").await.unwrap();

        assert!(second.get(b"k").await.unwrap().is_some());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let registry = NamespaceRegistry::new(Arc::new(MemoryOpener));
        registry.get("a").await.unwrap().set(b"k".to_vec(), b"v".to_vec()).await.unwrap();
        assert!(registry.get("b").await.unwrap().get(b"k").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_access_opens_once() {
        let opener = Arc::new(CountingOpener::default());
        let registry = Arc::new(NamespaceRegistry::new(opener.clone()));

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.get("shop").await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(opener.opens.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn failed_open_is_retried_on_next_request() {
        let opener = Arc::new(CountingOpener { fail_first: 1, ..Default::default() });
        let registry = NamespaceRegistry::new(opener.clone());

        assert!(registry.get("shop").await.is_err());
        assert!(registry.is_empty());
        registry.get("shop").await.unwrap();

        assert_eq!(opener.opens.load(Ordering::SeqCst), 2);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn redb_opener_creates_file_per_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let opener = RedbOpener::new(dir.path());
        let registry = NamespaceRegistry::new(Arc::new(opener.clone()));

        registry.get("shop").await.unwrap();
        assert!(opener.path_for("shop").exists());
        assert!(!opener.path_for("other").exists());
    }

    #[tokio::test]
    async fn shutdown_drains_handles() {
        let registry = NamespaceRegistry::new(Arc::new(MemoryOpener));
        registry.get("a").await.unwrap();
        registry.get("b").await.unwrap();

        assert_eq!(registry.shutdown(), 2);
        assert!(registry.is_empty());
    }
}
