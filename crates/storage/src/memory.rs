//! In-memory storage backend implementation.
//!
//! [`MemoryBackend`] keeps one namespace in a [`BTreeMap`] behind a
//! [`parking_lot::RwLock`]. It backs the test suites and `engine = "memory"`
//! deployments where durability is not wanted.
//!
//! # Example
//!
//! ```
//! use tenantkv_storage::{MemoryBackend, StorageBackend};
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = MemoryBackend::new();
//!
//!     backend.set(b"greeting".to_vec(), b"hello".to_vec()).await.unwrap();
//!     let value = backend.get(b"greeting").await.unwrap();
//!
//!     assert_eq!(value.unwrap().as_ref(), b"hello");
//! }
//! ```
//!
//! # Performance Characteristics
//!
//! | Operation | Complexity |
//! |-----------|------------|
//! | get | O(log n) |
//! | set | O(log n) |
//! | delete | O(log n) |
//! | get_range | O(log n + k) where k is result size |

use std::{
    collections::BTreeMap,
    ops::{Bound, RangeBounds},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::{
    backend::StorageBackend,
    error::{StorageError, StorageResult},
    transaction::{CasOperation, Transaction},
    types::KeyValue,
};

/// In-memory storage backend using [`BTreeMap`].
///
/// # Cloning
///
/// `MemoryBackend` is cheaply cloneable via [`Arc`]. All clones share the
/// same underlying data.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Bytes>>>,
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend").field("len", &self.len()).finish()
    }
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns `true` when no keys are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    #[tracing::instrument(skip_all, fields(key_len = key.len()))]
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        Ok(self.data.read().get(key).cloned())
    }

    #[tracing::instrument(skip_all, fields(key_len = key.len(), value_len = value.len()))]
    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        self.data.write().insert(key, Bytes::from(value));
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(key_len = key.len()))]
    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
    ) -> StorageResult<()> {
        let mut data = self.data.write();

        let matches = match (expected, data.get(key)) {
            (None, None) => true,
            (Some(exp), Some(cur)) => exp == &cur[..],
            _ => false,
        };
        if !matches {
            return Err(StorageError::Conflict);
        }

        data.insert(key.to_vec(), Bytes::from(new_value));
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(key_len = key.len()))]
    async fn delete(&self, key: &[u8]) -> StorageResult<()> {
        self.data.write().remove(key);
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    async fn get_range<R>(&self, range: R) -> StorageResult<Vec<KeyValue>>
    where
        R: RangeBounds<Vec<u8>> + Send,
    {
        let start = as_slice_bound(range.start_bound());
        let end = as_slice_bound(range.end_bound());

        // BTreeMap::range panics on inverted bounds.
        if is_empty_range(start, end) {
            return Ok(Vec::new());
        }

        let data = self.data.read();
        Ok(data
            .range::<[u8], _>((start, end))
            .map(|(k, v)| KeyValue::new(Bytes::copy_from_slice(k), v.clone()))
            .collect())
    }

    #[tracing::instrument(skip_all)]
    async fn transaction(&self) -> StorageResult<Box<dyn Transaction>> {
        Ok(Box::new(MemoryTransaction::new(self.clone())))
    }

    async fn health_check(&self) -> StorageResult<()> {
        // Acquiring the read lock proves the map is not deadlocked.
        let _unused = self.data.read();
        Ok(())
    }
}

fn as_slice_bound(bound: Bound<&Vec<u8>>) -> Bound<&[u8]> {
    match bound {
        Bound::Included(b) => Bound::Included(b.as_slice()),
        Bound::Excluded(b) => Bound::Excluded(b.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

pub(crate) fn is_empty_range(start: Bound<&[u8]>, end: Bound<&[u8]>) -> bool {
    match (start, end) {
        (Bound::Included(s), Bound::Included(e)) => s > e,
        (Bound::Included(s) | Bound::Excluded(s), Bound::Included(e) | Bound::Excluded(e)) => {
            s >= e
        },
        _ => false,
    }
}

/// In-memory transaction implementation.
///
/// Buffers writes and deletes until commit, providing read-your-writes
/// semantics within the transaction.
struct MemoryTransaction {
    backend: MemoryBackend,
    pending_writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    pending_cas: Vec<CasOperation>,
}

impl MemoryTransaction {
    fn new(backend: MemoryBackend) -> Self {
        Self { backend, pending_writes: BTreeMap::new(), pending_cas: Vec::new() }
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        if let Some(value) = self.pending_writes.get(key) {
            return Ok(value.as_ref().map(|v| Bytes::copy_from_slice(v)));
        }
        self.backend.get(key).await
    }

    fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.pending_writes.insert(key, Some(value));
    }

    fn delete(&mut self, key: Vec<u8>) {
        self.pending_writes.insert(key, None);
    }

    fn compare_and_set(&mut self, key: Vec<u8>, expected: Option<Vec<u8>>, new_value: Vec<u8>) {
        self.pending_cas.push(CasOperation::set(key, expected, new_value));
    }

    fn compare_and_delete(&mut self, key: Vec<u8>, expected: Vec<u8>) {
        self.pending_cas.push(CasOperation::delete(key, expected));
    }

    async fn commit(self: Box<Self>) -> StorageResult<()> {
        let mut data = self.backend.data.write();

        for cas in &self.pending_cas {
            if !cas.matches(data.get(&cas.key).map(|b| &b[..])) {
                return Err(StorageError::Conflict);
            }
        }

        for cas in self.pending_cas {
            match cas.new_value {
                Some(v) => {
                    data.insert(cas.key, Bytes::from(v));
                },
                None => {
                    data.remove(&cas.key);
                },
            }
        }

        for (key, value) in self.pending_writes {
            match value {
                Some(v) => {
                    data.insert(key, Bytes::from(v));
                },
                None => {
                    data.remove(&key);
                },
            }
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inverted_range_is_empty() {
        let backend = MemoryBackend::new();
        backend.set(b"a".to_vec(), b"1".to_vec()).await.unwrap();

        let range = backend.get_range(b"z".to_vec()..b"a".to_vec()).await.unwrap();
        assert!(range.is_empty());
    }

    #[tokio::test]
    async fn test_transaction_cas_conflict_applies_nothing() {
        let backend = MemoryBackend::new();
        backend.set(b"counter".to_vec(), b"1".to_vec()).await.unwrap();

        let mut txn = backend.transaction().await.unwrap();
        txn.compare_and_set(b"counter".to_vec(), Some(b"0".to_vec()), b"2".to_vec());
        txn.set(b"other".to_vec(), b"x".to_vec());

        crate::assert_conflict!(txn.commit().await);
        assert_eq!(backend.get(b"counter").await.unwrap(), Some(Bytes::from("1")));
        assert_eq!(backend.get(b"other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn len_counts_committed_keys_only() {
        let backend = MemoryBackend::new();
        assert!(backend.is_empty());

        let mut txn = backend.transaction().await.unwrap();
        txn.set(b"a".to_vec(), b"1".to_vec());
        txn.set(b"b".to_vec(), b"2".to_vec());
        assert_eq!(backend.len(), 0);

        txn.commit().await.unwrap();
        assert_eq!(backend.len(), 2);

        backend.delete(b"a").await.unwrap();
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn test_clone_shares_data() {
        let backend1 = MemoryBackend::new();
        let backend2 = backend1.clone();

        backend1.set(b"key".to_vec(), b"value".to_vec()).await.unwrap();

        let value = backend2.get(b"key").await.unwrap();
        assert_eq!(value, Some(Bytes::from("value")));
        assert_eq!(backend2.len(), 1);
    }

    mod proptests {
        use proptest::prelude::*;

        use super::*;

        fn arb_sorted_keys() -> impl Strategy<Value = Vec<Vec<u8>>> {
            proptest::collection::vec(proptest::collection::vec(any::<u8>(), 1..16), 0..30)
                .prop_map(|mut keys| {
                    keys.sort();
                    keys.dedup();
                    keys
                })
        }

        proptest! {
            /// A full-range scan returns every stored key exactly once, sorted.
            #[test]
            fn full_scan_is_sorted_and_complete(keys in arb_sorted_keys()) {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("runtime");

                rt.block_on(async {
                    let backend = MemoryBackend::new();
                    // Insert in reverse to make sure ordering comes from the map.
                    for key in keys.iter().rev() {
                        backend.set(key.clone(), b"v".to_vec()).await.unwrap();
                    }

                    let results = backend.get_range(..).await.unwrap();
                    let scanned: Vec<Vec<u8>> = results.iter().map(|kv| kv.key.to_vec()).collect();
                    prop_assert_eq!(scanned, keys);
                    Ok(())
                })?;
            }
        }
    }
}
