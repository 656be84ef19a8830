//! Transaction trait for atomic storage operations.
//!
//! # Transaction Semantics
//!
//! - **Atomicity**: all buffered operations commit together or not at all
//! - **Read-your-writes**: reads within a transaction see pending writes
//! - **Buffering**: writes are held in memory until [`Transaction::commit`]
//!
//! # Example
//!
//! ```
//! use tenantkv_storage::{MemoryBackend, StorageBackend};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let backend = MemoryBackend::new();
//!
//! let mut txn = backend.transaction().await.unwrap();
//! txn.set(b"a".to_vec(), b"1".to_vec());
//! txn.delete(b"b".to_vec());
//! txn.commit().await.unwrap();
//!
//! assert_eq!(&backend.get(b"a").await.unwrap().unwrap()[..], b"1");
//! # });
//! ```

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StorageResult;

/// A buffered, atomically committed unit of work against one backend.
#[async_trait]
pub trait Transaction: Send {
    /// Reads a key, observing this transaction's own pending writes first.
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>>;

    /// Buffers a write.
    fn set(&mut self, key: Vec<u8>, value: Vec<u8>);

    /// Buffers a delete.
    fn delete(&mut self, key: Vec<u8>);

    /// Buffers a compare-and-set, verified at commit time.
    ///
    /// `expected == None` means the key must be absent.
    fn compare_and_set(&mut self, key: Vec<u8>, expected: Option<Vec<u8>>, new_value: Vec<u8>);

    /// Buffers a delete that only applies if `key` still holds `expected`.
    ///
    /// A missing key fails the precondition like any other mismatch.
    fn compare_and_delete(&mut self, key: Vec<u8>, expected: Vec<u8>);

    /// Applies every buffered operation atomically.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Conflict`](crate::StorageError::Conflict) if a
    /// compare-and-set or compare-and-delete precondition fails; nothing is
    /// applied in that case.
    async fn commit(self: Box<Self>) -> StorageResult<()>;
}

/// A compare-and-set operation to be verified at commit time.
///
/// `new_value == None` removes the key once the precondition holds.
#[derive(Debug, Clone)]
pub(crate) struct CasOperation {
    pub(crate) key: Vec<u8>,
    pub(crate) expected: Option<Vec<u8>>,
    pub(crate) new_value: Option<Vec<u8>>,
}

impl CasOperation {
    pub(crate) fn set(key: Vec<u8>, expected: Option<Vec<u8>>, new_value: Vec<u8>) -> Self {
        Self { key, expected, new_value: Some(new_value) }
    }

    pub(crate) fn delete(key: Vec<u8>, expected: Vec<u8>) -> Self {
        Self { key, expected: Some(expected), new_value: None }
    }

    /// Returns `true` when `current` satisfies the expected precondition.
    pub(crate) fn matches(&self, current: Option<&[u8]>) -> bool {
        match (&self.expected, current) {
            (None, None) => true,
            (Some(expected), Some(current)) => expected.as_slice() == current,
            _ => false,
        }
    }
}
