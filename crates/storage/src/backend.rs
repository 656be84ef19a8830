//! Storage backend trait definition.
//!
//! [`StorageBackend`] is the seam between the gateway and the ordered
//! key-value engine that actually persists a namespace. The gateway only
//! ever talks to this trait; [`MemoryBackend`](crate::MemoryBackend) and
//! [`RedbBackend`](crate::RedbBackend) are the two engines shipped here.
//!
//! # Design
//!
//! - **Keys and values are bytes**: the value encoding (type tags, JSON) lives above this layer
//! - **Async by default**: engines that block run their work off the runtime
//! - **Ordered**: [`get_range`](StorageBackend::get_range) yields keys in lexicographic order
//! - **Transactional**: multi-key changes go through [`Transaction`]
//!
//! # Implementing a Backend
//!
//! 1. Implement the [`StorageBackend`] trait
//! 2. Implement a corresponding [`Transaction`] type
//! 3. Map engine errors to [`StorageError`](crate::StorageError)

use std::ops::RangeBounds;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{error::StorageResult, transaction::Transaction, types::KeyValue};

/// An ordered, transactional key-value store for a single namespace.
///
/// Implementations must be cheap to clone or be shared behind an `Arc`;
/// the gateway hands the same instance to every concurrent request.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Reads a single key. Absent keys yield `Ok(None)`.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>>;

    /// Writes a single key, replacing any previous value.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()>;

    /// Atomically replaces `key` only if its current value equals `expected`.
    ///
    /// `expected == None` means "only if absent".
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Conflict`](crate::StorageError::Conflict) when
    /// the precondition does not hold.
    #[must_use = "compare-and-set may fail with a conflict and errors must be handled"]
    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
    ) -> StorageResult<()>;

    /// Deletes a key. Deleting an absent key is not an error.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn delete(&self, key: &[u8]) -> StorageResult<()>;

    /// Returns every entry whose key falls in `range`, ordered by key.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get_range<R>(&self, range: R) -> StorageResult<Vec<KeyValue>>
    where
        R: RangeBounds<Vec<u8>> + Send;

    /// Starts a buffered transaction.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn transaction(&self) -> StorageResult<Box<dyn Transaction>>;

    /// Verifies the engine can serve requests.
    #[must_use = "health check results indicate backend availability and must be inspected"]
    async fn health_check(&self) -> StorageResult<()>;
}
