//! Behavior every [`StorageBackend`] must share.
//!
//! Each function takes a fresh backend and panics if the contract does not
//! hold, so a new engine can be checked by calling the whole suite:
//!
//! ```ignore
//! // Requires the `testutil` feature to be enabled.
//! use tenantkv_storage::{conformance, testutil::TestEngine};
//!
//! #[tokio::test]
//! async fn compare_and_delete_semantics() {
//!     conformance::compare_and_delete_semantics(TestEngine::redb().backend()).await;
//! }
//! ```
//!
//! | Category | Contract aspect |
//! |----------|-----------------|
//! | CRUD | overwrite, delete, deleting an absent key |
//! | Range | bound kinds, degenerate and empty scans |
//! | CAS | insert-if-absent, stale expectations, conditional delete |
//! | Transaction | read-your-writes, atomic rollback, drop without commit |

use std::ops::Bound;

use bytes::Bytes;

use crate::{
    assert_conflict,
    backend::StorageBackend,
    testutil::{make_key, populate},
    types::KeyValue,
};

fn keys(entries: &[KeyValue]) -> Vec<Bytes> {
    entries.iter().map(|kv| kv.key.clone()).collect()
}

fn expected(indices: &[usize]) -> Vec<Bytes> {
    indices.iter().map(|&i| Bytes::from(make_key("k", i))).collect()
}

// ============================================================================
// CRUD
// ============================================================================

/// `set` overwrites, `delete` removes, and deleting an absent key is a no-op.
pub async fn overwrite_and_delete<B: StorageBackend>(backend: &B) {
    backend.set(b"k".to_vec(), b"one".to_vec()).await.expect("set");
    backend.set(b"k".to_vec(), b"two".to_vec()).await.expect("overwrite");
    assert_eq!(backend.get(b"k").await.expect("get"), Some(Bytes::from("two")));

    backend.delete(b"k").await.expect("delete");
    assert_eq!(backend.get(b"k").await.expect("get"), None);
    backend.delete(b"k").await.expect("deleting an absent key is not an error");
}

// ============================================================================
// Range
// ============================================================================

/// Every bound kind selects exactly the keys it names, in byte order.
pub async fn range_bounds<B: StorageBackend>(backend: &B) {
    populate(backend, "k", 5, b"v").await.expect("populate");

    let all = backend.get_range(..).await.expect("full scan");
    assert_eq!(keys(&all), expected(&[0, 1, 2, 3, 4]));

    let half_open = backend.get_range(make_key("k", 1)..make_key("k", 3)).await.expect("range");
    assert_eq!(keys(&half_open), expected(&[1, 2]));

    let inclusive = backend.get_range(make_key("k", 1)..=make_key("k", 3)).await.expect("range");
    assert_eq!(keys(&inclusive), expected(&[1, 2, 3]));

    let excluded_start = backend
        .get_range((Bound::Excluded(make_key("k", 1)), Bound::Unbounded))
        .await
        .expect("range");
    assert_eq!(keys(&excluded_start), expected(&[2, 3, 4]));

    let mut between_start = make_key("k", 1);
    between_start.push(b'a');
    let mut between_end = make_key("k", 1);
    between_end.push(b'z');
    assert!(backend.get_range(between_start..between_end).await.expect("range").is_empty());
}

/// Empty and inverted ranges scan as empty instead of failing.
pub async fn degenerate_ranges_are_empty<B: StorageBackend>(backend: &B) {
    assert!(backend.get_range(..).await.expect("scan of empty backend").is_empty());

    populate(backend, "k", 5, b"v").await.expect("populate");
    let same = backend.get_range(make_key("k", 2)..make_key("k", 2)).await.expect("range");
    assert!(same.is_empty());
    let inverted = backend.get_range(make_key("k", 3)..make_key("k", 1)).await.expect("range");
    assert!(inverted.is_empty());
}

// ============================================================================
// CAS
// ============================================================================

/// `compare_and_set` only applies when the current value matches.
pub async fn compare_and_set_semantics<B: StorageBackend>(backend: &B) {
    backend.compare_and_set(b"k", None, b"1".to_vec()).await.expect("insert if absent");
    assert_conflict!(backend.compare_and_set(b"k", None, b"x".to_vec()).await, "insert over value");
    assert_conflict!(backend.compare_and_set(b"k", Some(b"0"), b"x".to_vec()).await, "stale value");

    backend.compare_and_set(b"k", Some(b"1"), b"2".to_vec()).await.expect("matching cas");
    assert_eq!(backend.get(b"k").await.expect("get"), Some(Bytes::from("2")));
}

/// A conditional delete removes the key once and conflicts afterwards.
pub async fn compare_and_delete_semantics<B: StorageBackend>(backend: &B) {
    backend.set(b"k".to_vec(), b"v1".to_vec()).await.expect("set");

    let mut stale = backend.transaction().await.expect("txn");
    stale.compare_and_delete(b"k".to_vec(), b"v0".to_vec());
    assert_conflict!(stale.commit().await, "stale delete");
    assert_eq!(backend.get(b"k").await.expect("get"), Some(Bytes::from("v1")));

    let mut first = backend.transaction().await.expect("txn");
    first.compare_and_delete(b"k".to_vec(), b"v1".to_vec());
    let mut second = backend.transaction().await.expect("txn");
    second.compare_and_delete(b"k".to_vec(), b"v1".to_vec());

    first.commit().await.expect("first delete");
    assert_eq!(backend.get(b"k").await.expect("get"), None);
    assert_conflict!(second.commit().await, "delete of an already deleted key");
}

// ============================================================================
// Transaction
// ============================================================================

/// Buffered writes are visible to the transaction and nowhere else until
/// commit.
pub async fn transaction_reads_its_own_writes<B: StorageBackend>(backend: &B) {
    backend.set(b"gone".to_vec(), b"x".to_vec()).await.expect("set");

    let mut txn = backend.transaction().await.expect("txn");
    txn.set(b"new".to_vec(), b"1".to_vec());
    txn.delete(b"gone".to_vec());

    assert_eq!(txn.get(b"new").await.expect("get"), Some(Bytes::from("1")));
    assert_eq!(txn.get(b"gone").await.expect("get"), None);
    assert_eq!(backend.get(b"new").await.expect("get"), None, "uncommitted write leaked");

    txn.commit().await.expect("commit");
    assert_eq!(backend.get(b"new").await.expect("get"), Some(Bytes::from("1")));
    assert_eq!(backend.get(b"gone").await.expect("get"), None);
}

/// One failed precondition discards every buffered operation.
pub async fn failed_cas_rolls_back_whole_transaction<B: StorageBackend>(backend: &B) {
    backend.set(b"guard".to_vec(), b"v1".to_vec()).await.expect("set");
    backend.set(b"doomed".to_vec(), b"d".to_vec()).await.expect("set");

    let mut txn = backend.transaction().await.expect("txn");
    txn.set(b"side".to_vec(), b"effect".to_vec());
    txn.compare_and_delete(b"doomed".to_vec(), b"d".to_vec());
    txn.compare_and_set(b"guard".to_vec(), Some(b"v0".to_vec()), b"v2".to_vec());

    assert_conflict!(txn.commit().await);
    assert_eq!(backend.get(b"side").await.expect("get"), None);
    assert_eq!(backend.get(b"doomed").await.expect("get"), Some(Bytes::from("d")));
    assert_eq!(backend.get(b"guard").await.expect("get"), Some(Bytes::from("v1")));
}

/// Dropping a transaction applies nothing, and an empty one commits.
pub async fn dropped_transaction_applies_nothing<B: StorageBackend>(backend: &B) {
    {
        let mut txn = backend.transaction().await.expect("txn");
        txn.set(b"k".to_vec(), b"v".to_vec());
    }
    assert_eq!(backend.get(b"k").await.expect("get"), None);

    let empty = backend.transaction().await.expect("txn");
    empty.commit().await.expect("empty commit");
    backend.health_check().await.expect("healthy");
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::testutil::TestEngine;

    #[rstest]
    #[tokio::test]
    async fn crud(#[values(TestEngine::memory(), TestEngine::redb())] engine: TestEngine) {
        overwrite_and_delete(engine.backend()).await;
    }

    #[rstest]
    #[tokio::test]
    async fn ranges(#[values(TestEngine::memory(), TestEngine::redb())] engine: TestEngine) {
        range_bounds(engine.backend()).await;
    }

    #[rstest]
    #[tokio::test]
    async fn empty_ranges(#[values(TestEngine::memory(), TestEngine::redb())] engine: TestEngine) {
        degenerate_ranges_are_empty(engine.backend()).await;
    }

    #[rstest]
    #[tokio::test]
    async fn cas(#[values(TestEngine::memory(), TestEngine::redb())] engine: TestEngine) {
        compare_and_set_semantics(engine.backend()).await;
    }

    #[rstest]
    #[tokio::test]
    async fn conditional_delete(
        #[values(TestEngine::memory(), TestEngine::redb())] engine: TestEngine,
    ) {
        compare_and_delete_semantics(engine.backend()).await;
    }

    #[rstest]
    #[tokio::test]
    async fn transactions(#[values(TestEngine::memory(), TestEngine::redb())] engine: TestEngine) {
        transaction_reads_its_own_writes(engine.backend()).await;
    }

    #[rstest]
    #[tokio::test]
    async fn rollback(#[values(TestEngine::memory(), TestEngine::redb())] engine: TestEngine) {
        failed_cas_rolls_back_whole_transaction(engine.backend()).await;
    }

    #[rstest]
    #[tokio::test]
    async fn dropped(#[values(TestEngine::memory(), TestEngine::redb())] engine: TestEngine) {
        dropped_transaction_applies_nothing(engine.backend()).await;
    }
}
