//! Concurrent access stress tests for both storage engines.
//!
//! These tests exercise compare-and-set and buffered transactions under
//! multi-threaded contention, the pattern the gateway's usage ledger and
//! overwrite path rely on. The heavier rounds are `#[ignore]`d for CI:
//!
//! ```bash
//! cargo test -p tenantkv-storage --test concurrent_stress -- --ignored
//! ```

#![allow(clippy::expect_used, clippy::panic)]

use rstest::rstest;
use tempfile::TempDir;
use tenantkv_storage::{Backend, RedbBackend, StorageBackend, error::StorageError};
use tokio::task::JoinSet;

/// Number of concurrent tasks for most tests.
const CONCURRENCY: usize = 16;

/// Number of CAS rounds for the exactly-one-winner tests.
const CAS_ROUNDS: usize = 20;

// ---------------------------------------------------------------------------
// Helper
// ---------------------------------------------------------------------------

struct Engine {
    backend: Backend,
    _dir: Option<TempDir>,
}

fn memory() -> Engine {
    Engine { backend: Backend::memory(), _dir: None }
}

fn redb() -> Engine {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = RedbBackend::open(dir.path().join("stress.db")).expect("open redb");
    Engine { backend: backend.into(), _dir: Some(dir) }
}

/// Awaits every task, counting successes and conflicts.
async fn tally(mut set: JoinSet<Result<(), StorageError>>, label: &str) -> (usize, usize) {
    let mut successes = 0usize;
    let mut conflicts = 0usize;
    while let Some(result) = set.join_next().await {
        match result.expect("task should not panic") {
            Ok(()) => successes += 1,
            Err(StorageError::Conflict) => conflicts += 1,
            Err(e) => panic!("unexpected error in {label}: {e}"),
        }
    }
    (successes, conflicts)
}

// ---------------------------------------------------------------------------
// Test: Parallel CAS: exactly one winner per round
// ---------------------------------------------------------------------------

/// In each round the key holds a known value and every task races to CAS it.
/// Exactly one task must succeed; all others must see `Conflict`.
#[rstest]
#[case::memory(memory())]
#[case::redb(redb())]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cas_exactly_one_winner_per_round(#[case] engine: Engine) {
    let backend = engine.backend;
    let key = b"cas-key".to_vec();

    for round in 0..CAS_ROUNDS {
        let current = format!("round-{round}").into_bytes();
        backend.set(key.clone(), current.clone()).await.expect("setup set should succeed");

        let mut set = JoinSet::new();
        for task_id in 0..CONCURRENCY {
            let backend = backend.clone();
            let key = key.clone();
            let expected = current.clone();
            let new_value = format!("round-{round}-winner-{task_id}").into_bytes();
            set.spawn(async move { backend.compare_and_set(&key, Some(&expected), new_value).await });
        }

        let (successes, conflicts) = tally(set, &format!("CAS round {round}")).await;
        assert_eq!(successes, 1, "round {round}: exactly one CAS should succeed");
        assert_eq!(conflicts, CONCURRENCY - 1, "round {round}: all other CAS should conflict");
    }
}

// ---------------------------------------------------------------------------
// Test: CAS insert-if-absent: exactly one winner
// ---------------------------------------------------------------------------

#[rstest]
#[case::memory(memory())]
#[case::redb(redb())]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cas_insert_if_absent_one_winner(#[case] engine: Engine) {
    let backend = engine.backend;

    for round in 0..CAS_ROUNDS {
        let key = format!("insert-race-{round}").into_bytes();

        let mut set = JoinSet::new();
        for task_id in 0..CONCURRENCY {
            let backend = backend.clone();
            let key = key.clone();
            let value = format!("creator-{task_id}").into_bytes();
            set.spawn(async move { backend.compare_and_set(&key, None, value).await });
        }

        let (successes, conflicts) = tally(set, &format!("insert round {round}")).await;
        assert_eq!(successes, 1, "round {round}: exactly one insert should succeed");
        assert_eq!(conflicts, CONCURRENCY - 1);
    }
}

// ---------------------------------------------------------------------------
// Test: Concurrent transactions with CAS on the same key
// ---------------------------------------------------------------------------

/// Transactions buffering a CAS on one key commit concurrently. Commits are
/// serialized, so the first wins and the rest see the new value and fail.
#[rstest]
#[case::memory(memory())]
#[case::redb(redb())]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_transactions_cas_on_same_key(#[case] engine: Engine) {
    let backend = engine.backend;
    let key = b"txn-cas-key".to_vec();

    for round in 0..CAS_ROUNDS {
        let current = format!("round-{round}").into_bytes();
        backend.set(key.clone(), current.clone()).await.expect("setup should succeed");

        let mut set = JoinSet::new();
        for task_id in 0..10 {
            let backend = backend.clone();
            let key = key.clone();
            let expected = current.clone();
            set.spawn(async move {
                let mut txn = backend.transaction().await.expect("txn should start");
                txn.compare_and_set(key, Some(expected), format!("txn-{task_id}").into_bytes());
                txn.commit().await
            });
        }

        let (successes, conflicts) = tally(set, &format!("txn round {round}")).await;
        assert_eq!(successes, 1, "round {round}: exactly one transaction should succeed");
        assert_eq!(conflicts, 9);
    }
}

// ---------------------------------------------------------------------------
// Test: Read-modify-write counter with CAS retries loses no update
// ---------------------------------------------------------------------------

/// Every task increments a shared counter with a get + CAS retry loop. The
/// final value must equal the total number of increments.
#[rstest]
#[case::memory(memory())]
#[case::redb(redb())]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn cas_counter_loses_no_updates(#[case] engine: Engine) {
    const INCREMENTS: usize = 25;

    let backend = engine.backend;
    backend.set(b"counter".to_vec(), b"0".to_vec()).await.expect("seed");

    let mut set = JoinSet::new();
    for _ in 0..CONCURRENCY {
        let backend = backend.clone();
        set.spawn(async move {
            for _ in 0..INCREMENTS {
                loop {
                    let raw = backend.get(b"counter").await?.expect("counter exists");
                    let n: usize = std::str::from_utf8(&raw)
                        .expect("utf-8")
                        .parse()
                        .expect("numeric counter");
                    match backend
                        .compare_and_set(b"counter", Some(&raw), (n + 1).to_string().into_bytes())
                        .await
                    {
                        Ok(()) => break,
                        Err(StorageError::Conflict) => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
            Ok::<(), StorageError>(())
        });
    }

    let (successes, _) = tally(set, "counter").await;
    assert_eq!(successes, CONCURRENCY);

    let raw = backend.get(b"counter").await.expect("get").expect("counter exists");
    assert_eq!(raw, (CONCURRENCY * INCREMENTS).to_string().into_bytes());
}

// ---------------------------------------------------------------------------
// Test: Range scans during writes stay sorted
// ---------------------------------------------------------------------------

#[rstest]
#[case::memory(memory())]
#[case::redb(redb())]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn range_scans_during_writes_stay_sorted(#[case] engine: Engine) {
    let backend = engine.backend;
    let mut set = JoinSet::new();

    for task_id in 0..4 {
        let backend = backend.clone();
        set.spawn(async move {
            for i in 0..50 {
                let key = format!("k:{:06}", task_id * 1000 + i).into_bytes();
                backend.set(key, b"v".to_vec()).await?;
            }
            Ok::<(), StorageError>(())
        });
    }
    for _ in 0..4 {
        let backend = backend.clone();
        set.spawn(async move {
            for _ in 0..20 {
                let results = backend.get_range(..).await?;
                for window in results.windows(2) {
                    assert!(window[0].key < window[1].key, "scan results must be sorted");
                }
                tokio::task::yield_now().await;
            }
            Ok::<(), StorageError>(())
        });
    }

    let (successes, _) = tally(set, "scan").await;
    assert_eq!(successes, 8);
    assert_eq!(backend.get_range(..).await.expect("final scan").len(), 200);
}
