//! Shared test helpers for code built on [`Backend`].
//!
//! Feature-gated behind `testutil` so none of it reaches production builds.
//!
//! ```toml
//! [dev-dependencies]
//! tenantkv-storage = { path = "../storage", features = ["testutil"] }
//! ```
//!
//! ```ignore
//! // Requires the `testutil` feature to be enabled.
//! use tenantkv_storage::testutil::TestEngine;
//!
//! let engine = TestEngine::redb();
//! engine.backend().set(b"k".to_vec(), b"v".to_vec()).await?;
//! ```

use tempfile::TempDir;

use crate::{Backend, RedbBackend, StorageBackend, error::StorageResult};

/// A namespace backend plus whatever keeps its files alive.
///
/// Dropping the engine closes the backend and removes any files it created.
pub struct TestEngine {
    backend: Backend,
    _dir: Option<TempDir>,
}

impl TestEngine {
    /// An in-memory namespace.
    #[must_use]
    pub fn memory() -> Self {
        Self { backend: Backend::memory(), _dir: None }
    }

    /// A redb namespace in a fresh temporary directory.
    ///
    /// # Panics
    ///
    /// Panics if the directory or database cannot be created.
    #[must_use]
    pub fn redb() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let backend = RedbBackend::open(dir.path().join("ns.db")).expect("open redb namespace");
        Self { backend: backend.into(), _dir: Some(dir) }
    }

    /// The backend under test.
    #[must_use]
    pub fn backend(&self) -> &Backend {
        &self.backend
    }
}

impl std::fmt::Debug for TestEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TestEngine").field(&self.backend).finish()
    }
}

/// A key like `"prefix:000042"`. Zero-padding keeps byte order equal to
/// numeric order.
#[must_use]
pub fn make_key(prefix: &str, idx: usize) -> Vec<u8> {
    format!("{prefix}:{idx:06}").into_bytes()
}

/// Writes `count` keys made by [`make_key`], each holding `value`.
///
/// # Errors
///
/// Returns the first failed write.
pub async fn populate<B: StorageBackend>(
    backend: &B,
    prefix: &str,
    count: usize,
    value: &[u8],
) -> StorageResult<()> {
    for i in 0..count {
        backend.set(make_key(prefix, i), value.to_vec()).await?;
    }
    Ok(())
}

/// Asserts that a [`StorageResult`](crate::StorageResult) is a
/// [`StorageError::Conflict`](crate::StorageError::Conflict).
///
/// ```ignore
/// // Requires the `testutil` feature to be enabled.
/// use tenantkv_storage::assert_conflict;
///
/// let result = backend.compare_and_set(b"k", Some(b"stale"), b"v".to_vec()).await;
/// assert_conflict!(result);
/// ```
#[macro_export]
macro_rules! assert_conflict {
    ($result:expr) => {
        match $result {
            Err($crate::error::StorageError::Conflict) => {},
            other => panic!("expected StorageError::Conflict, got: {other:?}"),
        }
    };
    ($result:expr, $msg:expr) => {
        match $result {
            Err($crate::error::StorageError::Conflict) => {},
            other => panic!("{}: expected StorageError::Conflict, got: {other:?}", $msg),
        }
    };
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::panic)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::error::StorageError;

    #[test]
    fn keys_sort_numerically() {
        assert_eq!(make_key("k", 42), b"k:000042");
        assert!(make_key("k", 9) < make_key("k", 10));
    }

    #[tokio::test]
    async fn engines_populate_and_conflict() {
        for engine in [TestEngine::memory(), TestEngine::redb()] {
            populate(engine.backend(), "item", 3, b"v").await.expect("populate");
            assert_eq!(engine.backend().get_range(..).await.expect("scan").len(), 3);

            let key = make_key("item", 0);
            assert_eq!(engine.backend().get(&key).await.expect("get"), Some(Bytes::from("v")));
            let result = engine.backend().compare_and_set(&key, Some(b"x"), b"y".to_vec()).await;
            assert_conflict!(result, format!("{engine:?}"));
        }
    }

    #[test]
    fn conflict_macro_accepts_conflicts() {
        let result: StorageResult<()> = Err(StorageError::Conflict);
        assert_conflict!(result);
    }

    #[test]
    #[should_panic(expected = "expected StorageError::Conflict")]
    fn conflict_macro_rejects_other_errors() {
        let other: StorageResult<()> = Err(StorageError::internal("boom"));
        assert_conflict!(other);
    }
}
