//! Durable storage backend on top of [redb](https://docs.rs/redb).
//!
//! Each [`RedbBackend`] owns one redb database file holding a single
//! `entries` table with byte keys and byte values. redb's own write
//! transactions are serialized, which gives compare-and-set and buffered
//! transactions their atomicity. All engine calls are blocking, so every
//! operation runs on tokio's blocking pool.

use std::{
    collections::BTreeMap,
    ops::{Bound, RangeBounds},
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use redb::{Database, ReadableTable, TableDefinition};

use crate::{
    backend::StorageBackend,
    error::{StorageError, StorageResult},
    memory::is_empty_range,
    transaction::{CasOperation, Transaction},
    types::KeyValue,
};

const ENTRIES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("entries");

/// A namespace persisted in a single redb file.
///
/// Cloning is cheap; clones share the open database. The file is closed
/// when the last clone is dropped.
#[derive(Clone)]
pub struct RedbBackend {
    db: Arc<Database>,
    path: Arc<PathBuf>,
}

impl std::fmt::Debug for RedbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbBackend").field("path", &self.path).finish_non_exhaustive()
    }
}

impl RedbBackend {
    /// Opens (or creates) the database file at `path`.
    ///
    /// Missing parent directories are created. This call blocks; async
    /// callers should run it through `spawn_blocking`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the parent directory cannot be created
    /// and [`StorageError::Internal`] if redb refuses the file (for example
    /// because another process holds its lock).
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::io(format!("creating directory {}", parent.display()), e)
            })?;
        }

        let db = Database::create(&path).map_err(|e| {
            StorageError::internal_with_source(format!("opening {}", path.display()), e)
        })?;

        // Create the table up front so read transactions never see it missing.
        let init = || -> Result<(), redb::Error> {
            let txn = db.begin_write()?;
            txn.open_table(ENTRIES)?;
            txn.commit()?;
            Ok(())
        };
        init().map_err(|e| {
            StorageError::internal_with_source(format!("initializing {}", path.display()), e)
        })?;

        tracing::debug!(path = %path.display(), "opened redb namespace");
        Ok(Self { db: Arc::new(db), path: Arc::new(path) })
    }

    /// Returns the database file location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn run<T, F>(&self, op: &'static str, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Database) -> Result<T, redb::Error> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| StorageError::internal_with_source(format!("redb {op} task failed"), e))?
            .map_err(|e| StorageError::internal_with_source(format!("redb {op} failed"), e))
    }
}

#[async_trait]
impl StorageBackend for RedbBackend {
    #[tracing::instrument(skip_all, fields(key_len = key.len()))]
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        let key = key.to_vec();
        self.run("get", move |db| {
            let txn = db.begin_read()?;
            let table = txn.open_table(ENTRIES)?;
            Ok(table.get(key.as_slice())?.map(|v| Bytes::copy_from_slice(v.value())))
        })
        .await
    }

    #[tracing::instrument(skip_all, fields(key_len = key.len(), value_len = value.len()))]
    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        self.run("set", move |db| {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(ENTRIES)?;
                table.insert(key.as_slice(), value.as_slice())?;
            }
            txn.commit()?;
            Ok(())
        })
        .await
    }

    #[tracing::instrument(skip_all, fields(key_len = key.len()))]
    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
    ) -> StorageResult<()> {
        let cas = CasOperation::set(key.to_vec(), expected.map(<[u8]>::to_vec), new_value);
        let applied = self
            .run("compare_and_set", move |db| apply_atomically(db, &[cas], BTreeMap::new()))
            .await?;
        if applied { Ok(()) } else { Err(StorageError::Conflict) }
    }

    #[tracing::instrument(skip_all, fields(key_len = key.len()))]
    async fn delete(&self, key: &[u8]) -> StorageResult<()> {
        let key = key.to_vec();
        self.run("delete", move |db| {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(ENTRIES)?;
                table.remove(key.as_slice())?;
            }
            txn.commit()?;
            Ok(())
        })
        .await
    }

    #[tracing::instrument(skip_all)]
    async fn get_range<R>(&self, range: R) -> StorageResult<Vec<KeyValue>>
    where
        R: RangeBounds<Vec<u8>> + Send,
    {
        let start = range.start_bound().cloned();
        let end = range.end_bound().cloned();
        self.run("get_range", move |db| {
            let start = start.as_ref().map(Vec::as_slice);
            let end = end.as_ref().map(Vec::as_slice);
            if is_empty_range(start, end) {
                return Ok(Vec::new());
            }

            let txn = db.begin_read()?;
            let table = txn.open_table(ENTRIES)?;
            let mut out = Vec::new();
            for item in table.range::<&[u8]>((start, end))? {
                let (k, v) = item?;
                out.push(KeyValue::new(
                    Bytes::copy_from_slice(k.value()),
                    Bytes::copy_from_slice(v.value()),
                ));
            }
            Ok(out)
        })
        .await
    }

    #[tracing::instrument(skip_all)]
    async fn transaction(&self) -> StorageResult<Box<dyn Transaction>> {
        Ok(Box::new(RedbTransaction {
            backend: self.clone(),
            pending_writes: BTreeMap::new(),
            pending_cas: Vec::new(),
        }))
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.run("health_check", |db| {
            let txn = db.begin_read()?;
            txn.open_table(ENTRIES)?;
            Ok(())
        })
        .await
    }
}

/// Verifies every CAS precondition and applies all changes in one redb
/// write transaction. Returns `false` (and aborts) on the first mismatch.
fn apply_atomically(
    db: &Database,
    cas: &[CasOperation],
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
) -> Result<bool, redb::Error> {
    let txn = db.begin_write()?;
    let matched = {
        let mut table = txn.open_table(ENTRIES)?;

        let mut matched = true;
        for op in cas {
            let current = table.get(op.key.as_slice())?.map(|g| g.value().to_vec());
            if !op.matches(current.as_deref()) {
                matched = false;
                break;
            }
        }

        if matched {
            for op in cas {
                match &op.new_value {
                    Some(v) => {
                        table.insert(op.key.as_slice(), v.as_slice())?;
                    },
                    None => {
                        table.remove(op.key.as_slice())?;
                    },
                }
            }
            for (key, value) in &writes {
                match value {
                    Some(v) => {
                        table.insert(key.as_slice(), v.as_slice())?;
                    },
                    None => {
                        table.remove(key.as_slice())?;
                    },
                }
            }
        }
        matched
    };

    if matched {
        txn.commit()?;
    } else {
        txn.abort()?;
    }
    Ok(matched)
}

/// Buffered transaction committed as a single redb write transaction.
struct RedbTransaction {
    backend: RedbBackend,
    pending_writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    pending_cas: Vec<CasOperation>,
}

#[async_trait]
impl Transaction for RedbTransaction {
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
        let Self { backend, pending_writes, pending_cas } = *self;
        let applied = backend
            .run("commit", move |db| apply_atomically(db, &pending_cas, pending_writes))
            .await?;
        if applied { Ok(()) } else { Err(StorageError::Conflict) }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn open_temp() -> (TempDir, RedbBackend) {
        let dir = TempDir::new().unwrap();
        let backend = RedbBackend::open(dir.path().join("shop.db")).unwrap();
        (dir, backend)
    }

    #[tokio::test]
    async fn test_basic_operations() {
        let (_dir, backend) = open_temp();

        backend.set(b"key1".to_vec(), b"value1".to_vec()).await.unwrap();
        assert_eq!(backend.get(b"key1").await.unwrap(), Some(Bytes::from("value1")));

        backend.delete(b"key1").await.unwrap();
        assert_eq!(backend.get(b"key1").await.unwrap(), None);

        // Deleting an absent key is fine.
        backend.delete(b"key1").await.unwrap();
    }

    #[tokio::test]
    async fn test_data_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("orders.db");

        {
            let backend = RedbBackend::open(&path).unwrap();
            backend.set(b"order:1".to_vec(), b"pending".to_vec()).await.unwrap();
        }

        let reopened = RedbBackend::open(&path).unwrap();
        assert_eq!(reopened.get(b"order:1").await.unwrap(), Some(Bytes::from("pending")));
    }

    #[tokio::test]
    async fn test_range_is_ordered() {
        let (_dir, backend) = open_temp();
        for key in ["c", "a", "b"] {
            backend.set(key.as_bytes().to_vec(), b"v".to_vec()).await.unwrap();
        }

        let all = backend.get_range(..).await.unwrap();
        let keys: Vec<String> = all.iter().map(KeyValue::key_lossy).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);

        let bounded = backend.get_range(b"a".to_vec()..b"c".to_vec()).await.unwrap();
        assert_eq!(bounded.len(), 2);

        let inverted = backend.get_range(b"z".to_vec()..b"a".to_vec()).await.unwrap();
        assert!(inverted.is_empty());
    }

    #[tokio::test]
    async fn test_compare_and_set() {
        let (_dir, backend) = open_temp();

        backend.compare_and_set(b"k", None, b"1".to_vec()).await.unwrap();
        crate::assert_conflict!(backend.compare_and_set(b"k", None, b"2".to_vec()).await);

        backend.compare_and_set(b"k", Some(b"1"), b"2".to_vec()).await.unwrap();
        assert_eq!(backend.get(b"k").await.unwrap(), Some(Bytes::from("2")));
    }

    #[tokio::test]
    async fn test_transaction_commit_and_conflict() {
        let (_dir, backend) = open_temp();
        backend.set(b"a".to_vec(), b"1".to_vec()).await.unwrap();

        let mut txn = backend.transaction().await.unwrap();
        txn.set(b"b".to_vec(), b"2".to_vec());
        txn.delete(b"a".to_vec());
        assert_eq!(txn.get(b"b").await.unwrap(), Some(Bytes::from("2")));
        assert_eq!(txn.get(b"a").await.unwrap(), None);
        txn.commit().await.unwrap();

        assert_eq!(backend.get(b"a").await.unwrap(), None);
        assert_eq!(backend.get(b"b").await.unwrap(), Some(Bytes::from("2")));

        let mut txn = backend.transaction().await.unwrap();
        txn.compare_and_set(b"b".to_vec(), Some(b"stale".to_vec()), b"3".to_vec());
        txn.set(b"c".to_vec(), b"x".to_vec());
        crate::assert_conflict!(txn.commit().await);
        assert_eq!(backend.get(b"c").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_health_check() {
        let (_dir, backend) = open_temp();
        backend.health_check().await.unwrap();
    }
}
