//! Inline-or-blob value policy with quota enforcement.
//!
//! Payloads of at most [`INLINE_THRESHOLD`] bytes are stored in the
//! namespace engine. Larger payloads are streamed to a file in the blob
//! area and the engine stores only the file's path. Either way the entry is
//! tagged (see [`StoredEntry`]).
//!
//! A write proceeds in this order:
//!
//! 1. Stream the body, aborting as soon as it exceeds the remaining quota.
//! 2. Flush and sync the blob file, if one was needed.
//! 3. Reserve the size change against the writing token's usage.
//! 4. Commit the entry with a compare-and-set on the previous value.
//! 5. Credit the previous value's owner and remove the superseded blob.
//!
//! Every entry records the token it is charged to (see [`OwnedEntry`]).
//! Overwriting your own value costs only the net change; overwriting or
//! deleting another token's value credits that token in full.
//!
//! Until step 4 succeeds the new blob is owned by a [`BlobGuard`]. Error
//! paths discard it explicitly and dropping the guard covers cancellation.

use std::{
    io,
    path::{Path, PathBuf},
};

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tenantkv_storage::{StorageBackend, StorageError};
use tokio::{
    fs::File,
    io::{AsyncWriteExt, BufWriter},
};

use crate::{
    authority::TokenAuthority,
    entry::{OwnedEntry, StoredEntry},
    error::{GatewayError, GatewayResult},
    permission::Grant,
};

/// Largest payload stored inline.
pub const INLINE_THRESHOLD: usize = 1024;

/// Attempts made by a write racing other writers of the same key.
const MAX_WRITE_ATTEMPTS: usize = 8;

/// A value read from a namespace.
#[derive(Debug)]
pub enum ValueBody {
    /// Inline payload with its tag stripped.
    Inline(Bytes),
    /// An open blob file, to be streamed by the transport.
    Blob {
        /// The open file, positioned at the start.
        file: File,
        /// File length in bytes.
        len: u64,
    },
}

impl ValueBody {
    /// Payload length in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        match self {
            Self::Inline(bytes) => bytes.len() as u64,
            Self::Blob { len, .. } => *len,
        }
    }

    /// Returns `true` for an empty payload.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads the whole payload into memory.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Storage`] if a blob cannot be read.
    pub async fn into_bytes(self) -> GatewayResult<Bytes> {
        match self {
            Self::Inline(bytes) => Ok(bytes),
            Self::Blob { mut file, len } => {
                use tokio::io::AsyncReadExt;

                let mut buf = Vec::with_capacity(usize::try_from(len).unwrap_or(0));
                file.read_to_end(&mut buf)
                    .await
                    .map_err(|e| StorageError::io("reading blob", e))?;
                Ok(Bytes::from(buf))
            },
        }
    }
}

/// Owns a blob file until the entry referencing it is committed.
///
/// Dropping an armed guard removes the file synchronously; prefer
/// [`BlobGuard::discard`] wherever an `.await` is possible.
#[derive(Debug)]
pub struct BlobGuard {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    armed: bool,
}

impl BlobGuard {
    /// Creates a new, empty blob file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the file cannot be created.
    pub async fn create(path: PathBuf) -> Result<Self, StorageError> {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| StorageError::io(format!("creating blob {}", path.display()), e))?;
        Ok(Self { path, writer: Some(BufWriter::new(file)), armed: true })
    }

    /// Appends `bytes` to the blob.
    async fn write(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(StorageError::internal("blob already finished"));
        };
        writer.write_all(bytes).await.map_err(|e| StorageError::io("writing blob", e))
    }

    /// Flushes and syncs the file so it is durable before it is referenced.
    async fn finish(&mut self) -> Result<(), StorageError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().await.map_err(|e| StorageError::io("flushing blob", e))?;
            writer.get_mut().sync_all().await.map_err(|e| StorageError::io("syncing blob", e))?;
        }
        Ok(())
    }

    /// The blob's location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keeps the file on drop; the committed entry now owns it.
    pub fn disarm(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }

    /// Removes the file without blocking the runtime.
    ///
    /// The guard stays armed until the removal finishes, so a cancelled
    /// discard still falls back to the drop.
    pub async fn discard(mut self) {
        drop(self.writer.take());
        remove_blob(&self.path).await;
        self.armed = false;
    }
}

impl Drop for BlobGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        drop(self.writer.take());
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove orphaned blob");
        }
    }
}

/// Removes a blob that is no longer referenced. Missing files are fine.
pub async fn remove_blob(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove blob");
    }
}

/// Builds a fresh blob path for `key` in `namespace`.
///
/// The random suffix keeps an overwrite from clobbering the file the
/// committed entry still points at.
#[must_use]
pub fn blob_path(blob_dir: &Path, namespace: &str, key: &str) -> PathBuf {
    let nonce: [u8; 8] = rand::random();
    blob_dir.join(format!("{namespace}~{key}~{}", hex::encode(nonce)))
}

/// What a committed write replaced.
#[derive(Debug)]
struct Superseded {
    credit_to: Option<String>,
    credit: u64,
    blob: Option<PathBuf>,
}

/// Value operations on one namespace on behalf of one grant.
///
/// `B` stores the namespace and `A` stores the permission records usage is
/// charged to.
pub struct ValueStore<'a, B, A = B> {
    namespace: &'a str,
    backend: &'a B,
    authority: &'a TokenAuthority<A>,
    blob_dir: &'a Path,
    grant: &'a Grant,
}

impl<B, A> std::fmt::Debug for ValueStore<'_, B, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueStore")
            .field("namespace", &self.namespace)
            .field("grant", self.grant)
            .finish_non_exhaustive()
    }
}

impl<'a, B: StorageBackend, A: StorageBackend> ValueStore<'a, B, A> {
    /// Scopes a store to `namespace` and `grant`.
    #[must_use]
    pub fn new(
        namespace: &'a str,
        backend: &'a B,
        authority: &'a TokenAuthority<A>,
        blob_dir: &'a Path,
        grant: &'a Grant,
    ) -> Self {
        Self { namespace, backend, authority, blob_dir, grant }
    }

    /// Reads `key`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotFound`] for an absent key and
    /// [`GatewayError::Storage`] for a corrupt entry or a missing blob.
    #[tracing::instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn read(&self, key: &str) -> GatewayResult<ValueBody> {
        let raw = self.backend.get(key.as_bytes()).await?.ok_or_else(|| GatewayError::not_found(key))?;
        match OwnedEntry::decode(raw)?.entry {
            StoredEntry::Inline(payload) => Ok(ValueBody::Inline(payload)),
            StoredEntry::Blob(path) => {
                let file = File::open(&path)
                    .await
                    .map_err(|e| StorageError::io(format!("opening blob {}", path.display()), e))?;
                let len = file
                    .metadata()
                    .await
                    .map_err(|e| StorageError::io(format!("inspecting blob {}", path.display()), e))?
                    .len();
                Ok(ValueBody::Blob { file, len })
            },
        }
    }

    /// Stores the streamed `body` under `key`, charged to the grant's token.
    ///
    /// The body is checked against the grant's remaining quota as it
    /// arrives; a payload of exactly the remaining size is accepted.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::ReadOnly`] for a read-only grant, before any I/O
    /// - [`GatewayError::QuotaExceeded`] when the payload does not fit
    /// - [`GatewayError::MalformedRequest`] when the body stream fails
    /// - [`GatewayError::Storage`] for engine or blob failures
    #[tracing::instrument(skip(self, body), fields(namespace = %self.namespace))]
    pub async fn write<S>(&self, key: &str, body: S) -> GatewayResult<()>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        if self.grant.read_only() {
            return Err(GatewayError::ReadOnly);
        }

        let (entry, len, guard) = self.receive(key, body).await?;
        let committed = match OwnedEntry::new(entry, self.grant.accounting_token()).encode() {
            Ok(encoded) => self.commit_entry(key, encoded, len).await,
            Err(e) => Err(e.into()),
        };

        match committed {
            Ok(superseded) => {
                if let Some(guard) = guard {
                    guard.disarm();
                }
                self.credit(superseded.credit_to.as_deref(), superseded.credit).await;
                if let Some(path) = superseded.blob {
                    remove_blob(&path).await;
                }
                Ok(())
            },
            Err(e) => {
                if let Some(guard) = guard {
                    guard.discard().await;
                }
                Err(e)
            },
        }
    }

    /// Reserves usage and swaps `encoded` in for whatever `key` holds.
    async fn commit_entry(
        &self,
        key: &str,
        encoded: Vec<u8>,
        len: u64,
    ) -> GatewayResult<Superseded> {
        let writer = self.grant.accounting_token();

        for _ in 0..MAX_WRITE_ATTEMPTS {
            let previous_raw = self.backend.get(key.as_bytes()).await?;
            let previous = previous_raw.clone().map(OwnedEntry::decode).transpose()?;
            let previous_len = match &previous {
                Some(owned) => stored_len(&owned.entry).await,
                None => 0,
            };

            let same_owner =
                previous.as_ref().is_none_or(|owned| owned.owner.as_deref() == writer);
            let (reserved, credit_to, credit) = if same_owner {
                (len.saturating_sub(previous_len), writer, previous_len.saturating_sub(len))
            } else {
                (len, previous.as_ref().and_then(|owned| owned.owner.as_deref()), previous_len)
            };
            let credit_to = credit_to.map(str::to_owned);

            self.charge(writer, reserved).await?;

            let mut txn = self.backend.transaction().await?;
            txn.compare_and_set(
                key.as_bytes().to_vec(),
                previous_raw.map(|raw| raw.to_vec()),
                encoded.clone(),
            );
            match txn.commit().await {
                Ok(()) => {
                    let blob =
                        previous.and_then(|owned| owned.entry.blob_path().map(Path::to_path_buf));
                    return Ok(Superseded { credit_to, credit, blob });
                },
                Err(e) => {
                    self.credit(writer, reserved).await;
                    if !e.is_conflict() {
                        return Err(e.into());
                    }
                },
            }
        }

        Err(StorageError::conflict().into())
    }

    /// Consumes the body into an inline payload or a finished blob.
    async fn receive<S>(
        &self,
        key: &str,
        body: S,
    ) -> GatewayResult<(StoredEntry, u64, Option<BlobGuard>)>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let mut blob: Option<BlobGuard> = None;
        match self.fill(key, body, &mut blob).await {
            Ok((buffer, total)) => match blob {
                Some(guard) => Ok((StoredEntry::Blob(guard.path().to_path_buf()), total, Some(guard))),
                None => Ok((StoredEntry::Inline(buffer), total, None)),
            },
            Err(e) => {
                if let Some(guard) = blob {
                    guard.discard().await;
                }
                Err(e)
            },
        }
    }

    /// Streams the body, spilling into `blob` once it outgrows the inline
    /// threshold. Returns the inline buffer and the total length.
    async fn fill<S>(
        &self,
        key: &str,
        body: S,
        blob: &mut Option<BlobGuard>,
    ) -> GatewayResult<(Bytes, u64)>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let remaining = self.grant.remaining_quota();
        let mut body = std::pin::pin!(body);
        let mut buffer = BytesMut::new();
        let mut total: u64 = 0;

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| GatewayError::malformed(format!("request body: {e}")))?;
            total += chunk.len() as u64;
            if total > remaining {
                return Err(GatewayError::QuotaExceeded { requested: total, remaining });
            }

            match blob.as_mut() {
                Some(guard) => guard.write(&chunk).await?,
                None => {
                    buffer.extend_from_slice(&chunk);
                    if buffer.len() > INLINE_THRESHOLD {
                        let guard = blob.insert(
                            BlobGuard::create(blob_path(self.blob_dir, self.namespace, key)).await?,
                        );
                        guard.write(&buffer).await?;
                        buffer.clear();
                    }
                },
            }
        }

        if let Some(guard) = blob.as_mut() {
            guard.finish().await?;
        }
        Ok((buffer.freeze(), total))
    }

    /// Deletes `key` and its blob, crediting the freed bytes to the token
    /// the entry is charged to.
    ///
    /// The delete only commits if the entry is unchanged since it was read,
    /// so racing deletes free the bytes once and a racing overwrite is never
    /// removed unseen.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::ReadOnly`] for a read-only grant
    /// - [`GatewayError::NotFound`] for an absent key, including one a
    ///   concurrent delete just removed
    /// - [`GatewayError::Storage`] for engine failures
    #[tracing::instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn delete(&self, key: &str) -> GatewayResult<()> {
        if self.grant.read_only() {
            return Err(GatewayError::ReadOnly);
        }

        for _ in 0..MAX_WRITE_ATTEMPTS {
            let raw =
                self.backend.get(key.as_bytes()).await?.ok_or_else(|| GatewayError::not_found(key))?;
            let owned = OwnedEntry::decode(raw.clone())?;
            let len = stored_len(&owned.entry).await;

            let mut txn = self.backend.transaction().await?;
            txn.compare_and_delete(key.as_bytes().to_vec(), raw.to_vec());
            match txn.commit().await {
                Ok(()) => {
                    if let Some(path) = owned.entry.blob_path() {
                        remove_blob(path).await;
                    }
                    self.credit(owned.owner.as_deref(), len).await;
                    return Ok(());
                },
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(StorageError::conflict().into())
    }

    /// Lists every key in the namespace in order.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Storage`] if the scan fails.
    #[tracing::instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn list(&self) -> GatewayResult<Vec<String>> {
        let entries = self.backend.get_range(..).await?;
        Ok(entries.iter().map(|kv| kv.key_lossy()).collect())
    }

    /// Charges `bytes` to `owner`. Unowned writes are not accounted.
    async fn charge(&self, owner: Option<&str>, bytes: u64) -> GatewayResult<()> {
        match owner {
            Some(token) => self.authority.reserve(token, bytes).await,
            None => Ok(()),
        }
    }

    /// Credits `bytes` back to `owner`, logging instead of failing.
    async fn credit(&self, owner: Option<&str>, bytes: u64) {
        let Some(token) = owner else {
            return;
        };
        if let Err(e) = self.authority.release(token, bytes).await {
            tracing::warn!(bytes, error = %e, "failed to release usage");
        }
    }
}

/// Payload size of a stored entry. A missing blob counts as empty.
async fn stored_len(entry: &StoredEntry) -> u64 {
    match entry {
        StoredEntry::Inline(payload) => payload.len() as u64,
        StoredEntry::Blob(path) => match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "blob missing for stored entry");
                0
            },
        },
    }
}
