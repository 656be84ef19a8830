//! Tagged encoding of stored values.
//!
//! Every value written to a namespace starts with a 6-byte tag:
//!
//! - `VALUE_` followed by the payload itself
//! - `BLOB__` followed by the UTF-8 path of the file holding the payload
//!
//! Namespace values written by a tenant token use the owned variants
//! `VALUE@` and `BLOB_@`. After the tag comes a big-endian `u16` length and
//! the owning token, then the payload or path as above. The owner is the
//! token whose usage the entry is charged to.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tenantkv_storage::{StorageError, StorageResult};

/// Tag for values stored directly in the engine.
pub const INLINE_TAG: &[u8; 6] = b"VALUE_";

/// Tag for values offloaded to the blob area.
pub const BLOB_TAG: &[u8; 6] = b"BLOB__";

/// Owned variant of [`INLINE_TAG`].
pub const OWNED_INLINE_TAG: &[u8; 6] = b"VALUE@";

/// Owned variant of [`BLOB_TAG`].
pub const OWNED_BLOB_TAG: &[u8; 6] = b"BLOB_@";

const TAG_LEN: usize = 6;
const OWNER_LEN_BYTES: usize = 2;

/// A decoded namespace entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredEntry {
    /// Payload stored in the engine.
    Inline(Bytes),
    /// Payload stored in a file.
    Blob(PathBuf),
}

impl StoredEntry {
    /// Encodes the entry with its tag.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Inline(payload) => {
                let mut out = Vec::with_capacity(TAG_LEN + payload.len());
                out.extend_from_slice(INLINE_TAG);
                out.extend_from_slice(payload);
                out
            },
            Self::Blob(path) => {
                let path = path.to_string_lossy();
                let mut out = Vec::with_capacity(TAG_LEN + path.len());
                out.extend_from_slice(BLOB_TAG);
                out.extend_from_slice(path.as_bytes());
                out
            },
        }
    }

    /// Decodes a raw stored value.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Serialization`] for a missing or unknown tag,
    /// or a blob path that is not UTF-8.
    pub fn decode(raw: Bytes) -> StorageResult<Self> {
        if raw.len() < TAG_LEN {
            return Err(StorageError::serialization("stored entry is shorter than its tag"));
        }
        let tag = &raw[..TAG_LEN];
        if tag == INLINE_TAG {
            Ok(Self::Inline(raw.slice(TAG_LEN..)))
        } else if tag == BLOB_TAG {
            let path = std::str::from_utf8(&raw[TAG_LEN..]).map_err(|e| {
                StorageError::serialization_with_source("blob path is not UTF-8", e)
            })?;
            Ok(Self::Blob(PathBuf::from(path)))
        } else {
            Err(StorageError::serialization(format!(
                "unknown entry tag {:?}",
                String::from_utf8_lossy(tag)
            )))
        }
    }

    /// Path of the referenced blob, if any.
    #[must_use]
    pub fn blob_path(&self) -> Option<&Path> {
        match self {
            Self::Inline(_) => None,
            Self::Blob(path) => Some(path),
        }
    }
}

/// A namespace value together with the token it is charged to.
///
/// `owner == None` marks an unaccounted value, such as one written with the
/// super token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedEntry {
    /// The stored value.
    pub entry: StoredEntry,
    /// The token charged for the value's bytes.
    pub owner: Option<String>,
}

impl OwnedEntry {
    /// Pairs `entry` with its owner.
    #[must_use]
    pub fn new(entry: StoredEntry, owner: Option<&str>) -> Self {
        Self { entry, owner: owner.map(str::to_owned) }
    }

    /// Encodes the entry, using the owned tags when there is an owner.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Serialization`] if the owner does not fit
    /// its `u16` length prefix.
    pub fn encode(&self) -> StorageResult<Vec<u8>> {
        let Some(owner) = &self.owner else {
            return Ok(self.entry.encode());
        };
        let owner_len = u16::try_from(owner.len())
            .map_err(|_| StorageError::serialization("entry owner is too long"))?;

        let plain = self.entry.encode();
        let tag = match self.entry {
            StoredEntry::Inline(_) => OWNED_INLINE_TAG,
            StoredEntry::Blob(_) => OWNED_BLOB_TAG,
        };
        let mut out = Vec::with_capacity(plain.len() + OWNER_LEN_BYTES + owner.len());
        out.extend_from_slice(tag);
        out.extend_from_slice(&owner_len.to_be_bytes());
        out.extend_from_slice(owner.as_bytes());
        out.extend_from_slice(&plain[TAG_LEN..]);
        Ok(out)
    }

    /// Decodes a raw namespace value in either the plain or owned form.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Serialization`] for a truncated owner, an
    /// owner that is not UTF-8, or anything [`StoredEntry::decode`] rejects.
    pub fn decode(raw: Bytes) -> StorageResult<Self> {
        let plain_tag = match raw.get(..TAG_LEN) {
            Some(tag) if tag == OWNED_INLINE_TAG => INLINE_TAG,
            Some(tag) if tag == OWNED_BLOB_TAG => BLOB_TAG,
            _ => return Ok(Self { entry: StoredEntry::decode(raw)?, owner: None }),
        };

        let header_end = TAG_LEN + OWNER_LEN_BYTES;
        let len_bytes: [u8; OWNER_LEN_BYTES] = raw
            .get(TAG_LEN..header_end)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| StorageError::serialization("entry owner length is truncated"))?;
        let owner_end = header_end + usize::from(u16::from_be_bytes(len_bytes));
        let owner = raw
            .get(header_end..owner_end)
            .ok_or_else(|| StorageError::serialization("entry owner is truncated"))?;
        let owner = std::str::from_utf8(owner)
            .map_err(|e| StorageError::serialization_with_source("entry owner is not UTF-8", e))?
            .to_owned();

        let mut plain = Vec::with_capacity(TAG_LEN + raw.len() - owner_end);
        plain.extend_from_slice(plain_tag);
        plain.extend_from_slice(&raw[owner_end..]);
        Ok(Self { entry: StoredEntry::decode(Bytes::from(plain))?, owner: Some(owner) })
    }
}
