//! Ordered key-value storage backends for the tenantkv gateway.
//!
//! This crate provides the [`StorageBackend`] trait that every tenant
//! namespace is stored behind, plus the two engines the gateway ships with.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    tenantkv-gateway                         │
//! │   token authority │ namespace registry │ value store policy │
//! ├─────────────────────────────────────────────────────────────┤
//! │                   tenantkv-storage                          │
//! │              StorageBackend trait                           │
//! │   (get, set, compare_and_set, delete, get_range, txn)       │
//! ├──────────────┬──────────────────────────────────────────────┤
//! │ MemoryBackend│            RedbBackend                       │
//! │   (testing)  │     (one redb file per namespace)            │
//! └──────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use tenantkv_storage::{MemoryBackend, StorageBackend};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = MemoryBackend::new();
//!
//!     backend.set(b"user:123".to_vec(), b"Alice".to_vec()).await?;
//!     let value = backend.get(b"user:123").await?;
//!     assert_eq!(value.map(|b| b.to_vec()), Some(b"Alice".to_vec()));
//!
//!     let mut txn = backend.transaction().await?;
//!     txn.set(b"counter".to_vec(), b"1".to_vec());
//!     txn.delete(b"user:123".to_vec());
//!     txn.commit().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Available Backends
//!
//! | Backend | Use Case | Persistence |
//! |---------|----------|-------------|
//! | [`MemoryBackend`] | Testing, ephemeral deployments | No |
//! | [`RedbBackend`] | Production | Yes |
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module with shared test helpers (key generators,
//!   backend factories, assertion macros) and the `conformance` suite every backend must pass.
//!   Enable this in `[dev-dependencies]` for integration tests.

#![deny(unsafe_code)]

pub mod backend;
pub mod backend_enum;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod conformance;
pub mod error;
pub mod memory;
pub mod redb_backend;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod testutil;
pub mod transaction;
pub mod types;

// Re-export primary types at crate root for convenience
pub use backend::StorageBackend;
pub use backend_enum::Backend;
pub use error::{BoxError, StorageError, StorageResult};
pub use memory::MemoryBackend;
pub use redb_backend::RedbBackend;
pub use transaction::Transaction;
pub use types::KeyValue;
