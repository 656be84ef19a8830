//! Multi-tenant key-value gateway.
//!
//! Exposes independent key-value namespaces over HTTP, gated by bearer
//! tokens. Each token's permission record lives in the reserved `auth`
//! namespace and carries its scope, quota, rate limit and read-only flag.
//!
//! # Request pipeline
//!
//! ```text
//! HTTP ──► Target::parse ──► TokenAuthority::resolve ──► RateLimiter::admit
//!                                                              │
//!      ◄── GatewayResponse ◄── ValueStore ◄── NamespaceRegistry ◄┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use std::net::{IpAddr, Ipv4Addr};
//! use futures::StreamExt;
//! use http::{Method, StatusCode};
//! use tenantkv_gateway::{EngineKind, Gateway, GatewayConfig, GatewayRequest, PermissionRecord};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dir = tempfile::tempdir()?;
//! let config = GatewayConfig::builder()
//!     .engine(EngineKind::Memory)
//!     .blob_dir(dir.path())
//!     .build();
//! let gateway = Gateway::open(&config).await?;
//!
//! let record = PermissionRecord::builder().scope(["shop".to_owned()].into()).build();
//! let token = gateway.authority().issue(&record).await?;
//!
//! let body = futures::stream::iter([Ok(bytes::Bytes::from("hello"))]).boxed();
//! let request = GatewayRequest::builder()
//!     .method(Method::PUT)
//!     .target("/shop/greeting")
//!     .authorization(token.as_str())
//!     .client(IpAddr::V4(Ipv4Addr::LOCALHOST))
//!     .body(body)
//!     .build();
//! assert_eq!(gateway.handle(request).await.status, StatusCode::OK);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

pub mod authority;
pub mod config;
pub mod dispatcher;
pub mod entry;
pub mod error;
pub mod permission;
pub mod rate_limit;
pub mod registry;
pub mod server;
pub mod value_store;

pub use authority::{TokenAuthority, generate_token};
pub use config::{EngineKind, GatewayConfig};
pub use dispatcher::{
    BodyStream, Gateway, GatewayRequest, GatewayResponse, MAX_KEY_LEN, MAX_NAMESPACE_LEN,
    Operation, ResponseBody, Target,
};
pub use entry::{OwnedEntry, StoredEntry};
pub use error::{ConfigError, GatewayError, GatewayResult};
pub use permission::{
    AUTH_NAMESPACE, DEFAULT_QUOTA_BYTES, Grant, PermissionRecord, RateLimitPolicy,
    StoredPermissions,
};
pub use rate_limit::{RateLimitConfig, RateLimitMetricsSnapshot, RateLimiter};
pub use registry::{MemoryOpener, NamespaceOpener, NamespaceRegistry, RedbOpener};
pub use value_store::{BlobGuard, INLINE_THRESHOLD, ValueBody, ValueStore};
