//! Request dispatch: parse, authenticate, admit, select, execute, respond.
//!
//! [`Gateway`] is transport-agnostic. It takes a [`GatewayRequest`] (method,
//! target, credential, client address and a body stream) and always yields
//! a [`GatewayResponse`]; every failure is mapped to its status here, so a
//! transport only has to copy status, headers and body onto the wire.

use std::{io, net::IpAddr, path::PathBuf, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use tenantkv_storage::{Backend, StorageBackend, StorageError};
use tokio::fs::File;

use crate::{
    authority::{TokenAuthority, generate_token},
    config::{EngineKind, GatewayConfig},
    error::{GatewayError, GatewayResult},
    permission::{AUTH_NAMESPACE, Grant},
    rate_limit::RateLimiter,
    registry::{MemoryOpener, NamespaceOpener, NamespaceRegistry, RedbOpener},
    value_store::{ValueBody, ValueStore},
};

/// Streamed request body.
pub type BodyStream = BoxStream<'static, io::Result<Bytes>>;

/// A request as seen by the gateway.
///
/// # Example
///
/// ```
/// use std::net::{IpAddr, Ipv4Addr};
/// use http::Method;
/// use tenantkv_gateway::GatewayRequest;
///
/// let request = GatewayRequest::builder()
///     .method(Method::GET)
///     .target("/shop/cart")
///     .authorization("Bearer abc")
///     .client(IpAddr::V4(Ipv4Addr::LOCALHOST))
///     .build();
///
/// assert_eq!(request.target, "/shop/cart");
/// ```
#[derive(bon::Builder)]
pub struct GatewayRequest {
    /// Protocol method.
    pub method: Method,
    /// Path and optional query, e.g. `/shop/cart?token`.
    #[builder(into)]
    pub target: String,
    /// Value of the `Authorization` header, if present.
    #[builder(into)]
    pub authorization: Option<String>,
    /// Address the request came from.
    pub client: IpAddr,
    /// Request payload.
    #[builder(default = futures::stream::empty().boxed())]
    pub body: BodyStream,
}

impl std::fmt::Debug for GatewayRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayRequest")
            .field("method", &self.method)
            .field("client", &self.client)
            .field("has_authorization", &self.authorization.is_some())
            .finish_non_exhaustive()
    }
}

/// Response payload.
#[derive(Debug)]
pub enum ResponseBody {
    /// No payload.
    Empty,
    /// An in-memory payload.
    Full(Bytes),
    /// A blob file the transport streams chunk by chunk.
    Blob(File),
}

/// A response produced by the gateway.
#[derive(Debug)]
pub struct GatewayResponse {
    /// Status code.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Payload.
    pub body: ResponseBody,
}

impl GatewayResponse {
    /// `200` with no payload.
    #[must_use]
    pub fn ok() -> Self {
        Self { status: StatusCode::OK, headers: HeaderMap::new(), body: ResponseBody::Empty }
    }

    /// `200` with an in-memory payload.
    #[must_use]
    pub fn bytes(payload: Bytes) -> Self {
        Self { body: ResponseBody::Full(payload), ..Self::ok() }
    }

    /// `200` with a JSON payload.
    #[must_use]
    pub fn json(payload: Bytes) -> Self {
        let mut response = Self::bytes(payload);
        response.headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }

    /// `200` streaming a blob as an attachment named after `key`.
    #[must_use]
    pub fn blob(key: &str, file: File, len: u64) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
        let disposition = format!("attachment; filename=\"{}\"", key.replace('"', "\\\""));
        if let Ok(value) = HeaderValue::from_str(&disposition) {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
        Self { status: StatusCode::OK, headers, body: ResponseBody::Blob(file) }
    }

    /// The response reported for `err`.
    #[must_use]
    pub fn from_error(err: &GatewayError) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        if let GatewayError::RateLimited { retry_after } = err {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs(*retry_after)));
        }
        Self { status: err.status(), headers, body: ResponseBody::Full(Bytes::from(err.to_string())) }
    }

    /// Collects the payload into memory.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Storage`] if a blob cannot be read.
    pub async fn into_bytes(self) -> GatewayResult<Bytes> {
        match self.body {
            ResponseBody::Empty => Ok(Bytes::new()),
            ResponseBody::Full(bytes) => Ok(bytes),
            ResponseBody::Blob(file) => ValueBody::Blob { file, len: 0 }.into_bytes().await,
        }
    }
}

/// Whole seconds until `retry_after` has passed, rounded up.
fn retry_after_secs(retry_after: Duration) -> u64 {
    retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0)
}

/// A parsed request target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// The namespace segment.
    pub namespace: String,
    /// The key segment; `None` addresses the namespace itself.
    pub key: Option<String>,
    /// The raw query, used as a fallback credential.
    pub query: Option<String>,
}

/// Longest accepted namespace name, in bytes.
pub const MAX_NAMESPACE_LEN: usize = 64;

/// Longest accepted key, in bytes.
///
/// Blob file names embed the namespace and key, and must stay under the
/// usual 255-byte file name limit.
pub const MAX_KEY_LEN: usize = 160;

impl Target {
    /// Parses `/<namespace>[/<key>][?<query>]`.
    ///
    /// Keys are taken verbatim from the path. A trailing slash with no key
    /// addresses the namespace.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::MalformedRequest`] for an empty or invalid
    /// namespace, a key containing `/` or equal to `.` or `..`, or a name
    /// longer than [`MAX_NAMESPACE_LEN`] or [`MAX_KEY_LEN`].
    pub fn parse(target: &str) -> GatewayResult<Self> {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (target, None),
        };
        let path = path
            .strip_prefix('/')
            .ok_or_else(|| GatewayError::malformed("target must start with '/'"))?;
        let (namespace, key) = match path.split_once('/') {
            Some((namespace, key)) => (namespace, Some(key)),
            None => (path, None),
        };

        validate_namespace(namespace)?;
        let key = key.filter(|key| !key.is_empty());
        if let Some(key) = key
            && (key.contains('/') || key == "." || key == "..")
        {
            return Err(GatewayError::malformed(format!("invalid key '{key}'")));
        }
        if let Some(key) = key
            && key.len() > MAX_KEY_LEN
        {
            return Err(GatewayError::malformed(format!("key is longer than {MAX_KEY_LEN} bytes")));
        }

        Ok(Self {
            namespace: namespace.to_owned(),
            key: key.map(str::to_owned),
            query: query.filter(|q| !q.is_empty()).map(str::to_owned),
        })
    }
}

fn validate_namespace(namespace: &str) -> GatewayResult<()> {
    if namespace.is_empty() {
        return Err(GatewayError::malformed("empty namespace"));
    }
    if namespace.len() > MAX_NAMESPACE_LEN {
        return Err(GatewayError::malformed(format!(
            "namespace is longer than {MAX_NAMESPACE_LEN} bytes"
        )));
    }
    if namespace == "." || namespace == ".." {
        return Err(GatewayError::malformed(format!("invalid namespace '{namespace}'")));
    }
    if !namespace.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')) {
        return Err(GatewayError::malformed(format!(
            "namespace '{namespace}' may only contain letters, digits, '.', '_' and '-'"
        )));
    }
    Ok(())
}

/// Picks the bearer credential: the `Authorization` header (raw or
/// `Bearer`-prefixed), else the query.
fn credential<'a>(authorization: Option<&'a str>, target: &'a Target) -> GatewayResult<&'a str> {
    let header = authorization
        .map(|value| value.strip_prefix("Bearer ").unwrap_or(value).trim())
        .filter(|token| !token.is_empty());
    header.or(target.query.as_deref()).ok_or(GatewayError::MissingToken)
}

/// The operation a request maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation<'k> {
    /// Enumerate keys.
    List,
    /// Fetch a value.
    Read(&'k str),
    /// Store a value.
    Write(&'k str),
    /// Remove a value.
    Delete(&'k str),
}

impl<'k> Operation<'k> {
    /// Maps `method` and `key` to an operation permitted for `grant`.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::ReadOnly`] for a write or delete on a read-only grant
    /// - [`GatewayError::MalformedRequest`] for a write or delete without a key
    /// - [`GatewayError::MethodNotAllowed`] for any other method
    pub fn select(method: &Method, key: Option<&'k str>, grant: &Grant) -> GatewayResult<Self> {
        let mutating: fn(&'k str) -> Self = if *method == Method::GET {
            return Ok(key.map_or(Self::List, Self::Read));
        } else if *method == Method::POST || *method == Method::PUT {
            Self::Write
        } else if *method == Method::DELETE {
            Self::Delete
        } else {
            return Err(GatewayError::MethodNotAllowed { method: method.to_string() });
        };

        if grant.read_only() {
            return Err(GatewayError::ReadOnly);
        }
        let key = key.ok_or_else(|| GatewayError::malformed("a key is required"))?;
        Ok(mutating(key))
    }
}

/// The gateway: token authority, namespace registry and rate limiter.
pub struct Gateway {
    authority: TokenAuthority<Backend>,
    registry: NamespaceRegistry,
    limiter: RateLimiter,
    blob_dir: PathBuf,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("registry", &self.registry)
            .field("limiter", &self.limiter)
            .field("blob_dir", &self.blob_dir)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Assembles a gateway from its parts.
    #[must_use]
    pub fn new(
        authority: TokenAuthority<Backend>,
        registry: NamespaceRegistry,
        limiter: RateLimiter,
        blob_dir: impl Into<PathBuf>,
    ) -> Self {
        Self { authority, registry, limiter, blob_dir: blob_dir.into() }
    }

    /// Opens the auth namespace and prepares the blob area per `config`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Storage`] if the blob directory cannot be
    /// created or the auth namespace cannot be opened.
    pub async fn open(config: &GatewayConfig) -> GatewayResult<Self> {
        let opener: Arc<dyn NamespaceOpener> = match config.engine {
            EngineKind::Redb => Arc::new(RedbOpener::new(&config.data_dir)),
            EngineKind::Memory => Arc::new(MemoryOpener),
        };

        tokio::fs::create_dir_all(&config.blob_dir).await.map_err(|e| {
            StorageError::io(format!("creating blob directory {}", config.blob_dir.display()), e)
        })?;

        let auth = opener.open(AUTH_NAMESPACE).await?;
        let admin_token = config.admin_token.clone().unwrap_or_else(generate_token);
        let authority =
            TokenAuthority::new(auth, admin_token).with_default_quota(config.default_quota);

        tracing::info!(engine = ?config.engine, data_dir = %config.data_dir.display(), "gateway opened");
        Ok(Self::new(
            authority,
            NamespaceRegistry::new(opener),
            RateLimiter::new(config.rate_limit()),
            &config.blob_dir,
        ))
    }

    /// The token authority.
    pub fn authority(&self) -> &TokenAuthority<Backend> {
        &self.authority
    }

    /// The namespace registry.
    pub fn registry(&self) -> &NamespaceRegistry {
        &self.registry
    }

    /// The rate limiter.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Handles one request. Failures become error responses.
    #[tracing::instrument(skip_all, fields(method = %request.method, client = %request.client))]
    pub async fn handle(&self, request: GatewayRequest) -> GatewayResponse {
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(err) => {
                if err.status().is_server_error() {
                    tracing::warn!(error = %err, "request failed");
                } else {
                    tracing::debug!(error = %err, status = %err.status(), "request rejected");
                }
                GatewayResponse::from_error(&err)
            },
        }
    }

    async fn dispatch(&self, request: GatewayRequest) -> GatewayResult<GatewayResponse> {
        let GatewayRequest { method, target, authorization, client, body } = request;

        let target = Target::parse(&target)?;
        let token = credential(authorization.as_deref(), &target)?;
        let grant = self.authority.resolve(token, &target.namespace).await?;
        self.limiter.admit(client, grant.rate_policy())?;
        let operation = Operation::select(&method, target.key.as_deref(), &grant)?;

        let backend = if target.namespace == AUTH_NAMESPACE {
            self.authority.backend().clone()
        } else {
            self.registry.get(&target.namespace).await?
        };
        let store =
            ValueStore::new(&target.namespace, &backend, &self.authority, &self.blob_dir, &grant);

        match operation {
            Operation::List => {
                let keys = store.list().await?;
                let json = serde_json::to_vec(&keys).map_err(|e| {
                    StorageError::serialization_with_source("encoding key list", e)
                })?;
                Ok(GatewayResponse::json(Bytes::from(json)))
            },
            Operation::Read(key) => match store.read(key).await? {
                ValueBody::Inline(payload) => Ok(GatewayResponse::bytes(payload)),
                ValueBody::Blob { file, len } => Ok(GatewayResponse::blob(key, file, len)),
            },
            Operation::Write(key) => {
                store.write(key, body).await?;
                Ok(GatewayResponse::ok())
            },
            Operation::Delete(key) => {
                store.delete(key).await?;
                Ok(GatewayResponse::ok())
            },
        }
    }

    /// Checks that the auth namespace answers.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Storage`] if the engine is unhealthy.
    pub async fn health(&self) -> GatewayResult<()> {
        self.authority.backend().health_check().await?;
        Ok(())
    }

    /// Closes every namespace handle. Returns how many were open.
    pub fn shutdown(&self) -> usize {
        self.registry.shutdown()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;
    use crate::permission::PermissionRecord;

    #[rstest]
    #[case("/shop", "shop", None, None)]
    #[case("/shop/", "shop", None, None)]
    #[case("/shop/cart", "shop", Some("cart"), None)]
    #[case("/shop/cart?tok", "shop", Some("cart"), Some("tok"))]
    #[case("/shop?tok", "shop", None, Some("tok"))]
    #[case("/my-db_1.v2/k", "my-db_1.v2", Some("k"), None)]
    fn parses_valid_targets(
        #[case] raw: &str,
        #[case] namespace: &str,
        #[case] key: Option<&str>,
        #[case] query: Option<&str>,
    ) {
        let target = Target::parse(raw).unwrap();
        assert_eq!(target.namespace, namespace);
        assert_eq!(target.key.as_deref(), key);
        assert_eq!(target.query.as_deref(), query);
    }

    #[rstest]
    #[case::no_slash("shop")]
    #[case::empty("/")]
    #[case::empty_with_key("//key")]
    #[case::dot("/./key")]
    #[case::dotdot("/../key")]
    #[case::bad_char("/sh op")]
    #[case::tilde("/shop~1")]
    #[case::nested_key("/shop/a/b")]
    #[case::dot_key("/shop/..")]
    fn rejects_malformed_targets(#[case] raw: &str) {
        assert!(matches!(Target::parse(raw), Err(GatewayError::MalformedRequest { .. })));
    }

    #[rstest]
    #[case::namespace_at_limit(MAX_NAMESPACE_LEN, 1, true)]
    #[case::namespace_over_limit(MAX_NAMESPACE_LEN + 1, 1, false)]
    #[case::key_at_limit(4, MAX_KEY_LEN, true)]
    #[case::key_over_limit(4, MAX_KEY_LEN + 1, false)]
    #[case::key_past_file_name_limit(4, 240, false)]
    fn name_lengths_are_bounded(
        #[case] namespace_len: usize,
        #[case] key_len: usize,
        #[case] accepted: bool,
    ) {
        let raw = format!("/{}/{}", "n".repeat(namespace_len), "k".repeat(key_len));
        match Target::parse(&raw) {
            Ok(target) => assert!(accepted, "{raw} should be rejected: {target:?}"),
            Err(e) => {
                assert!(!accepted, "{raw} should parse: {e}");
                assert!(matches!(e, GatewayError::MalformedRequest { .. }));
            },
        }
    }

    proptest! {
        #[test]
        fn valid_namespaces_always_parse(ns in "[A-Za-z0-9_-][A-Za-z0-9._-]{0,30}", key in "[a-z0-9]{1,12}") {
            let target = Target::parse(&format!("/{ns}/{key}")).unwrap();
            prop_assert_eq!(target.namespace, ns);
            prop_assert_eq!(target.key, Some(key));
        }

        #[test]
        fn parse_never_panics(raw in ".*") {
            let _ = Target::parse(&raw);
        }
    }

    #[rstest]
    #[case(Some("abc"), None, Ok("abc"))]
    #[case(Some("Bearer abc"), None, Ok("abc"))]
    #[case(Some("Bearer abc"), Some("q"), Ok("abc"))]
    #[case(None, Some("q"), Ok("q"))]
    #[case(Some(""), Some("q"), Ok("q"))]
    #[case(None, None, Err(()))]
    fn credential_sources(
        #[case] header: Option<&str>,
        #[case] query: Option<&str>,
        #[case] expected: Result<&str, ()>,
    ) {
        let target = Target {
            namespace: "shop".into(),
            key: None,
            query: query.map(str::to_owned),
        };
        let actual = credential(header, &target).map_err(|_| ());
        assert_eq!(actual, expected);
    }

    fn tenant(read_only: bool) -> Grant {
        Grant::tenant("t", PermissionRecord::builder().read_only(read_only).build())
    }

    #[test]
    fn operation_selection() {
        let rw = tenant(false);
        assert_eq!(Operation::select(&Method::GET, None, &rw).unwrap(), Operation::List);
        assert_eq!(Operation::select(&Method::GET, Some("a"), &rw).unwrap(), Operation::Read("a"));
        assert_eq!(Operation::select(&Method::POST, Some("a"), &rw).unwrap(), Operation::Write("a"));
        assert_eq!(Operation::select(&Method::PUT, Some("a"), &rw).unwrap(), Operation::Write("a"));
        assert_eq!(
            Operation::select(&Method::DELETE, Some("a"), &rw).unwrap(),
            Operation::Delete("a")
        );
        assert!(matches!(
            Operation::select(&Method::POST, None, &rw),
            Err(GatewayError::MalformedRequest { .. })
        ));
        assert!(matches!(
            Operation::select(&Method::PATCH, Some("a"), &rw),
            Err(GatewayError::MethodNotAllowed { .. })
        ));
    }

    #[test]
    fn read_only_grant_may_only_read() {
        let ro = tenant(true);
        assert_eq!(Operation::select(&Method::GET, Some("a"), &ro).unwrap(), Operation::Read("a"));
        assert!(matches!(
            Operation::select(&Method::POST, Some("a"), &ro),
            Err(GatewayError::ReadOnly)
        ));
        assert!(matches!(
            Operation::select(&Method::DELETE, Some("a"), &ro),
            Err(GatewayError::ReadOnly)
        ));
    }

    #[rstest]
    #[case(Duration::from_secs(3), 3)]
    #[case(Duration::from_millis(2001), 3)]
    #[case(Duration::from_millis(1), 1)]
    fn retry_after_rounds_up(#[case] wait: Duration, #[case] expected: u64) {
        assert_eq!(retry_after_secs(wait), expected);
    }

    #[test]
    fn rate_limited_response_carries_retry_after() {
        let response = GatewayResponse::from_error(&GatewayError::RateLimited {
            retry_after: Duration::from_millis(1500),
        });
        assert_eq!(response.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers[header::RETRY_AFTER], "2");
    }

    #[test]
    fn request_debug_hides_credential() {
        let request = GatewayRequest::builder()
            .method(Method::GET)
            .target("/shop?secret")
            .authorization("secret")
            .client(IpAddr::from([127, 0, 0, 1]))
            .build();
        assert!(!format!("{request:?}").contains("secret"));
    }
}
