//! HTTP server for the [`Gateway`].
//!
//! Every path except `/healthz` is handed to the gateway through the
//! router's fallback, which copies method, target, `Authorization` header,
//! peer address and the streamed body into a [`GatewayRequest`]. Blob
//! responses are streamed back from the open file.

use std::{future::Future, io, net::SocketAddr, sync::Arc};

use axum::{
    Router,
    body::Body,
    extract::{ConnectInfo, Request, State},
    response::Response,
    routing::get,
};
use futures::{StreamExt, TryStreamExt};
use http::header;
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;

use crate::dispatcher::{Gateway, GatewayRequest, GatewayResponse, ResponseBody};

/// Builds the router. The peer address must be supplied as
/// [`ConnectInfo<SocketAddr>`], which [`serve`] arranges.
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new().route("/healthz", get(healthz)).fallback(dispatch).with_state(gateway)
}

/// Serves `gateway` on `listener` until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the server fails to accept connections.
pub async fn serve<F>(listener: TcpListener, gateway: Arc<Gateway>, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(gateway).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await
}

async fn healthz(State(gateway): State<Arc<Gateway>>) -> Response {
    match gateway.health().await {
        Ok(()) => into_response(GatewayResponse::bytes("ok".into())),
        Err(err) => {
            tracing::warn!(error = %err, "health check failed");
            into_response(GatewayResponse::from_error(&err))
        },
    }
}

async fn dispatch(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let target = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path().to_owned(), |pq| pq.as_str().to_owned());
    let authorization = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    let body = body.into_data_stream().map_err(io::Error::other).boxed();

    let request = GatewayRequest::builder()
        .method(parts.method)
        .target(target)
        .maybe_authorization(authorization)
        .client(peer.ip())
        .body(body)
        .build();
    into_response(gateway.handle(request).await)
}

fn into_response(response: GatewayResponse) -> Response {
    let body = match response.body {
        ResponseBody::Empty => Body::empty(),
        ResponseBody::Full(bytes) => Body::from(bytes),
        ResponseBody::Blob(file) => Body::from_stream(ReaderStream::new(file)),
    };
    let mut out = Response::new(body);
    *out.status_mut() = response.status;
    *out.headers_mut() = response.headers;
    out
}
