//! HTTP transport.
//!
//! Everything that talks to the network goes through an [`HttpClient`], a
//! boxed tower service. Production code uses [`ReqwestTransport`]; tests plug
//! an axum `Router` in directly.

use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Request, Response};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use tower::util::BoxCloneSyncService;
use tower::{Service, ServiceExt};

use crate::config::ClientConfig;
use crate::error::AuthError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A cloneable, shareable HTTP client.
pub type HttpClient = BoxCloneSyncService<Request<Body>, Response<Body>, BoxError>;

/// Request correlation header.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Largest request or response body the transport buffers.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Box any compatible tower service into an [`HttpClient`].
pub fn from_service<S>(service: S) -> HttpClient
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + Sync + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
{
    BoxCloneSyncService::new(service.map_err(|e: S::Error| -> BoxError { e.into() }))
}

/// Tag the request with a fresh request id unless the caller set one.
pub fn ensure_request_id(headers: &mut HeaderMap) {
    if headers.contains_key(REQUEST_ID_HEADER) {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(&uuid::Uuid::new_v4().to_string()) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
}

/// Production client for `config`.
pub fn reqwest_client(config: &ClientConfig) -> Result<HttpClient, AuthError> {
    ReqwestTransport::new(config.request_timeout)
        .map(ReqwestTransport::into_client)
        .map_err(|e| AuthError::unknown(format!("Failed to build HTTP client: {e}")))
}

/// Buffer a response body and parse it as JSON.
///
/// A body that cannot be read is a connectivity failure; one that cannot be
/// parsed is an `INVALID_RESPONSE`.
pub async fn read_json<T: DeserializeOwned>(response: Response<Body>) -> Result<T, AuthError> {
    let bytes = axum::body::to_bytes(response.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(AuthError::network)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| AuthError::invalid_response(format!("Unexpected response body: {e}")))
}

/// [`HttpClient`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub fn into_client(self) -> HttpClient {
        from_service(self)
    }
}

impl Service<Request<Body>> for ReqwestTransport {
    type Response = Response<Body>;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Response<Body>, BoxError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let client = self.client.clone();
        Box::pin(async move {
            let (parts, body) = request.into_parts();
            let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES).await?;
            let request = reqwest::Request::try_from(Request::from_parts(parts, bytes))?;

            let response = client.execute(request).await?;
            let status = response.status();
            let version = response.version();
            let headers = response.headers().clone();
            let body = response.bytes().await?;

            let mut out = Response::new(Body::from(body));
            *out.status_mut() = status;
            *out.version_mut() = version;
            *out.headers_mut() = headers;
            Ok(out)
        })
    }
}
