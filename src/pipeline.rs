//! Authenticated request pipeline.
//!
//! [`AuthLayer`] wraps an HTTP client. Every request gets the stored access
//! token as a bearer credential. A 401 gets one recovery attempt: refresh the
//! pair (shared with any other refresh in flight) and re-issue the identical
//! request once. A second 401, or a refresh the server rejects, ends the
//! session and sends the user to the login entry point.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::{Body, Bytes};
use axum::http::request::Parts;
use axum::http::{HeaderValue, Request, Response, StatusCode, header};
use futures::future::BoxFuture;
use tower::{Layer, Service, ServiceExt};
use tracing::{debug, info, warn};

use crate::error::AuthError;
use crate::gateway::AuthGateway;
use crate::navigation::LoginRedirect;
use crate::transport::{BoxError, ensure_request_id};

/// Request bodies are buffered so the request can be re-issued.
const MAX_REPLAY_BODY: usize = 16 * 1024 * 1024;

/// Marks a request that was already re-issued after a 401.
///
/// A marked request that fails with 401 again is never refreshed a second
/// time. Callers can set it up front to opt a request out of recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryMarker;

/// Layer that adds bearer authentication and 401 recovery.
#[derive(Clone)]
pub struct AuthLayer {
    gateway: AuthGateway,
    redirect: Arc<dyn LoginRedirect>,
}

impl AuthLayer {
    pub fn new(gateway: AuthGateway, redirect: Arc<dyn LoginRedirect>) -> Self {
        Self { gateway, redirect }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            inner,
            gateway: self.gateway.clone(),
            redirect: self.redirect.clone(),
        }
    }
}

/// Service produced by [`AuthLayer`].
///
/// Resolves to `Err` for every non-success status, so callers only see
/// `Ok` for responses they can use.
#[derive(Clone)]
pub struct AuthService<S> {
    inner: S,
    gateway: AuthGateway,
    redirect: Arc<dyn LoginRedirect>,
}

impl<S> Service<Request<Body>> for AuthService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
{
    type Response = Response<Body>;
    type Error = AuthError;
    type Future = BoxFuture<'static, Result<Response<Body>, AuthError>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner
            .poll_ready(cx)
            .map_err(|e| AuthError::network(Into::<BoxError>::into(e)))
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        // The ready service goes into the future; keep a fresh clone.
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let attempt = Attempt {
            inner,
            gateway: self.gateway.clone(),
            redirect: self.redirect.clone(),
        };
        Box::pin(attempt.run(request))
    }
}

struct Attempt<S> {
    inner: S,
    gateway: AuthGateway,
    redirect: Arc<dyn LoginRedirect>,
}

impl<S> Attempt<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Send,
    S::Error: Into<BoxError>,
    S::Future: Send,
{
    async fn run(mut self, request: Request<Body>) -> Result<Response<Body>, AuthError> {
        let (mut parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, MAX_REPLAY_BODY)
            .await
            .map_err(|e| AuthError::unknown(format!("Failed to buffer request body: {e}")))?;
        ensure_request_id(&mut parts.headers);

        let mut retried = parts.extensions.get::<RetryMarker>().is_some();
        let mut token = self.gateway.access_token();
        // No session to end, so a 401 must still reach the login page.
        let anonymous = token.is_none();

        loop {
            let response = self.dispatch(&parts, &body, token.as_deref(), retried).await?;
            let status = response.status();

            if status != StatusCode::UNAUTHORIZED {
                if status.is_client_error() || status.is_server_error() {
                    return Err(AuthError::from_response(response).await);
                }
                return Ok(response);
            }

            if retried {
                debug!(uri = %parts.uri, "Retried request rejected again");
                self.force_login(anonymous);
                return Err(AuthError::from_response(response).await);
            }
            retried = true;

            // Someone else already replaced the token this request carried.
            let stored = self.gateway.access_token();
            if stored.is_some() && stored != token {
                debug!(uri = %parts.uri, "Retrying with the current access token");
                token = stored;
                continue;
            }

            match self.gateway.refresh().await {
                Ok(pair) => {
                    debug!(uri = %parts.uri, "Retrying after refresh");
                    token = Some(pair.access_token);
                }
                Err(e) if !e.is_terminal() => {
                    warn!(kind = %e.kind, "Refresh failed, keeping session");
                    return Err(e);
                }
                Err(e) => {
                    debug!(kind = %e.kind, "Refresh failed, ending session");
                    self.force_login(anonymous);
                    return Err(AuthError::unauthorized(
                        "Your session has expired. Please log in again.",
                    ));
                }
            }
        }
    }

    async fn dispatch(
        &mut self,
        parts: &Parts,
        body: &Bytes,
        token: Option<&str>,
        retried: bool,
    ) -> Result<Response<Body>, AuthError> {
        let mut request = rebuild(parts, body);
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| AuthError::malformed_token("Access token is not a valid header value"))?;
            request.headers_mut().insert(header::AUTHORIZATION, value);
        }
        if retried {
            request.extensions_mut().insert(RetryMarker);
        }

        let service = self
            .inner
            .ready()
            .await
            .map_err(|e| AuthError::network(Into::<BoxError>::into(e)))?;
        service
            .call(request)
            .await
            .map_err(|e| AuthError::network(Into::<BoxError>::into(e)))
    }

    /// Navigate only if this call actually ended the session, so concurrent
    /// failures of one session redirect once. A request sent without any
    /// token always navigates.
    fn force_login(&self, anonymous: bool) {
        if self.gateway.end_session() {
            info!("Session ended by the server");
            self.redirect.redirect_to_login();
        } else if anonymous {
            info!("Request requires a session");
            self.redirect.redirect_to_login();
        }
    }
}

/// Identical copy of the original request.
fn rebuild(parts: &Parts, body: &Bytes) -> Request<Body> {
    let mut request = Request::new(Body::from(body.clone()));
    *request.method_mut() = parts.method.clone();
    *request.uri_mut() = parts.uri.clone();
    *request.version_mut() = parts.version;
    *request.headers_mut() = parts.headers.clone();
    *request.extensions_mut() = parts.extensions.clone();
    request
}
