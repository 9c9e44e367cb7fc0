//! Session endpoints: login, register, refresh, logout and "who am I".
//!
//! The gateway is the only component that mints token pairs. Every pair it
//! receives is validated, written to the [`TokenStore`], cached in the
//! [`TokenValidator`] and announced as a [`TokenEvent`], in that order.
//!
//! `refresh()` is single-flight: while a refresh request is outstanding, every
//! other caller awaits the same future instead of presenting the refresh token
//! a second time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use axum::body::Body;
use axum::http::{Method, Request, Response, StatusCode, header, request};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower::ServiceExt;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::backoff::{RetryConfig, retry_after, with_backoff};
use crate::claims::{Role, SessionClaims, TokenValidator};
use crate::error::AuthError;
use crate::form::RegistrationForm;
use crate::store::{REFRESH_COOKIE_NAME, TokenPair, TokenStore};
use crate::transport::{HttpClient, ensure_request_id, read_json};

pub const LOGIN_PATH: &str = "auth/login";
pub const REGISTER_PATH: &str = "auth/register";
pub const REFRESH_PATH: &str = "auth/refresh";
pub const LOGOUT_PATH: &str = "auth/logout";
pub const ME_PATH: &str = "auth/me";

/// Token lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenEvent {
    /// A new pair was stored; carries its validated claims.
    Set(SessionClaims),
    /// Tokens were removed.
    Cleared,
}

/// The user as reported by `GET /auth/me`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(default, deserialize_with = "crate::claims::id_as_string")]
    pub id: Option<String>,
    pub email: String,
    #[serde(default)]
    pub username: Option<String>,
    pub role: Role,
}

impl User {
    /// Build the user from locally validated claims, without a network call.
    pub fn from_claims(claims: &SessionClaims) -> Option<Self> {
        Some(Self {
            id: claims.id.clone(),
            email: claims.email.clone()?,
            username: claims.username.clone(),
            role: claims.role()?,
        })
    }
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    #[serde(alias = "access_token")]
    access_token: String,
    #[serde(default, alias = "refresh_token")]
    refresh_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MeResponse {
    Wrapped { user: User },
    Bare(User),
}

impl From<MeResponse> for User {
    fn from(response: MeResponse) -> Self {
        match response {
            MeResponse::Wrapped { user } | MeResponse::Bare(user) => user,
        }
    }
}

type SharedRefresh = Shared<BoxFuture<'static, Result<TokenPair, AuthError>>>;

struct InFlight {
    id: u64,
    future: SharedRefresh,
}

struct Inner {
    client: HttpClient,
    api_base: Url,
    retry: RetryConfig,
    store: TokenStore,
    validator: TokenValidator,
    events: watch::Sender<TokenEvent>,
    /// Bumped whenever a session starts or ends.
    epoch: AtomicU64,
    /// Serializes epoch changes against token installs.
    session_lock: Mutex<()>,
    in_flight: Mutex<Option<InFlight>>,
    next_flight: AtomicU64,
}

/// Client for the session endpoints. Cheap to clone.
#[derive(Clone)]
pub struct AuthGateway {
    inner: Arc<Inner>,
}

impl AuthGateway {
    pub fn new(client: HttpClient, store: TokenStore, api_base: Url, retry: RetryConfig) -> Self {
        let (events, _) = watch::channel(TokenEvent::Cleared);
        Self {
            inner: Arc::new(Inner {
                client,
                api_base,
                retry,
                store,
                validator: TokenValidator::new(),
                events,
                epoch: AtomicU64::new(0),
                session_lock: Mutex::new(()),
                in_flight: Mutex::new(None),
                next_flight: AtomicU64::new(0),
            }),
        }
    }

    pub fn store(&self) -> &TokenStore {
        &self.inner.store
    }

    pub fn validator(&self) -> &TokenValidator {
        &self.inner.validator
    }

    /// Subscribe to token lifecycle events.
    pub fn subscribe(&self) -> watch::Receiver<TokenEvent> {
        self.inner.events.subscribe()
    }

    /// The stored access token, if any.
    pub fn access_token(&self) -> Option<String> {
        self.inner.store.get().map(|pair| pair.access_token)
    }

    pub fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    /// Adopt the stored pair without a network call.
    ///
    /// Fails with `MALFORMED_TOKEN` or `TOKEN_EXPIRED` when the stored access
    /// token is unusable; its refresh token may still be good.
    pub fn resume(&self) -> Result<SessionClaims, AuthError> {
        let pair = self
            .inner
            .store
            .get()
            .ok_or_else(|| AuthError::unauthorized("No stored session"))?;
        let claims = self.inner.validator.inspect(&pair.access_token)?;
        self.inner
            .events
            .send_replace(TokenEvent::Set(claims.clone()));
        Ok(claims)
    }

    // =========================================================================
    // Login / register
    // =========================================================================

    /// Exchange credentials for a token pair.
    ///
    /// Never retried on 429: retrying credential checks only extends a lockout.
    #[instrument(skip(self, password))]
    pub async fn login(&self, email: &str, password: &str) -> Result<SessionClaims, AuthError> {
        let epoch = self.begin_session();

        let result = self.login_once(email, password, epoch).await;
        match &result {
            Ok(claims) => info!(role = ?claims.role, "Logged in"),
            Err(e) => {
                warn!(kind = %e.kind, "Login failed");
                self.logout().await;
            }
        }
        result
    }

    async fn login_once(
        &self,
        email: &str,
        password: &str,
        epoch: u64,
    ) -> Result<SessionClaims, AuthError> {
        let body = serde_json::to_vec(&LoginRequest { email, password })
            .map_err(|e| AuthError::unknown(format!("Failed to encode login request: {e}")))?;
        let request = self
            .request(Method::POST, LOGIN_PATH)?
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .map_err(build_error)?;

        let response = self.send(request).await?;
        match response.status() {
            status if status.is_success() => self.install_response(response, epoch).await,
            StatusCode::TOO_MANY_REQUESTS => {
                Err(AuthError::rate_limited(retry_after(response.headers())))
            }
            StatusCode::UNAUTHORIZED => Err(AuthError::invalid_credentials()),
            _ => Err(AuthError::from_login_response(response).await),
        }
    }

    /// Create an account and start a session for it.
    #[instrument(skip(self, form), fields(email = form.email()))]
    pub async fn register(&self, form: &RegistrationForm) -> Result<SessionClaims, AuthError> {
        let epoch = self.begin_session();

        let result = self.register_once(form, epoch).await;
        match &result {
            Ok(_) => info!("Registered"),
            Err(e) => {
                warn!(kind = %e.kind, "Registration failed");
                self.logout().await;
            }
        }
        result
    }

    async fn register_once(
        &self,
        form: &RegistrationForm,
        epoch: u64,
    ) -> Result<SessionClaims, AuthError> {
        let body = form.to_body();
        let content_type = form.content_type();

        let response = with_backoff(self.inner.retry, || {
            let request = self.request(Method::POST, REGISTER_PATH).and_then(|builder| {
                builder
                    .header(header::CONTENT_TYPE, content_type.as_str())
                    .body(Body::from(body.clone()))
                    .map_err(build_error)
            });
            async move { self.send(request?).await }
        })
        .await?;

        if response.status().is_success() {
            self.install_response(response, epoch).await
        } else {
            Err(AuthError::from_response(response).await)
        }
    }

    // =========================================================================
    // Refresh
    // =========================================================================

    /// Exchange the stored refresh token for a new pair.
    ///
    /// Concurrent callers share one request. The result is not acted on here:
    /// on failure the tokens stay in place and the caller decides whether the
    /// session is over.
    pub async fn refresh(&self) -> Result<TokenPair, AuthError> {
        let (id, future) = {
            let mut slot = self.lock_flight();
            match slot.as_ref() {
                Some(flight) if flight.future.peek().is_none() => {
                    debug!("Joining in-flight refresh");
                    (flight.id, flight.future.clone())
                }
                _ => {
                    let id = self.inner.next_flight.fetch_add(1, Ordering::SeqCst);
                    let future = refresh_task(Arc::downgrade(&self.inner)).boxed().shared();
                    *slot = Some(InFlight {
                        id,
                        future: future.clone(),
                    });
                    (id, future)
                }
            }
        };

        let result = future.await;

        let mut slot = self.lock_flight();
        if slot.as_ref().is_some_and(|flight| flight.id == id) {
            *slot = None;
        }
        result
    }

    #[instrument(skip(self))]
    async fn refresh_once(&self) -> Result<TokenPair, AuthError> {
        let epoch = self.epoch();
        let current = self
            .inner
            .store
            .get()
            .ok_or_else(|| AuthError::unauthorized("No refresh token stored"))?;

        let refresh_cookie = format!("{REFRESH_COOKIE_NAME}={}", current.refresh_token);
        let response = with_backoff(self.inner.retry, || {
            let request = self.request(Method::POST, REFRESH_PATH).and_then(|builder| {
                builder
                    .header(header::COOKIE, refresh_cookie.as_str())
                    .body(Body::empty())
                    .map_err(build_error)
            });
            async move { self.send(request?).await }
        })
        .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(AuthError::unauthorized("Refresh token rejected").with_status(status));
        }
        if !status.is_success() {
            return Err(AuthError::from_response(response).await);
        }

        let body: TokenResponse = read_json(response).await?;
        let pair = TokenPair::new(
            body.access_token,
            body.refresh_token.unwrap_or(current.refresh_token),
        );

        match self.install(&pair, epoch) {
            Ok(claims) => {
                debug!(exp = ?claims.exp, "Access token refreshed");
                Ok(pair)
            }
            Err(e) if self.epoch() != epoch => {
                // A login or logout happened while the request was out.
                debug!("Discarding refresh result from a previous session");
                self.inner.store.get().ok_or(e)
            }
            Err(e) => Err(e),
        }
    }

    fn lock_flight(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Logout / identity
    // =========================================================================

    /// End the session locally and tell the server, best effort.
    ///
    /// Local state is cleared first and regardless of the server outcome.
    #[instrument(skip(self))]
    pub async fn logout(&self) {
        let pair = self.inner.store.get();
        self.end_session();

        let Some(pair) = pair else {
            return;
        };

        let refresh_cookie = format!("{REFRESH_COOKIE_NAME}={}", pair.refresh_token);
        let bearer = format!("Bearer {}", pair.access_token);
        let result = with_backoff(self.inner.retry, || {
            let request = self.request(Method::POST, LOGOUT_PATH).and_then(|builder| {
                builder
                    .header(header::COOKIE, refresh_cookie.as_str())
                    .header(header::AUTHORIZATION, bearer.as_str())
                    .body(Body::empty())
                    .map_err(build_error)
            });
            async move { self.send(request?).await }
        })
        .await;

        match result {
            Ok(response) if response.status().is_success() => info!("Logged out"),
            Ok(response) => warn!(status = %response.status(), "Server logout failed"),
            Err(e) => warn!(error = %e, "Server logout failed"),
        }
    }

    /// Drop tokens and cached claims without contacting the server.
    ///
    /// Returns whether a session was actually removed, so that concurrent
    /// callers can tell which one ended it.
    pub fn end_session(&self) -> bool {
        let _guard = self.lock_session();
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.validator.clear();
        let removed = self.inner.store.clear();
        self.inner.events.send_replace(TokenEvent::Cleared);
        if removed {
            debug!("Session tokens cleared");
        }
        removed
    }

    /// Fetch the current user.
    ///
    /// A 401 triggers one refresh (shared with any other refresh in flight)
    /// and one retry. If that refresh fails, the original 401 is returned.
    #[instrument(skip(self))]
    pub async fn get_me(&self) -> Result<User, AuthError> {
        let response = self.me_request().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return user_from_response(response).await;
        }

        let original = AuthError::from_response(response).await;
        if let Err(e) = self.refresh().await {
            debug!(kind = %e.kind, "Refresh after getMe 401 failed");
            return Err(original);
        }

        let response = self.me_request().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(AuthError::from_response(response).await);
        }
        user_from_response(response).await
    }

    async fn me_request(&self) -> Result<Response<Body>, AuthError> {
        with_backoff(self.inner.retry, || {
            let bearer = self.access_token().map(|token| format!("Bearer {token}"));
            let request = self.request(Method::GET, ME_PATH).and_then(|mut builder| {
                if let Some(bearer) = bearer {
                    builder = builder.header(header::AUTHORIZATION, bearer);
                }
                builder.body(Body::empty()).map_err(build_error)
            });
            async move { self.send(request?).await }
        })
        .await
    }

    // =========================================================================
    // Plumbing
    // =========================================================================

    /// Start a new session epoch so stale refresh results are discarded.
    fn begin_session(&self) -> u64 {
        let _guard = self.lock_session();
        self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn install_response(
        &self,
        response: Response<Body>,
        epoch: u64,
    ) -> Result<SessionClaims, AuthError> {
        let body: TokenResponse = read_json(response).await?;
        let refresh_token = body
            .refresh_token
            .ok_or_else(|| AuthError::invalid_response("Response carries no refresh token"))?;
        self.install(&TokenPair::new(body.access_token, refresh_token), epoch)
    }

    /// Validate, store, cache and announce a new pair minted during `epoch`.
    fn install(&self, pair: &TokenPair, epoch: u64) -> Result<SessionClaims, AuthError> {
        let claims = TokenValidator::decode(&pair.access_token).map_err(|e| {
            AuthError::invalid_response(format!("Server issued an unreadable token: {}", e.message))
        })?;

        let _guard = self.lock_session();
        if self.epoch() != epoch {
            return Err(AuthError::unauthorized("Session ended while the request was in flight"));
        }
        if !self.inner.validator.validate(&claims) {
            return Err(AuthError::invalid_response(
                "Server issued an access token that is already expired or incomplete",
            ));
        }
        self.inner.store.set(pair);
        self.inner.events.send_replace(TokenEvent::Set(claims.clone()));
        Ok(claims)
    }

    fn request(&self, method: Method, path: &str) -> Result<request::Builder, AuthError> {
        let url = self
            .inner
            .api_base
            .join(path)
            .map_err(|e| AuthError::unknown(format!("Invalid endpoint {path}: {e}")))?;
        Ok(Request::builder()
            .method(method)
            .uri(url.as_str())
            .header(header::ACCEPT, "application/json"))
    }

    async fn send(&self, mut request: Request<Body>) -> Result<Response<Body>, AuthError> {
        ensure_request_id(request.headers_mut());
        self.inner
            .client
            .clone()
            .oneshot(request)
            .await
            .map_err(AuthError::network)
    }

    fn lock_session(&self) -> MutexGuard<'_, ()> {
        self.inner
            .session_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for AuthGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGateway")
            .field("api_base", &self.inner.api_base.as_str())
            .field("epoch", &self.epoch())
            .finish_non_exhaustive()
    }
}

/// The shared refresh future. Holds only a weak reference so an abandoned
/// refresh cannot keep the gateway alive.
async fn refresh_task(inner: Weak<Inner>) -> Result<TokenPair, AuthError> {
    let inner = inner
        .upgrade()
        .ok_or_else(|| AuthError::unknown("Session gateway was dropped"))?;
    AuthGateway { inner }.refresh_once().await
}

async fn user_from_response(response: Response<Body>) -> Result<User, AuthError> {
    if !response.status().is_success() {
        return Err(AuthError::from_response(response).await);
    }
    read_json::<MeResponse>(response).await.map(User::from)
}

fn build_error(e: axum::http::Error) -> AuthError {
    AuthError::unknown(format!("Failed to build request: {e}"))
}
