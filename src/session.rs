//! Application-level session service.
//!
//! [`Session`] is constructed once at startup with its storage, transport and
//! login redirect injected, and handed to whatever needs authentication. It
//! owns the gateway and the refresh scheduler and tracks the [`AuthState`]
//! the UI renders.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tower::Layer;
use tracing::{debug, info, warn};

use crate::claims::{Role, SessionClaims};
use crate::config::ClientConfig;
use crate::error::{AuthError, ErrorKind};
use crate::form::RegistrationForm;
use crate::gateway::{AuthGateway, User};
use crate::navigation::{LogRedirect, LoginRedirect};
use crate::pipeline::{AuthLayer, AuthService};
use crate::scheduler::RefreshScheduler;
use crate::store::{CookieJar, FileStore, KeyValueStore, TokenStore};
use crate::transport::{HttpClient, reqwest_client};

/// Cooldown applied when the server rate limits a login without saying for
/// how long.
pub const DEFAULT_LOGIN_COOLDOWN: Duration = Duration::from_secs(60);

/// What the UI shows about the session.
#[derive(Debug, Clone, Default)]
pub struct AuthState {
    pub user: Option<User>,
    pub is_authenticated: bool,
    pub is_loading: bool,
    pub error: Option<AuthError>,
    /// New login attempts are refused until this moment.
    pub retry_after: Option<DateTime<Utc>>,
}

struct Inner {
    gateway: AuthGateway,
    scheduler: RefreshScheduler,
    redirect: Arc<dyn LoginRedirect>,
    state: Mutex<AuthState>,
}

/// The session service. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Build a session from its parts. Spawns the refresh scheduler, so this
    /// must run inside a tokio runtime.
    pub fn new(
        client: HttpClient,
        store: TokenStore,
        config: &ClientConfig,
        redirect: Arc<dyn LoginRedirect>,
    ) -> Self {
        let gateway = AuthGateway::new(client, store, config.api_base.clone(), config.retry);
        let scheduler = RefreshScheduler::spawn(gateway.clone(), config.lead_window);
        Self {
            inner: Arc::new(Inner {
                gateway,
                scheduler,
                redirect,
                state: Mutex::new(AuthState::default()),
            }),
        }
    }

    /// Production wiring: reqwest transport, file-backed mirror in
    /// `config.storage_dir`, log-only redirect.
    pub fn from_config(config: &ClientConfig) -> Result<Self, AuthError> {
        Ok(Self::with_fallback(
            reqwest_client(config)?,
            FileStore::new(&config.storage_dir),
            config,
            Arc::new(LogRedirect),
        ))
    }

    /// Wire a session around `fallback` with the configured cookie attributes.
    pub fn with_fallback(
        client: HttpClient,
        fallback: impl KeyValueStore + 'static,
        config: &ClientConfig,
        redirect: Arc<dyn LoginRedirect>,
    ) -> Self {
        let cookie = CookieJar::new(config.cookie_max_age, config.secure_cookies);
        Self::new(client, TokenStore::new(cookie, fallback), config, redirect)
    }

    pub fn gateway(&self) -> &AuthGateway {
        &self.inner.gateway
    }

    /// Wrap `inner` so its requests carry the session's bearer token and
    /// recover from an expired one.
    pub fn client(&self, inner: HttpClient) -> AuthService<HttpClient> {
        AuthLayer::new(self.inner.gateway.clone(), self.inner.redirect.clone()).layer(inner)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Pick up a stored session at startup.
    ///
    /// A stored token that validates locally is accepted without a network
    /// call. An unusable one gets one refresh attempt; if the server rejects
    /// it the stored tokens are dropped. A network failure keeps them for the
    /// next attempt.
    pub async fn restore(&self) -> bool {
        self.update(|state| state.is_loading = true);

        let gateway = &self.inner.gateway;
        let result = match gateway.resume() {
            Ok(claims) => {
                info!(email = ?claims.email, "Session restored");
                Ok(claims)
            }
            Err(e) if matches!(e.kind, ErrorKind::MalformedToken | ErrorKind::TokenExpired) => {
                debug!(kind = %e.kind, "Stored access token unusable, refreshing");
                self.refresh_claims().await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(claims) => {
                self.authenticated(&claims);
                true
            }
            Err(e) => {
                if e.is_terminal() {
                    gateway.end_session();
                } else {
                    warn!(error = %e, "Could not restore session");
                }
                self.update(|state| {
                    state.is_loading = false;
                    state.is_authenticated = false;
                    state.user = None;
                });
                false
            }
        }
    }

    async fn refresh_claims(&self) -> Result<SessionClaims, AuthError> {
        self.inner.gateway.refresh().await?;
        self.inner
            .gateway
            .validator()
            .cached()
            .ok_or_else(AuthError::token_expired)
    }

    /// Log in. Refused without any network I/O while a rate-limit cooldown
    /// is active.
    pub async fn login(&self, email: &str, password: &str) -> Result<User, AuthError> {
        if let Some(remaining) = self.cooldown_remaining() {
            debug!(remaining_ms = remaining.as_millis() as u64, "Login refused during cooldown");
            let err = AuthError::rate_limited(Some(remaining));
            self.update(|state| state.error = Some(err.clone()));
            return Err(err);
        }

        self.update(|state| {
            state.is_loading = true;
            state.error = None;
        });
        let result = self.inner.gateway.login(email, password).await;
        self.finish_sign_in(result)
    }

    pub async fn register(&self, form: &RegistrationForm) -> Result<User, AuthError> {
        self.update(|state| {
            state.is_loading = true;
            state.error = None;
        });
        let result = self.inner.gateway.register(form).await;
        self.finish_sign_in(result)
    }

    /// End the session. The refresh timer is disarmed before any token is
    /// touched.
    pub async fn logout(&self) {
        self.inner.scheduler.cancel();
        self.inner.gateway.logout().await;
        self.update(|state| {
            state.user = None;
            state.is_authenticated = false;
            state.is_loading = false;
            state.error = None;
        });
    }

    /// Ask the server who is logged in.
    pub async fn load_user(&self) -> Result<User, AuthError> {
        let result = self.inner.gateway.get_me().await;
        self.update(|state| match &result {
            Ok(user) => {
                state.user = Some(user.clone());
                state.error = None;
            }
            Err(e) => state.error = Some(e.clone()),
        });
        result
    }

    fn finish_sign_in(&self, result: Result<SessionClaims, AuthError>) -> Result<User, AuthError> {
        let result = result.and_then(|claims| {
            User::from_claims(&claims)
                .ok_or_else(|| AuthError::invalid_response("Token does not identify a user"))
        });

        match &result {
            Ok(user) => self.update(|state| {
                state.user = Some(user.clone());
                state.is_authenticated = true;
                state.is_loading = false;
                state.error = None;
                state.retry_after = None;
            }),
            Err(e) => {
                let cooldown = (e.kind == ErrorKind::RateLimit)
                    .then(|| e.retry_after.unwrap_or(DEFAULT_LOGIN_COOLDOWN))
                    .and_then(|delay| chrono::Duration::from_std(delay).ok())
                    .map(|delay| Utc::now() + delay);
                self.update(|state| {
                    state.user = None;
                    state.is_authenticated = false;
                    state.is_loading = false;
                    state.error = Some(e.clone());
                    if cooldown.is_some() {
                        state.retry_after = cooldown;
                    }
                });
            }
        }
        result
    }

    fn authenticated(&self, claims: &SessionClaims) {
        let user = User::from_claims(claims);
        self.update(|state| {
            state.user = user;
            state.is_authenticated = true;
            state.is_loading = false;
            state.error = None;
        });
    }

    // =========================================================================
    // Fast reads
    // =========================================================================

    pub fn access_token(&self) -> Option<String> {
        self.inner.gateway.access_token()
    }

    /// Whether a locally valid session exists. Never touches the network.
    pub fn is_authenticated(&self) -> bool {
        self.claims().is_some()
    }

    pub fn user_role(&self) -> Option<Role> {
        self.claims().and_then(|claims| claims.role())
    }

    /// Cached claims, or the stored token's claims when nothing is cached yet.
    pub fn claims(&self) -> Option<SessionClaims> {
        let validator = self.inner.gateway.validator();
        validator.cached().or_else(|| {
            let token = self.access_token()?;
            validator.inspect(&token).ok()
        })
    }

    /// Remaining login cooldown, if one is active.
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        let until = self.lock().retry_after?;
        (until - Utc::now()).to_std().ok().filter(|d| !d.is_zero())
    }

    /// Snapshot of the auth state, with authentication re-checked locally.
    pub fn state(&self) -> AuthState {
        let authenticated = self.is_authenticated();
        let mut state = self.lock().clone();
        state.is_authenticated = authenticated;
        if !authenticated {
            state.user = None;
        }
        state
    }

    fn update(&self, f: impl FnOnce(&mut AuthState)) {
        f(&mut self.lock());
    }

    fn lock(&self) -> MutexGuard<'_, AuthState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("gateway", &self.inner.gateway)
            .field("state", &*self.lock())
            .finish_non_exhaustive()
    }
}
