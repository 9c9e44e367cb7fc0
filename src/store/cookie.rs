//! First-party cookie channel.
//!
//! Holds the authoritative copy of the session tokens for the lifetime of the
//! process, with the same attributes the browser cookie carries: a 7-day
//! `Max-Age`, `SameSite=Strict`, and `Secure` when talking to an HTTPS API.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Cookie name for the session. The value is the whole token pair, encoded
/// as base64url JSON, so both tokens are always written and cleared together.
pub const SESSION_COOKIE_NAME: &str = "session_tokens";

/// Cookie name under which the refresh token is presented to the server.
pub const REFRESH_COOKIE_NAME: &str = "refresh_token";

/// Default cookie lifetime: 7 days.
pub const DEFAULT_COOKIE_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// A cookie as stored in the jar.
#[derive(Clone)]
pub struct Cookie {
    pub name: &'static str,
    pub value: String,
    pub max_age: Duration,
    pub secure: bool,
    expires_at: DateTime<Utc>,
}

impl Cookie {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Renders the cookie the way a server would send it in `Set-Cookie`.
impl std::fmt::Display for Cookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secure = if self.secure { "; Secure" } else { "" };
        write!(
            f,
            "{}={}; SameSite=Strict; Path=/; Max-Age={}{}",
            self.name,
            self.value,
            self.max_age.as_secs(),
            secure
        )
    }
}

impl std::fmt::Debug for Cookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cookie")
            .field("name", &self.name)
            .field("value", &"[REDACTED]")
            .field("max_age", &self.max_age)
            .field("secure", &self.secure)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Single-cookie jar for the session cookie.
#[derive(Debug)]
pub struct CookieJar {
    max_age: Duration,
    secure: bool,
    slot: Mutex<Option<Cookie>>,
}

impl CookieJar {
    pub fn new(max_age: Duration, secure: bool) -> Self {
        Self {
            max_age,
            secure,
            slot: Mutex::new(None),
        }
    }

    /// Store `value`, replacing any previous cookie.
    pub fn set(&self, value: impl Into<String>) {
        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(self.max_age)
            .ok()
            .and_then(|age| now.checked_add_signed(age))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        *self.lock() = Some(Cookie {
            name: SESSION_COOKIE_NAME,
            value: value.into(),
            max_age: self.max_age,
            secure: self.secure,
            expires_at,
        });
    }

    /// Current cookie value. An expired cookie is dropped, as a browser would.
    pub fn get(&self) -> Option<String> {
        self.cookie().map(|c| c.value)
    }

    /// Current cookie with its attributes.
    pub fn cookie(&self) -> Option<Cookie> {
        let mut slot = self.lock();
        if slot.as_ref().is_some_and(|c| c.is_expired(Utc::now())) {
            *slot = None;
        }
        slot.clone()
    }

    /// Remove the cookie. Returns whether one was present.
    pub fn remove(&self) -> bool {
        self.lock().take().is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Cookie>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for CookieJar {
    fn default() -> Self {
        Self::new(DEFAULT_COOKIE_MAX_AGE, true)
    }
}
