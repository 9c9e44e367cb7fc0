//! Token persistence across two channels.
//!
//! The cookie is authoritative. The key-value fallback is a recovery mirror:
//! writes to it may fail without failing the store, and when the cookie is
//! missing the mirror is used to rebuild it (read-repair). All mutation goes
//! through [`TokenStore::set`] and [`TokenStore::clear`], so the channels never
//! hold halves of different pairs.

mod cookie;
mod fallback;

pub use cookie::{
    Cookie, CookieJar, DEFAULT_COOKIE_MAX_AGE, REFRESH_COOKIE_NAME, SESSION_COOKIE_NAME,
};
pub use fallback::{FALLBACK_KEY, FileStore, KeyValueStore, MemoryStore};

use std::sync::{Mutex, PoisonError};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Access and refresh token, always stored and cleared together.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl TokenPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }

    /// Compact encoding used as the cookie value.
    fn to_cookie_value(&self) -> Option<String> {
        serde_json::to_vec(self)
            .ok()
            .map(|json| URL_SAFE_NO_PAD.encode(json))
    }

    fn from_cookie_value(value: &str) -> Option<Self> {
        let json = URL_SAFE_NO_PAD.decode(value).ok()?;
        serde_json::from_slice(&json).ok()
    }
}

impl std::fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .finish()
    }
}

/// Token persistence with an authoritative cookie and a fallback mirror.
pub struct TokenStore {
    cookie: CookieJar,
    fallback: Box<dyn KeyValueStore>,
    write_lock: Mutex<()>,
}

impl TokenStore {
    pub fn new(cookie: CookieJar, fallback: impl KeyValueStore + 'static) -> Self {
        Self {
            cookie,
            fallback: Box::new(fallback),
            write_lock: Mutex::new(()),
        }
    }

    /// Store with an in-memory fallback. Nothing survives the process.
    pub fn in_memory() -> Self {
        Self::new(CookieJar::default(), MemoryStore::new())
    }

    /// Write the cookie, then mirror into the fallback.
    ///
    /// A failed mirror write is logged and swallowed.
    pub fn set(&self, pair: &TokenPair) {
        let _guard = self.lock();

        match pair.to_cookie_value() {
            Some(value) => self.cookie.set(value),
            None => warn!("Failed to encode session cookie"),
        }

        match serde_json::to_string(pair) {
            Ok(json) => {
                if let Err(e) = self.fallback.set(FALLBACK_KEY, &json) {
                    warn!(error = %e, "Failed to mirror tokens to fallback storage");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize tokens for fallback storage"),
        }
    }

    /// Read the cookie; if absent, recover from the fallback and repair the
    /// cookie before returning.
    pub fn get(&self) -> Option<TokenPair> {
        let _guard = self.lock();

        if let Some(pair) = self
            .cookie
            .get()
            .as_deref()
            .and_then(TokenPair::from_cookie_value)
        {
            return Some(pair);
        }

        let pair = match self.fallback.get(FALLBACK_KEY) {
            Ok(Some(json)) => match serde_json::from_str::<TokenPair>(&json) {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "Discarding unreadable fallback tokens");
                    return None;
                }
            },
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Failed to read fallback storage");
                return None;
            }
        };

        debug!("Session cookie missing, repairing from fallback storage");
        if let Some(value) = pair.to_cookie_value() {
            self.cookie.set(value);
        }
        Some(pair)
    }

    /// Remove both channels. Returns whether either held a value.
    pub fn clear(&self) -> bool {
        let _guard = self.lock();

        let had_cookie = self.cookie.remove();
        let had_fallback = match self.fallback.remove(FALLBACK_KEY) {
            Ok(removed) => removed,
            Err(e) => {
                warn!(error = %e, "Failed to clear fallback storage");
                false
            }
        };
        had_cookie || had_fallback
    }

    /// The session cookie with its attributes, if present.
    pub fn cookie(&self) -> Option<Cookie> {
        self.cookie.cookie()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore")
            .field("cookie", &self.cookie)
            .finish_non_exhaustive()
    }
}
