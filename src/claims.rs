//! Access token claim inspection.
//!
//! The client reads the claims segment of the access token to learn who is
//! logged in and when the token expires. It never checks the signature:
//! a successful [`TokenValidator::validate`] is a local shape and expiry
//! pre-check only, NOT proof that the token is authentic. Authorization is
//! enforced by the server on every request; do not use these claims as a
//! trust boundary.

use std::sync::{Mutex, PoisonError};

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::error::AuthError;

/// base64url, padded or not.
const CLAIMS_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Known user roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "USER" => Some(Self::User),
            "ADMIN" => Some(Self::Admin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Admin => "ADMIN",
        }
    }
}

/// Claims decoded from the access token.
///
/// Every field is optional at decode time; [`TokenValidator::validate`]
/// decides whether the set is usable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    #[serde(default, deserialize_with = "id_as_string")]
    pub id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    /// Expiration time (Unix seconds)
    #[serde(default)]
    pub exp: Option<i64>,
}

impl SessionClaims {
    /// The role claim, if it names a known role.
    pub fn role(&self) -> Option<Role> {
        self.role.as_deref().and_then(Role::parse)
    }

    /// Expiry in Unix milliseconds.
    pub fn exp_millis(&self) -> Option<i64> {
        self.exp.map(|exp| exp.saturating_mul(1000))
    }

    pub fn is_expired_at(&self, now_secs: i64) -> bool {
        self.exp.is_none_or(|exp| exp <= now_secs)
    }
}

/// Ids show up both as JSON numbers and strings depending on the backend.
pub(crate) fn id_as_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Decodes access tokens and keeps the last validated claims in memory.
#[derive(Debug, Default)]
pub struct TokenValidator {
    cache: Mutex<Option<SessionClaims>>,
}

impl TokenValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the claims segment of `token` without verifying the signature.
    pub fn decode(token: &str) -> Result<SessionClaims, AuthError> {
        let segments: Vec<&str> = token.split('.').collect();
        if segments.len() != 3 {
            return Err(AuthError::malformed_token(format!(
                "Expected 3 token segments, found {}",
                segments.len()
            )));
        }

        let payload = CLAIMS_ENGINE
            .decode(segments[1])
            .map_err(|e| AuthError::malformed_token(format!("Claims are not base64: {e}")))?;

        serde_json::from_slice(&payload)
            .map_err(|e| AuthError::malformed_token(format!("Claims are not JSON: {e}")))
    }

    /// Check required claims and expiry at `now_secs`. Pure; touches no cache.
    pub fn validate_at(claims: &SessionClaims, now_secs: i64) -> bool {
        let has_email = claims.email.as_deref().is_some_and(|e| !e.is_empty());
        has_email && claims.role().is_some() && !claims.is_expired_at(now_secs)
    }

    /// Check required claims and expiry against the wall clock.
    ///
    /// On success the claims become the cached session claims.
    pub fn validate(&self, claims: &SessionClaims) -> bool {
        if !Self::validate_at(claims, now_secs()) {
            return false;
        }
        *self.lock() = Some(claims.clone());
        true
    }

    /// Decode and validate in one step.
    pub fn inspect(&self, token: &str) -> Result<SessionClaims, AuthError> {
        let claims = Self::decode(token)?;
        if self.validate(&claims) {
            Ok(claims)
        } else {
            debug!(exp = ?claims.exp, "Access token failed validation");
            Err(AuthError::token_expired())
        }
    }

    /// Cached claims, never returned past their own `exp`.
    pub fn cached(&self) -> Option<SessionClaims> {
        let mut cache = self.lock();
        if cache.as_ref().is_some_and(|c| c.is_expired_at(now_secs())) {
            *cache = None;
        }
        cache.clone()
    }

    pub fn user_role(&self) -> Option<Role> {
        self.cached().and_then(|c| c.role())
    }

    pub fn clear(&self) {
        *self.lock() = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<SessionClaims>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Current Unix time in seconds.
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
