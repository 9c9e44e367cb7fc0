//! Error taxonomy shared by every session component.
//!
//! The taxonomy is flat: one [`ErrorKind`] per failure class, carried by a
//! single [`AuthError`] value. Callers branch on the kind, never on the
//! message text.

use std::time::Duration;

use axum::body::Body;
use axum::http::{Response, StatusCode};
use serde::Deserialize;
use thiserror::Error;

use crate::backoff::retry_after;

/// Error bodies larger than this are not worth reading.
const ERROR_BODY_LIMIT: usize = 64 * 1024;

/// `{"error": "..."}` or `{"message": "..."}`, whichever the server sent.
#[derive(Deserialize)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
}

/// Failure classes surfaced by the session layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The server rejected the email/password pair (401 on login).
    InvalidCredentials,
    /// The server is rate limiting us and retries are exhausted or disabled.
    RateLimit,
    /// No response at all: DNS, connect, reset, timeout.
    NetworkError,
    /// The server answered with something we could not interpret.
    InvalidResponse,
    /// The access token is not a three-segment token with a JSON claims segment.
    MalformedToken,
    /// The access token claims are incomplete or past `exp`.
    TokenExpired,
    /// The session is no longer valid and the user has to log in again.
    Unauthorized,
    /// Anything else, usually a non-auth error status with a server message.
    Unknown,
}

impl ErrorKind {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::RateLimit => "RATE_LIMIT",
            Self::NetworkError => "NETWORK_ERROR",
            Self::InvalidResponse => "INVALID_RESPONSE",
            Self::MalformedToken => "MALFORMED_TOKEN",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Error returned by the gateway, the pipeline and the session facade.
///
/// `Clone` is required: a single in-flight refresh hands the same result to
/// every caller waiting on it.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct AuthError {
    pub kind: ErrorKind,
    pub message: String,
    /// HTTP status of the response that caused the error, if there was one.
    pub status: Option<StatusCode>,
    /// Cooldown requested by the server for `RATE_LIMIT` errors.
    pub retry_after: Option<Duration>,
}

impl AuthError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    pub fn invalid_credentials() -> Self {
        Self::new(ErrorKind::InvalidCredentials, "Invalid email or password")
            .with_status(StatusCode::UNAUTHORIZED)
    }

    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            ..Self::new(ErrorKind::RateLimit, "Too many requests. Please try again later.")
                .with_status(StatusCode::TOO_MANY_REQUESTS)
        }
    }

    pub fn network(err: impl std::fmt::Display) -> Self {
        Self::new(
            ErrorKind::NetworkError,
            format!("Network error, check your connection ({err})"),
        )
    }

    pub fn invalid_response(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidResponse, msg)
    }

    pub fn malformed_token(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::MalformedToken, msg)
    }

    pub fn token_expired() -> Self {
        Self::new(ErrorKind::TokenExpired, "Access token is expired or incomplete")
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, msg).with_status(StatusCode::UNAUTHORIZED)
    }

    pub fn unknown(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, msg)
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    /// Map a non-success response to an error, surfacing the server message.
    ///
    /// 429 becomes `RATE_LIMIT` with the requested cooldown, 401 becomes
    /// `UNAUTHORIZED`, anything else `UNKNOWN`.
    pub async fn from_response(response: Response<Body>) -> Self {
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Self::rate_limited(retry_after(response.headers()));
        }

        let message = server_message(response)
            .await
            .unwrap_or_else(|| format!("Request failed with status {status}"));

        let kind = if status == StatusCode::UNAUTHORIZED {
            ErrorKind::Unauthorized
        } else {
            ErrorKind::Unknown
        };
        Self::new(kind, message).with_status(status)
    }

    /// Map a failed login that is neither 401 nor 429.
    ///
    /// The server's message wins; without one the failure is reported as a
    /// connectivity problem, keeping the status.
    pub async fn from_login_response(response: Response<Body>) -> Self {
        let status = response.status();
        match server_message(response).await {
            Some(message) => Self::unknown(message).with_status(status),
            None => Self::network(format!("login failed with status {status}")).with_status(status),
        }
    }

    /// Whether this error proves the stored session is unusable.
    ///
    /// Connectivity failures and rate limiting say nothing about the session,
    /// so tokens must survive them.
    pub fn is_terminal(&self) -> bool {
        !matches!(self.kind, ErrorKind::NetworkError | ErrorKind::RateLimit)
    }
}

/// The `error` or `message` field of a JSON error body, if there is one.
async fn server_message(response: Response<Body>) -> Option<String> {
    let bytes = axum::body::to_bytes(response.into_body(), ERROR_BODY_LIMIT)
        .await
        .ok()?;
    let body: ErrorBody = serde_json::from_slice(&bytes).ok()?;
    body.error.or(body.message)
}

/// Errors raised by the persistent storage channels.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored value is not valid: {0}")]
    Corrupt(String),
}
