//! Backoff and retry for rate-limited authentication calls.
//!
//! A 429 response is retried after the delay the server asks for in
//! `Retry-After` (delta-seconds or an HTTP date), falling back to an
//! exponentially growing delay when the header is absent. Once the retry
//! budget is spent the call fails with `RATE_LIMIT`.

use std::future::Future;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, Response, StatusCode, header};
use chrono::{DateTime, NaiveDateTime, Utc};
use tokio::time::sleep;
use tracing::warn;

use crate::error::AuthError;

/// Default delay before the first retry.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(1000);

/// Default number of retries after the initial attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Configuration for retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of retries (excluding the initial request).
    pub max_retries: u32,
    /// Delay before the first retry; doubled after every retry.
    pub initial_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay: DEFAULT_INITIAL_DELAY,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }
}

/// Retry state for a single logical call.
#[derive(Debug, Clone)]
pub struct Backoff {
    delay: Duration,
    retries: u32,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            delay: config.initial_delay,
            retries: config.max_retries,
        }
    }

    /// Delay to wait before the next attempt, or `None` when the budget is spent.
    ///
    /// A server-provided delay wins over the computed one, but the computed
    /// delay still doubles.
    pub fn next_delay(&mut self, retry_after: Option<Duration>) -> Option<Duration> {
        if self.retries == 0 {
            return None;
        }
        let wait = retry_after.unwrap_or(self.delay);
        self.delay = self.delay.saturating_mul(2);
        self.retries -= 1;
        Some(wait)
    }

    pub fn retries_left(&self) -> u32 {
        self.retries
    }
}

/// Parse a `Retry-After` value relative to `now`.
///
/// Plain integers are seconds. Anything else is read as an HTTP date in any
/// of its three forms (IMF-fixdate, RFC 850, asctime); dates in the past yield
/// a zero delay.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let retry_at = parse_http_date(value)?;
    let millis = (retry_at - now).num_milliseconds().max(0);
    Some(Duration::from_millis(millis as u64))
}

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        return Some(date.with_timezone(&Utc));
    }
    // asctime pads single-digit days with a space.
    let normalized = value.split_whitespace().collect::<Vec<_>>().join(" ");
    ["%A, %d-%b-%y %H:%M:%S GMT", "%a %b %d %H:%M:%S %Y"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(&normalized, format).ok())
        .map(|naive| naive.and_utc())
}

/// `Retry-After` of a response, relative to the wall clock.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(header::RETRY_AFTER)?.to_str().ok()?;
    parse_retry_after(value, Utc::now())
}

/// Run `attempt` until it yields something other than 429 or the retry budget
/// is exhausted.
pub async fn with_backoff<F, Fut>(config: RetryConfig, mut attempt: F) -> Result<Response<Body>, AuthError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Response<Body>, AuthError>>,
{
    let mut backoff = Backoff::new(config);

    loop {
        let response = attempt().await?;
        if response.status() != StatusCode::TOO_MANY_REQUESTS {
            return Ok(response);
        }

        let requested = retry_after(response.headers());
        let Some(delay) = backoff.next_delay(requested) else {
            return Err(AuthError::rate_limited(requested));
        };

        warn!(
            retries_left = backoff.retries_left(),
            delay_ms = delay.as_millis() as u64,
            "Rate limited, retrying after backoff"
        );
        sleep(delay).await;
    }
}
