//! Client configuration.

use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::backoff::RetryConfig;
use crate::scheduler::DEFAULT_LEAD_WINDOW;
use crate::store::DEFAULT_COOKIE_MAX_AGE;

/// Default directory for the persistent token mirror.
pub const DEFAULT_STORAGE_DIR: &str = ".bazaar";

/// Default timeout for a single HTTP exchange.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Everything needed to construct a [`Session`](crate::Session).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API base URL. Always ends with `/` so endpoint paths join below it.
    pub api_base: Url,
    /// Directory of the file-backed token mirror.
    pub storage_dir: PathBuf,
    /// Mark the session cookie `Secure`.
    pub secure_cookies: bool,
    pub lead_window: Duration,
    pub retry: RetryConfig,
    pub request_timeout: Duration,
    pub cookie_max_age: Duration,
}

impl ClientConfig {
    /// Defaults for `api_base`. Cookies are `Secure` when the API is served
    /// over HTTPS.
    pub fn new(mut api_base: Url) -> Self {
        if !api_base.path().ends_with('/') {
            let path = format!("{}/", api_base.path());
            api_base.set_path(&path);
        }
        let secure_cookies = api_base.scheme() == "https";

        Self {
            api_base,
            storage_dir: PathBuf::from(DEFAULT_STORAGE_DIR),
            secure_cookies,
            lead_window: DEFAULT_LEAD_WINDOW,
            retry: RetryConfig::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            cookie_max_age: DEFAULT_COOKIE_MAX_AGE,
        }
    }

    #[must_use]
    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_lead_window(mut self, lead_window: Duration) -> Self {
        self.lead_window = lead_window;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}
