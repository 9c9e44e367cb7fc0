//! Where the user is sent when the session cannot be recovered.

use tracing::info;

/// Path of the login entry point.
pub const LOGIN_ENTRY_POINT: &str = "/login";

/// Sends the user to the login entry point.
///
/// Invoked at most once per forced logout.
pub trait LoginRedirect: Send + Sync {
    fn redirect_to_login(&self);
}

/// Default redirect: records the navigation in the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogRedirect;

impl LoginRedirect for LogRedirect {
    fn redirect_to_login(&self) {
        info!(entry_point = LOGIN_ENTRY_POINT, "Session ended, log in again to continue");
    }
}

impl<F> LoginRedirect for F
where
    F: Fn() + Send + Sync,
{
    fn redirect_to_login(&self) {
        self()
    }
}
