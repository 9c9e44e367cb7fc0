pub mod backoff;
pub mod claims;
pub mod cli;
pub mod config;
pub mod error;
pub mod form;
pub mod gateway;
pub mod navigation;
pub mod pipeline;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod transport;

pub use backoff::RetryConfig;
pub use claims::{Role, SessionClaims, TokenValidator};
pub use config::ClientConfig;
pub use error::{AuthError, ErrorKind};
pub use form::RegistrationForm;
pub use gateway::{AuthGateway, TokenEvent, User};
pub use navigation::{LogRedirect, LoginRedirect};
pub use pipeline::{AuthLayer, AuthService, RetryMarker};
pub use scheduler::RefreshScheduler;
pub use session::{AuthState, Session};
pub use store::{TokenPair, TokenStore};
pub use transport::HttpClient;
