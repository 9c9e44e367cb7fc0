//! CLI argument parsing and startup helpers.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use url::Url;

use crate::backoff::{DEFAULT_MAX_RETRIES, RetryConfig};
use crate::config::ClientConfig;
use crate::form::RegistrationForm;

#[derive(clap::ValueEnum, Clone, Debug, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "bazaar-session",
    about = "Log in to a Bazaar API and issue authenticated requests"
)]
pub struct Args {
    /// API base URL (e.g., "https://api.bazaar.example/")
    #[arg(long, env = "BAZAAR_API_URL", value_parser = validate_api_url)]
    pub api_url: Url,

    /// Directory for the persistent token mirror
    #[arg(long, env = "BAZAAR_STORAGE_DIR", default_value = crate::config::DEFAULT_STORAGE_DIR)]
    pub storage_dir: PathBuf,

    /// Refresh this many seconds before the access token expires
    #[arg(long, default_value = "300")]
    pub lead_window_secs: u64,

    /// Retries after a rate-limited response
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    /// Delay before the first retry, doubled after each one
    #[arg(long, default_value = "1000")]
    pub initial_backoff_ms: u64,

    /// Log output format
    #[arg(short, long, default_value = "pretty")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Log in with email and password
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "BAZAAR_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Create an account and log in
    Register {
        #[arg(long)]
        email: String,
        #[arg(long)]
        username: String,
        #[arg(long, env = "BAZAAR_PASSWORD", hide_env_values = true)]
        password: String,
        /// Extra form field, as key=value
        #[arg(long = "field", value_parser = parse_field)]
        fields: Vec<(String, String)>,
    },
    /// Log out and forget stored tokens
    Logout,
    /// Ask the server who is logged in
    Whoami,
    /// Show the stored session without contacting the server
    Status,
    /// Authenticated GET of a path below the API base
    Get { path: String },
}

fn validate_api_url(s: &str) -> Result<Url, String> {
    let url = Url::parse(s).map_err(|e| format!("Invalid API URL {s}: {e}"))?;
    if url.scheme() != "https" && url.scheme() != "http" {
        return Err(format!("API URL must be http or https: {s}"));
    }
    Ok(url)
}

fn parse_field(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("Expected key=value: {s}"))?;
    if key.is_empty() {
        return Err(format!("Field name must not be empty: {s}"));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Initialize logging based on the specified format.
///
/// The filter comes from `RUST_LOG` and defaults to `info`.
pub fn init_logging(format: &LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
        LogFormat::Compact => builder.compact().init(),
    }
}

/// Build ClientConfig from parsed arguments.
pub fn build_config(args: &Args) -> ClientConfig {
    let retry = RetryConfig::new()
        .with_max_retries(args.max_retries)
        .with_initial_delay(Duration::from_millis(args.initial_backoff_ms));

    ClientConfig::new(args.api_url.clone())
        .with_storage_dir(&args.storage_dir)
        .with_lead_window(Duration::from_secs(args.lead_window_secs))
        .with_retry(retry)
}

/// Registration form from the `register` subcommand.
pub fn build_form(
    email: &str,
    username: &str,
    password: &str,
    fields: &[(String, String)],
) -> RegistrationForm {
    let form = RegistrationForm::new(email, username, password);
    fields
        .iter()
        .fold(form, |form, (key, value)| form.text(key, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_field() {
        assert_eq!(
            parse_field("city=Lisbon").unwrap(),
            ("city".to_string(), "Lisbon".to_string())
        );
        assert_eq!(parse_field("note=a=b").unwrap().1, "a=b");
        assert!(parse_field("novalue").is_err());
        assert!(parse_field("=x").is_err());
    }

    #[test]
    fn test_validate_api_url() {
        assert!(validate_api_url("https://api.bazaar.test/").is_ok());
        assert!(validate_api_url("ftp://api.bazaar.test/").is_err());
        assert!(validate_api_url("not a url").is_err());
    }

    #[test]
    fn test_build_config_from_args() {
        let args = Args::parse_from([
            "bazaar-session",
            "--api-url",
            "https://api.bazaar.test/v2",
            "--max-retries",
            "5",
            "--initial-backoff-ms",
            "250",
            "--lead-window-secs",
            "60",
            "status",
        ]);
        let config = build_config(&args);

        assert_eq!(config.api_base.as_str(), "https://api.bazaar.test/v2/");
        assert!(config.secure_cookies);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.initial_delay, Duration::from_millis(250));
        assert_eq!(config.lead_window, Duration::from_secs(60));
        assert!(matches!(args.command, Command::Status));
    }

    #[test]
    fn test_register_fields() {
        let args = Args::parse_from([
            "bazaar-session",
            "--api-url",
            "http://localhost:8080/",
            "register",
            "--email",
            "a@b.c",
            "--username",
            "a",
            "--password",
            "pw",
            "--field",
            "city=Porto",
        ]);
        let Command::Register { fields, .. } = args.command else {
            panic!("expected register");
        };
        assert_eq!(fields, vec![("city".to_string(), "Porto".to_string())]);
    }
}
