use std::process::ExitCode;

use axum::body::Body;
use axum::http::Request;
use bazaar_session::cli::{Args, Command, build_config, build_form, init_logging};
use bazaar_session::transport::reqwest_client;
use bazaar_session::{AuthError, ClientConfig, Session};
use clap::Parser;
use tower::ServiceExt;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    init_logging(&args.log_format);

    let config = build_config(&args);
    let session = match Session::from_config(&config) {
        Ok(session) => session,
        Err(e) => {
            error!(error = %e, "Failed to open session");
            return ExitCode::FAILURE;
        }
    };

    match run(&session, &config, args.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(kind = %e.kind, error = %e, "Command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(
    session: &Session,
    config: &ClientConfig,
    command: Command,
) -> Result<(), AuthError> {
    match command {
        Command::Login { email, password } => {
            let user = session.login(&email, &password).await?;
            println!("Logged in as {} ({})", user.email, user.role.as_str());
        }
        Command::Register {
            email,
            username,
            password,
            fields,
        } => {
            let form = build_form(&email, &username, &password, &fields);
            let user = session.register(&form).await?;
            println!("Registered {} ({})", user.email, user.role.as_str());
        }
        Command::Logout => {
            session.logout().await;
            println!("Logged out");
        }
        Command::Whoami => {
            session.restore().await;
            let user = session.load_user().await?;
            println!("{}", serde_json::to_string_pretty(&user).unwrap_or_default());
        }
        Command::Status => {
            let restored = session.restore().await;
            let state = session.state();
            match (restored, state.user) {
                (true, Some(user)) => {
                    println!("Authenticated as {} ({})", user.email, user.role.as_str())
                }
                _ => println!("Not authenticated"),
            }
            if let Some(claims) = session.claims() {
                info!(exp = ?claims.exp, role = ?claims.role, "Stored session");
            }
        }
        Command::Get { path } => {
            session.restore().await;
            let url = config.api_base.join(path.trim_start_matches('/')).map_err(|e| {
                AuthError::unknown(format!("Invalid path {path}: {e}"))
            })?;
            let request = Request::get(url.as_str())
                .body(Body::empty())
                .map_err(|e| AuthError::unknown(e.to_string()))?;

            let client = session.client(reqwest_client(config)?);
            let response = client.oneshot(request).await?;
            let body = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .map_err(AuthError::network)?;
            println!("{}", String::from_utf8_lossy(&body));
        }
    }
    Ok(())
}
