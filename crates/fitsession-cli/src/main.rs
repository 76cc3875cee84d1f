//! fitsession - command line front end for the fitness tracker session.
//!
//! Signs in (email/password or OAuth), shows who is signed in, issues
//! authenticated requests against the backend and keeps tokens fresh while
//! `watch` is running. Session tokens persist between runs.

mod navigator;

use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fitsession_core::{Config, ProfileClient, RefreshCheck, RequestOptions, SessionManager};
use reqwest::Method;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

use navigator::TerminalNavigator;

#[derive(Parser)]
#[command(name = "fitsession", version, about = "Fitness tracker session client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in with email and password
    Login {
        /// Account email (defaults to the last one used)
        #[arg(long)]
        email: Option<String>,
    },
    /// Start an OAuth sign-in and print the authorization URL
    Oauth {
        /// Provider name, e.g. google
        #[arg(default_value = "google")]
        provider: String,
        /// Path to return to once sign-in completes
        #[arg(long, default_value = "/dashboard")]
        return_to: String,
    },
    /// Finish an OAuth sign-in from the URL the backend redirected to
    Callback {
        /// Landing URL carrying accessToken and refreshToken query parameters
        url: String,
    },
    /// Show the signed-in user
    Whoami,
    /// Sign out and forget stored tokens
    Logout,
    /// Refresh the access token now
    Refresh,
    /// Send an authenticated request and print the response
    Request {
        /// HTTP method
        method: String,
        /// Path under the API base URL, e.g. /api/v1/fitness/profile
        path: String,
        /// JSON request body
        #[arg(long)]
        data: Option<String>,
    },
    /// Show the fitness profile
    Profile,
    /// Keep the session fresh and print identity changes until Ctrl+C
    Watch,
}

/// Log file name prefix in the data directory
const LOG_FILE_PREFIX: &str = "fitsession";

/// Initialize logging: stderr plus a daily log file when a directory is available.
/// Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let appender = log_dir.and_then(|dir| {
        RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(LOG_FILE_PREFIX)
            .filename_suffix("log")
            .build(dir)
            .ok()
    });
    let (file_layer, guard) = match appender {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let mut config = Config::load()?;

    let log_dir = config.data_dir().ok().map(|dir| dir.join("logs"));
    let _guard = init_tracing(log_dir.as_deref());
    info!("fitsession starting");

    let return_to = match cli.command {
        Command::Oauth { ref return_to, .. } => return_to.clone(),
        _ => "/".to_string(),
    };

    let session = SessionManager::new(
        config.auth_api()?,
        config.open_store()?,
        Arc::new(TerminalNavigator::new(return_to)),
        config.session_settings(),
    );
    session.initialize().await;

    match cli.command {
        Command::Login { email } => login(&session, &mut config, email).await,
        Command::Oauth { provider, .. } => {
            session.login_with_redirect(&provider)?;
            Ok(())
        }
        Command::Callback { url } => {
            let url = Url::parse(&url).context("Invalid callback URL")?;
            let identity = session.complete_oauth_callback(&url)?;
            println!("Signed in as {} <{}>", identity.display_name(), identity.email);
            println!("Continue at {}", session.take_return_path());
            Ok(())
        }
        Command::Whoami => {
            whoami(&session);
            Ok(())
        }
        Command::Logout => {
            session.logout();
            println!("Signed out");
            Ok(())
        }
        Command::Refresh => {
            session.refresh().await?;
            whoami(&session);
            Ok(())
        }
        Command::Request { method, path, data } => request(&session, &method, &path, data).await,
        Command::Profile => {
            let profile = ProfileClient::new(&session).get().await?;
            println!("{}", serde_json::to_string_pretty(&profile)?);
            Ok(())
        }
        Command::Watch => watch(&session).await,
    }
}

async fn login(session: &SessionManager, config: &mut Config, email: Option<String>) -> Result<()> {
    let email = match email.or_else(|| config.last_email.clone()) {
        Some(email) => email,
        None => prompt("Email: ")?,
    };
    let password = rpassword::prompt_password("Password: ").context("Failed to read password")?;

    let identity = session.login_with_credentials(&email, &password).await?;
    println!("Signed in as {} <{}>", identity.display_name(), identity.email);

    config.last_email = Some(identity.email);
    if let Err(e) = config.save() {
        tracing::warn!(error = %e, "Failed to save config");
    }
    Ok(())
}

fn whoami(session: &SessionManager) {
    match session.user() {
        Some(user) => {
            println!("{} <{}>", user.display_name(), user.email);
            println!("  id:       {}", user.id);
            if let Some(ref provider) = user.provider {
                println!("  provider: {}", provider);
            }
            if let Some(expires_at) = session.expires_at() {
                println!("  expires:  {}", expires_at.to_rfc3339());
            }
        }
        None => println!("Not signed in"),
    }
}

async fn request(session: &SessionManager, method: &str, path: &str, data: Option<String>) -> Result<()> {
    let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .with_context(|| format!("Invalid HTTP method: {}", method))?;
    let mut options = RequestOptions::new(method);
    if let Some(data) = data {
        options = options.json(serde_json::from_str(&data).context("Request body is not valid JSON")?);
    }

    let response = session.authenticated_request(path, options).await?;
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    println!("{}", status);
    match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) if !body.is_empty() => println!("{}", body),
        Err(_) => {}
    }
    Ok(())
}

async fn watch(session: &SessionManager) -> Result<()> {
    let subscription = session.subscribe(|identity| match identity {
        Some(user) => println!("Signed in as {} <{}>", user.display_name(), user.email),
        None => println!("Signed out"),
    });

    match session.check_expiry().await {
        RefreshCheck::Refreshed => println!("Access token refreshed"),
        RefreshCheck::Failed => println!("Access token refresh failed"),
        RefreshCheck::NotNeeded | RefreshCheck::AlreadyPending => {}
    }

    let task = session.spawn_refresh_task();
    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;

    task.abort();
    subscription.unsubscribe();
    info!("fitsession watch stopped");
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}
