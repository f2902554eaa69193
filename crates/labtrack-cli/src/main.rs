//! Labtrack CLI - command-line access to the labtrack backend.
//!
//! Logs in, shows the current session and landing route, and issues
//! authenticated GET requests through the same session layer the
//! mobile client uses.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use labtrack_core::auth::{FileStore, KeyValueStore, KeyringStore};
use labtrack_core::config::StorageBackend;
use labtrack_core::{AuthClient, AuthClientBuilder, Config, Navigator, Route, SessionStatus};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Directory for daily log files; stderr logging when unset
const LOG_DIR_ENV: &str = "LABTRACK_LOG_DIR";

const USAGE: &str = "\
Usage: labtrack <command>

Commands:
  status          Show session status, profile and landing route
  login [EMAIL]   Log in (password is prompted)
  logout          End the session and clear stored credentials
  get PATH        Send an authenticated GET and print the JSON body
";

/// Initialize the tracing subscriber for logging.
/// The returned guard must be held for the life of the process.
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    match std::env::var(LOG_DIR_ENV) {
        Ok(dir) if !dir.is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "labtrack.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .with(filter)
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(filter)
                .init();
            None
        }
    }
}

/// Tells the user to log in again when the session ends.
struct TerminalNavigator;

impl Navigator for TerminalNavigator {
    fn present(&self, route: Route) {
        if route == Route::Login {
            eprintln!("Session ended. Run `labtrack login` to sign in again.");
        }
    }
}

fn storage_backend(config: &Config) -> Result<Arc<dyn KeyValueStore>> {
    Ok(match config.storage {
        StorageBackend::File => Arc::new(FileStore::in_dir(&config.data_dir()?)),
        StorageBackend::Keyring => Arc::new(KeyringStore::new()),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        eprint!("{}", USAGE);
        std::process::exit(2);
    };

    let mut config = Config::load().context("Failed to load configuration")?;
    let backend = storage_backend(&config)?;
    let (client, _) = AuthClientBuilder::from_config(&config)
        .navigator(Arc::new(TerminalNavigator))
        .build(backend)
        .await
        .context("Failed to load stored session")?;
    info!(status = %client.status(), base_url = client.base_url(), "Session loaded");

    match command {
        "status" => print_status(&client).await,
        "login" => login(&client, &mut config, args.get(1).cloned()).await,
        "logout" => {
            client.logout().await?;
            println!("Logged out.");
            Ok(())
        }
        "get" => {
            let path = args.get(1).context("get requires a PATH")?;
            let body: serde_json::Value = client.get_json(path).await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(())
        }
        _ => {
            eprint!("{}", USAGE);
            std::process::exit(2);
        }
    }
}

async fn print_status(client: &AuthClient) -> Result<()> {
    let status = client.status();
    println!("Status: {}", status);
    if status == SessionStatus::LoggedIn {
        if let Some(profile) = client.profile().await? {
            println!("User:   {} <{}>", profile.full_name(), profile.email);
            println!("Role:   {}", profile.role);
        }
    }
    println!("Route:  {}", client.initial_route().await?);
    Ok(())
}

async fn login(client: &AuthClient, config: &mut Config, email: Option<String>) -> Result<()> {
    let email = match email.or_else(|| config.last_email.clone()) {
        Some(email) => email,
        None => prompt("Email: ")?,
    };
    let password = rpassword::prompt_password("Password: ")?;

    println!("\nAuthenticating...");
    let profile = client.login(&email, &password).await?;

    config.last_email = Some(email);
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }

    println!("Welcome, {} ({}).", profile.full_name(), profile.role);
    println!("Home: {}", client.initial_route().await?);
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}
