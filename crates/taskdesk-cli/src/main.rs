//! taskdesk - command line client for the taskdesk task-management API.
//!
//! Every API call goes through the core `SessionClient`, so an expired
//! access credential is renewed transparently and a dead session sends the
//! user back to `taskdesk login`.

mod cli;
mod commands;

use std::io;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use taskdesk_core::{Config, LogoutTrigger, SessionClient};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Cli, Command};

/// Log file name inside the configured log directory
const LOG_FILE: &str = "taskdesk.log";

/// Initialize the tracing subscriber for logging.
/// The returned guard flushes the log file on drop.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::never(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

/// Tells the user the session is gone; the credentials are already cleared.
struct CliLogout;

impl LogoutTrigger for CliLogout {
    fn force_logout(&self) {
        eprintln!("Your session has expired. Run `taskdesk login` to sign in again.");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let mut config = Config::load()?;
    if let Some(url) = cli.base_url {
        config.base_url = url;
    }

    let _log_guard = init_tracing(config.log_dir.as_deref());
    info!(base_url = %config.base_url, backend = ?config.credential_backend, "taskdesk starting");

    let client = SessionClient::from_config(&config, Arc::new(CliLogout))?;

    match cli.command {
        Command::Login { username } => commands::login(&client, &config, username).await,
        Command::Logout => commands::logout(&client),
        Command::Status => commands::status(&client),
        Command::Request { method, path, data } => {
            commands::request(&client, &method, &path, data.as_deref()).await
        }
        Command::Tasks => commands::show(&client, commands::TASKS_PATH).await,
        Command::Projects => commands::show(&client, commands::PROJECTS_PATH).await,
        Command::Profile => commands::show(&client, commands::PROFILE_PATH).await,
    }
}
