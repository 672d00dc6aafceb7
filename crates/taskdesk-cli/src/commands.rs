//! Subcommand implementations.
//!
//! Each command is a thin collaborator of `SessionClient`: it issues calls,
//! prints what comes back, and lets the session layer deal with expired
//! credentials.

use std::io::{self, Write};

use anyhow::{Context, Result};
use taskdesk_core::{ApiError, ApiResponse, Config, Method, SessionClient};
use tracing::info;

pub const TASKS_PATH: &str = "/api/taches/";
pub const PROJECTS_PATH: &str = "/api/projects/";
pub const PROFILE_PATH: &str = "/api/profil/";

pub async fn login(client: &SessionClient, config: &Config, username: Option<String>) -> Result<()> {
    let username = match username.or_else(|| config.last_username.clone()) {
        Some(u) => u,
        None => prompt("Username: ")?,
    };
    let password = rpassword::prompt_password(format!("Password for {}: ", username))
        .context("Failed to read password")?;

    match client.authenticate(&username, &password).await {
        Ok(_) => {}
        Err(ApiError::Unauthorized) => anyhow::bail!("Invalid username or password"),
        Err(e) => return Err(e).context("Login failed"),
    }

    if let Err(e) = Config::remember_username(&username) {
        tracing::warn!(error = %e, "Failed to save config");
    }

    info!(username = %username, "Login complete");
    eprintln!("Logged in as {}", username);
    Ok(())
}

pub fn logout(client: &SessionClient) -> Result<()> {
    client.logout().context("Failed to clear stored credentials")?;
    eprintln!("Logged out");
    Ok(())
}

pub fn status(client: &SessionClient) -> Result<()> {
    let status = client.status().context("Failed to read stored credentials")?;

    println!("API:         {}", client.base_url());
    println!("Credentials: {}", status.backend);
    if !status.authenticated {
        println!("Session:     not logged in");
        return Ok(());
    }
    match status.minutes_until_expiry() {
        Some(0) => println!("Session:     access expired (renewed on next request)"),
        Some(minutes) => println!("Session:     active, access expires in {}m", minutes),
        None => println!("Session:     active"),
    }
    println!("Refresh:     {}", if status.has_refresh { "stored" } else { "none" });
    Ok(())
}

pub async fn request(client: &SessionClient, method: &str, path: &str, data: Option<&str>) -> Result<()> {
    let method: Method = method
        .to_ascii_uppercase()
        .parse()
        .with_context(|| format!("Invalid HTTP method '{}'", method))?;
    let body = data
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .context("--data is not valid JSON")?;

    let response = client.request(method, path, body.as_ref()).await?;
    print_response(&response)
}

pub async fn show(client: &SessionClient, path: &str) -> Result<()> {
    let value: serde_json::Value = client.get_json(path).await?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn print_response(response: &ApiResponse) -> Result<()> {
    if response.body().is_empty() {
        eprintln!("{}", response.status());
        return Ok(());
    }
    match serde_json::from_slice::<serde_json::Value>(response.body()) {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Err(_) => println!("{}", response.text()),
    }
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    eprint!("{}", label);
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line).context("Failed to read input")?;
    let value = line.trim().to_string();
    if value.is_empty() {
        anyhow::bail!("No username given");
    }
    Ok(value)
}
