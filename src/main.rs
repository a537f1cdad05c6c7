use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;

use recipe_session::auth::{
    redact, CredentialStore, HttpAuthService, SqliteStore, SystemClock, TokenData, TokenGuard,
};
use recipe_session::config::{CliArgs, Command, Config};
use recipe_session::http_client::ApiClient;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before clap reads env fallbacks
    dotenvy::dotenv().ok();

    let args = CliArgs::parse();
    let config = Config::load(&args)?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::debug!("Session database: {}", config.session_db.display());

    let store: Arc<dyn CredentialStore> = Arc::new(SqliteStore::open(&config.session_db)?);
    let service = Arc::new(HttpAuthService::new(
        &config.api_url,
        &config.refresh_path,
        store.clone(),
        config.http_connect_timeout,
        config.http_request_timeout,
    )?);
    let guard = TokenGuard::new(
        store.clone(),
        service,
        Arc::new(SystemClock),
        config.token_refresh_threshold,
    );

    match args.command {
        Command::Import {
            access_token,
            refresh_token,
        } => {
            recipe_session::auth::Credential::parse(&access_token)
                .context("Access token is not a decodable bearer token")?;
            store.save(&TokenData {
                access_token,
                refresh_token,
            })?;
            println!("Session stored in {}", config.session_db.display());
        }

        Command::Status => print_status(&guard)?,

        Command::Refresh { force } => {
            if force {
                let credential = guard.refresh().await?;
                println!("Refreshed: {}", credential.redacted());
            } else if guard.should_refresh() {
                guard.ensure_fresh().await?;
                println!("Refreshed");
            } else {
                println!("Credential is fresh, nothing to do");
            }
        }

        Command::Get { path } => {
            let client = ApiClient::new(
                guard,
                &config.api_url,
                config.http_connect_timeout,
                config.http_request_timeout,
                config.http_max_retries,
            )?;

            let response = client.get(&path).await?;
            let body = response.text().await.context("Failed to read response body")?;
            match serde_json::from_str::<serde_json::Value>(&body) {
                Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
                Err(_) => println!("{}", body),
            }
        }

        Command::Logout => {
            store.clear()?;
            println!("Session cleared");
        }
    }

    Ok(())
}

/// Print what is known about the stored session
fn print_status(guard: &TokenGuard) -> Result<()> {
    let Some(token) = guard.store().access_token()? else {
        println!("No session stored");
        return Ok(());
    };

    let Some(credential) = guard.credential() else {
        println!("Stored token {} is not decodable", redact(&token));
        return Ok(());
    };

    println!("  Token:       {}", credential.redacted());
    if let Some(sub) = &credential.claims().sub {
        println!("  Subject:     {}", sub);
    }
    match credential.expires_at() {
        Some(expires_at) => println!("  Expires:     {}", expires_at.to_rfc3339()),
        None => println!("  Expires:     {} (out of range)", credential.claims().exp),
    }
    println!("  Admin:       {}", credential.is_admin());
    println!("  Refresh due: {}", guard.should_refresh());
    println!(
        "  Refreshable: {}",
        guard.store().refresh_token()?.is_some()
    );

    Ok(())
}
