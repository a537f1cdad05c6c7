use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::auth::DEFAULT_REFRESH_MARGIN_SECS;

/// recipe-session - session tool for the recipe web front end
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Backend API base URL
    #[arg(short = 'u', long, env = "RECIPE_API_URL", default_value = "http://localhost:8080")]
    pub api_url: String,

    /// Path to the session SQLite database
    #[arg(short = 'd', long, env = "RECIPE_SESSION_DB")]
    pub session_db: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "60")]
    pub http_timeout: u64,

    /// HTTP max retries
    #[arg(long, env = "HTTP_MAX_RETRIES", default_value = "3")]
    pub http_retries: u32,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Store a token pair obtained from a login
    Import {
        #[arg(long)]
        access_token: String,
        #[arg(long)]
        refresh_token: Option<String>,
    },

    /// Show the stored credential and whether it is due for refresh
    Status,

    /// Refresh the credential if it is due
    Refresh {
        /// Refresh even if the credential is not due yet
        #[arg(long)]
        force: bool,
    },

    /// Authenticated GET of a backend path, printing the body
    Get { path: String },

    /// Remove the stored session
    Logout,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Backend
    pub api_url: String,
    pub refresh_path: String,

    // Session storage
    pub session_db: PathBuf,

    // Timeouts
    pub token_refresh_threshold: u64,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,
    pub http_max_retries: u32,

    // Front end
    pub login_path: String,

    // Logging
    pub log_level: String,
}

impl Config {
    /// Load configuration with priority: CLI > ENV > defaults
    ///
    /// The caller loads `.env` before parsing `args`.
    pub fn load(args: &CliArgs) -> Result<Self> {
        let session_db = args
            .session_db
            .as_deref()
            .map(expand_tilde)
            .or_else(default_session_db)
            .context("RECIPE_SESSION_DB is required (use -d or set RECIPE_SESSION_DB env var)")?;

        let config = Config {
            api_url: args.api_url.clone(),

            refresh_path: std::env::var("REFRESH_PATH")
                .unwrap_or_else(|_| "/auth/refresh".to_string()),

            session_db,

            token_refresh_threshold: std::env::var("TOKEN_REFRESH_THRESHOLD")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_REFRESH_MARGIN_SECS),

            http_connect_timeout: std::env::var("HTTP_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30),

            http_request_timeout: args.http_timeout,

            http_max_retries: args.http_retries,

            login_path: std::env::var("LOGIN_PATH").unwrap_or_else(|_| "/login".to_string()),

            log_level: args.log_level.clone(),
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.api_url)
            .with_context(|| format!("RECIPE_API_URL is not a valid URL: {}", self.api_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("RECIPE_API_URL must use http or https: {}", self.api_url);
        }

        if !self.refresh_path.starts_with('/') {
            anyhow::bail!("REFRESH_PATH must start with '/': {}", self.refresh_path);
        }

        if !self.login_path.starts_with('/') {
            anyhow::bail!("LOGIN_PATH must start with '/': {}", self.login_path);
        }

        Ok(())
    }
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Per-user data directory location of the session database
fn default_session_db() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("recipe-session").join("session.sqlite3"))
}
