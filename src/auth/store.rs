// Credential storage: in-memory and SQLite-backed

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, RwLock};

use super::types::TokenData;

const ACCESS_TOKEN_KEY: &str = "session:access_token";
const REFRESH_TOKEN_KEY: &str = "session:refresh_token";

/// Where the session's tokens live
///
/// Implementations must be cheap to read; the freshness guard reads the
/// access token on every outbound request.
pub trait CredentialStore: Send + Sync {
    fn access_token(&self) -> Result<Option<String>>;

    fn refresh_token(&self) -> Result<Option<String>>;

    /// Replace the access token. A `None` refresh token keeps the stored one.
    fn save(&self, tokens: &TokenData) -> Result<()>;

    fn clear(&self) -> Result<()>;
}

/// Process-local store
#[derive(Debug, Default)]
pub struct MemoryStore {
    tokens: RwLock<Option<TokenData>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tokens(tokens: TokenData) -> Self {
        Self {
            tokens: RwLock::new(Some(tokens)),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Option<TokenData>> {
        self.tokens.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl CredentialStore for MemoryStore {
    fn access_token(&self) -> Result<Option<String>> {
        Ok(self.read().as_ref().map(|t| t.access_token.clone()))
    }

    fn refresh_token(&self) -> Result<Option<String>> {
        Ok(self.read().as_ref().and_then(|t| t.refresh_token.clone()))
    }

    fn save(&self, tokens: &TokenData) -> Result<()> {
        let mut current = self.tokens.write().unwrap_or_else(|e| e.into_inner());
        let refresh_token = tokens
            .refresh_token
            .clone()
            .or_else(|| current.as_ref().and_then(|t| t.refresh_token.clone()));
        *current = Some(TokenData {
            access_token: tokens.access_token.clone(),
            refresh_token,
        });
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.tokens.write().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}

/// Store persisted in a SQLite key/value table
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the session database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create session directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS auth_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )
        .context("Failed to create auth_kv table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row("SELECT value FROM auth_kv WHERE key = ?", [key], |row| {
            row.get(0)
        })
        .optional()
        .with_context(|| format!("Failed to read {} from SQLite", key))
    }
}

impl CredentialStore for SqliteStore {
    fn access_token(&self) -> Result<Option<String>> {
        self.get(ACCESS_TOKEN_KEY)
    }

    fn refresh_token(&self) -> Result<Option<String>> {
        self.get(REFRESH_TOKEN_KEY)
    }

    fn save(&self, tokens: &TokenData) -> Result<()> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction().context("Failed to begin SQLite transaction")?;

        tx.execute(
            "INSERT OR REPLACE INTO auth_kv (key, value) VALUES (?, ?)",
            [ACCESS_TOKEN_KEY, tokens.access_token.as_str()],
        )
        .context("Failed to store access token")?;

        if let Some(ref refresh_token) = tokens.refresh_token {
            tx.execute(
                "INSERT OR REPLACE INTO auth_kv (key, value) VALUES (?, ?)",
                [REFRESH_TOKEN_KEY, refresh_token.as_str()],
            )
            .context("Failed to store refresh token")?;
        }

        tx.commit().context("Failed to commit session tokens")
    }

    fn clear(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "DELETE FROM auth_kv WHERE key IN (?, ?)",
            [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY],
        )
        .context("Failed to clear session tokens")?;
        Ok(())
    }
}
