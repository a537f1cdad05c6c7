// Authentication module
// Credential freshness, storage, and refresh

mod clock;
mod guard;
mod refresh;
mod store;
mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use guard::{RefreshError, TokenGuard, DEFAULT_REFRESH_MARGIN_SECS};
pub use refresh::{AuthService, HttpAuthService};
pub use store::{CredentialStore, MemoryStore, SqliteStore};
pub use types::{redact, Claims, Credential, TokenData};

// Re-export for testing
#[cfg(test)]
pub(crate) use types::tests::token_expiring_at;
