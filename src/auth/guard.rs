// Token freshness guard
// Proactive refresh with one in-flight refresh shared by all callers

use chrono::Duration;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use thiserror::Error;

use super::clock::Clock;
use super::refresh::AuthService;
use super::store::CredentialStore;
use super::types::Credential;

/// Default safety margin before expiry (5 minutes)
pub const DEFAULT_REFRESH_MARGIN_SECS: u64 = 300;

/// A failed refresh, broadcast to every caller of the same cycle
///
/// Cloning shares the original cause; two values compare equal only when
/// they come from the same refresh attempt.
#[derive(Debug, Clone, Error)]
#[error("Token refresh failed: {cause:#}")]
pub struct RefreshError {
    cause: Arc<anyhow::Error>,
}

impl RefreshError {
    fn new(cause: anyhow::Error) -> Self {
        Self {
            cause: Arc::new(cause),
        }
    }

    /// The underlying network or auth error
    pub fn cause(&self) -> &anyhow::Error {
        &self.cause
    }
}

impl PartialEq for RefreshError {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cause, &other.cause)
    }
}

impl Eq for RefreshError {}

type RefreshOutcome = Shared<BoxFuture<'static, Result<Credential, RefreshError>>>;

enum RefreshState {
    Idle,
    Refreshing { cycle: u64, outcome: RefreshOutcome },
}

/// Gates outgoing API calls on credential freshness
///
/// Cloning is cheap and every clone shares the same in-flight refresh.
#[derive(Clone)]
pub struct TokenGuard {
    store: Arc<dyn CredentialStore>,
    service: Arc<dyn AuthService>,
    clock: Arc<dyn Clock>,
    margin: Duration,
    state: Arc<Mutex<RefreshState>>,
    cycles: Arc<AtomicU64>,
}

impl TokenGuard {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        service: Arc<dyn AuthService>,
        clock: Arc<dyn Clock>,
        margin_secs: u64,
    ) -> Self {
        Self {
            store,
            service,
            clock,
            margin: Duration::seconds(margin_secs as i64),
            state: Arc::new(Mutex::new(RefreshState::Idle)),
            cycles: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    /// Stored access credential, if present and decodable
    pub fn credential(&self) -> Option<Credential> {
        let token = match self.store.access_token() {
            Ok(token) => token?,
            Err(e) => {
                tracing::warn!("Failed to read access token: {:#}", e);
                return None;
            }
        };

        match Credential::parse(&token) {
            Ok(credential) => Some(credential),
            Err(e) => {
                tracing::debug!("Stored access token is not decodable: {:#}", e);
                None
            }
        }
    }

    /// Whether the stored credential is within the safety margin of expiry
    ///
    /// An absent or malformed credential is reported as `false`: there is
    /// nothing to refresh, and detecting absence is the caller's job.
    pub fn should_refresh(&self) -> bool {
        self.credential()
            .map(|c| c.expires_within(self.clock.now(), self.margin))
            .unwrap_or(false)
    }

    /// True while a refresh is in flight
    pub fn is_refreshing(&self) -> bool {
        matches!(*self.lock_state(), RefreshState::Refreshing { .. })
    }

    /// Refresh the credential if it is due
    ///
    /// Returns without suspending when no refresh is due. Otherwise joins the
    /// in-flight refresh or starts one.
    pub async fn ensure_fresh(&self) -> Result<(), RefreshError> {
        if !self.should_refresh() {
            return Ok(());
        }
        match self.join_or_start_if_due() {
            Some(outcome) => outcome.await.map(|_| ()),
            None => Ok(()),
        }
    }

    /// Refresh unconditionally, sharing any refresh already in flight
    pub async fn refresh(&self) -> Result<Credential, RefreshError> {
        self.join_or_start().await
    }

    fn lock_state(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Idle -> Refreshing as a single check-and-set
    fn join_or_start(&self) -> RefreshOutcome {
        let mut state = self.lock_state();

        if let RefreshState::Refreshing { cycle, outcome } = &*state {
            tracing::debug!(cycle, "Joining in-flight token refresh");
            return outcome.clone();
        }
        self.start_locked(&mut state)
    }

    /// Like `join_or_start`, but repeats the due check under the lock
    ///
    /// A refresh that settled after the caller's first check has already
    /// stored the new token before clearing the marker, so it is seen here.
    fn join_or_start_if_due(&self) -> Option<RefreshOutcome> {
        let mut state = self.lock_state();

        if let RefreshState::Refreshing { cycle, outcome } = &*state {
            tracing::debug!(cycle, "Joining in-flight token refresh");
            return Some(outcome.clone());
        }
        if !self.should_refresh() {
            tracing::debug!("Credential already refreshed by another caller");
            return None;
        }
        Some(self.start_locked(&mut state))
    }

    fn start_locked(&self, state: &mut RefreshState) -> RefreshOutcome {
        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(cycle, "Starting token refresh");

        let service = Arc::clone(&self.service);
        let release = Release {
            state: Arc::downgrade(&self.state),
            cycle,
        };

        let outcome = async move {
            // Dropped on settlement, panic, or cancellation
            let _release = release;

            match service.refresh_token().await {
                Ok(credential) => {
                    tracing::info!(cycle, token = %credential.redacted(), "Token refresh succeeded");
                    Ok(credential)
                }
                Err(e) => {
                    tracing::error!(cycle, "Token refresh failed: {:#}", e);
                    Err(RefreshError::new(e))
                }
            }
        }
        .boxed()
        .shared();

        *state = RefreshState::Refreshing {
            cycle,
            outcome: outcome.clone(),
        };
        outcome
    }
}

/// Refreshing -> Idle, only for the cycle that set it
struct Release {
    state: Weak<Mutex<RefreshState>>,
    cycle: u64,
}

impl Drop for Release {
    fn drop(&mut self) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(&*state, RefreshState::Refreshing { cycle, .. } if *cycle == self.cycle) {
            *state = RefreshState::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::clock::ManualClock;
    use crate::auth::store::MemoryStore;
    use crate::auth::types::tests::token_expiring_at;
    use crate::auth::types::TokenData;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Barrier;
    use tokio::sync::Semaphore;
    use tokio_test::{assert_pending, assert_ready, assert_ready_ok, task};

    /// Refresh backend that waits for a permit before answering
    struct GatedService {
        calls: AtomicUsize,
        gate: Semaphore,
        next_exp: i64,
        fail_with: Option<&'static str>,
    }

    impl GatedService {
        fn new(next_exp: i64, fail_with: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Semaphore::new(0),
                next_exp,
                fail_with,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AuthService for GatedService {
        async fn refresh_token(&self) -> anyhow::Result<Credential> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.acquire().await?.forget();
            match self.fail_with {
                Some(message) => Err(anyhow::anyhow!(message)),
                None => Credential::parse(&token_expiring_at(self.next_exp)),
            }
        }
    }

    fn guard_with(
        service: Arc<GatedService>,
        stored: Option<String>,
        now: i64,
    ) -> (TokenGuard, Arc<ManualClock>) {
        let store = Arc::new(match stored {
            Some(access_token) => MemoryStore::with_tokens(TokenData {
                access_token,
                refresh_token: Some("refresh".to_string()),
            }),
            None => MemoryStore::new(),
        });
        let clock = Arc::new(ManualClock::new(now));
        let guard = TokenGuard::new(store, service, clock.clone(), 300);
        (guard, clock)
    }

    #[test]
    fn test_should_refresh_window() {
        let service = GatedService::new(5000, None);
        let (guard, clock) = guard_with(service, Some(token_expiring_at(1000)), 650);

        assert!(!guard.should_refresh());
        clock.set(699);
        assert!(!guard.should_refresh());
        clock.set(700);
        assert!(guard.should_refresh());
        clock.set(750);
        assert!(guard.should_refresh());
    }

    #[test]
    fn test_should_refresh_absent_or_malformed() {
        let service = GatedService::new(5000, None);
        let (guard, _) = guard_with(service.clone(), None, 750);
        assert!(!guard.should_refresh());

        let (guard, _) = guard_with(service, Some("not.a-token".to_string()), 750);
        assert!(!guard.should_refresh());
    }

    #[test]
    fn test_ensure_fresh_not_due_is_immediately_ready() {
        let service = GatedService::new(5000, None);
        let (guard, _) = guard_with(service.clone(), Some(token_expiring_at(1000)), 650);

        let mut fut = task::spawn(guard.ensure_fresh());
        assert_ready_ok!(fut.poll());
        assert_eq!(service.calls(), 0);
        assert!(!guard.is_refreshing());
    }

    #[test]
    fn test_waiters_share_one_refresh() {
        let service = GatedService::new(5000, None);
        let (guard, _) = guard_with(service.clone(), Some(token_expiring_at(1000)), 750);

        let mut first = task::spawn(guard.ensure_fresh());
        let mut second = task::spawn(guard.refresh());
        assert_pending!(first.poll());
        assert_pending!(second.poll());
        assert!(guard.is_refreshing());
        assert_eq!(service.calls(), 1);

        service.gate.add_permits(1);
        assert_ready_ok!(first.poll());
        let credential = assert_ready!(second.poll()).unwrap();
        assert_eq!(credential.claims().exp, 5000);

        assert_eq!(service.calls(), 1);
        assert!(!guard.is_refreshing());
    }

    #[test]
    fn test_failure_is_broadcast_and_marker_cleared() {
        let service = GatedService::new(5000, Some("invalid refresh credential"));
        let (guard, _) = guard_with(service.clone(), Some(token_expiring_at(1000)), 750);

        let mut a = task::spawn(guard.refresh());
        let mut b = task::spawn(guard.refresh());
        assert_pending!(a.poll());
        assert_pending!(b.poll());

        service.gate.add_permits(1);
        let err_a = assert_ready!(a.poll()).unwrap_err();
        let err_b = assert_ready!(b.poll()).unwrap_err();
        assert_eq!(err_a, err_b);
        assert!(err_a.to_string().contains("invalid refresh credential"));
        assert!(!guard.is_refreshing());

        // A fresh attempt is allowed after the failure
        let mut c = task::spawn(guard.refresh());
        assert_pending!(c.poll());
        assert_eq!(service.calls(), 2);
        service.gate.add_permits(1);
        let err_c = assert_ready!(c.poll()).unwrap_err();
        assert_ne!(err_a, err_c);
    }

    #[test]
    fn test_dropping_every_waiter_keeps_refresh_joinable() {
        let service = GatedService::new(5000, None);
        let (guard, _) = guard_with(service.clone(), Some(token_expiring_at(1000)), 750);

        let mut abandoned = task::spawn(guard.refresh());
        assert_pending!(abandoned.poll());
        drop(abandoned);
        assert!(guard.is_refreshing());

        let mut late = task::spawn(guard.refresh());
        assert_pending!(late.poll());
        service.gate.add_permits(1);
        assert_ready_ok!(late.poll());
        assert_eq!(service.calls(), 1);
        assert!(!guard.is_refreshing());
    }

    #[test]
    fn test_stale_release_does_not_clear_newer_cycle() {
        let state = Arc::new(Mutex::new(RefreshState::Idle));
        let outcome: RefreshOutcome = futures::future::pending::<Result<Credential, RefreshError>>()
            .boxed()
            .shared();
        *state.lock().unwrap() = RefreshState::Refreshing { cycle: 2, outcome };

        drop(Release {
            state: Arc::downgrade(&state),
            cycle: 1,
        });
        assert!(matches!(
            *state.lock().unwrap(),
            RefreshState::Refreshing { cycle: 2, .. }
        ));

        drop(Release {
            state: Arc::downgrade(&state),
            cycle: 2,
        });
        assert!(matches!(*state.lock().unwrap(), RefreshState::Idle));
    }

    /// Store that can stall one read of the access token mid-call
    struct StallingStore {
        inner: MemoryStore,
        stall_next: AtomicBool,
        reached: Barrier,
        resume: Barrier,
    }

    impl CredentialStore for StallingStore {
        fn access_token(&self) -> anyhow::Result<Option<String>> {
            let token = self.inner.access_token()?;
            if self.stall_next.swap(false, Ordering::SeqCst) {
                self.reached.wait();
                self.resume.wait();
            }
            Ok(token)
        }

        fn refresh_token(&self) -> anyhow::Result<Option<String>> {
            self.inner.refresh_token()
        }

        fn save(&self, tokens: &TokenData) -> anyhow::Result<()> {
            self.inner.save(tokens)
        }

        fn clear(&self) -> anyhow::Result<()> {
            self.inner.clear()
        }
    }

    /// Refresh backend that answers at once and stores the new token
    struct StoringService {
        calls: AtomicUsize,
        store: Arc<StallingStore>,
    }

    #[async_trait]
    impl AuthService for StoringService {
        async fn refresh_token(&self) -> anyhow::Result<Credential> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let token = token_expiring_at(5000);
            self.store.save(&TokenData {
                access_token: token.clone(),
                refresh_token: None,
            })?;
            Credential::parse(&token)
        }
    }

    #[test]
    fn test_caller_with_stale_read_does_not_refresh_again() {
        let store = Arc::new(StallingStore {
            inner: MemoryStore::with_tokens(TokenData {
                access_token: token_expiring_at(1000),
                refresh_token: Some("refresh".to_string()),
            }),
            stall_next: AtomicBool::new(true),
            reached: Barrier::new(2),
            resume: Barrier::new(2),
        });
        let service = Arc::new(StoringService {
            calls: AtomicUsize::new(0),
            store: store.clone(),
        });
        let guard = TokenGuard::new(
            store.clone(),
            service.clone(),
            Arc::new(ManualClock::new(750)),
            300,
        );

        // Reads the expiring token, then stalls before deciding to refresh
        let late = std::thread::spawn({
            let guard = guard.clone();
            move || futures::executor::block_on(guard.ensure_fresh())
        });

        store.reached.wait();
        futures::executor::block_on(guard.ensure_fresh()).unwrap();
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
        assert!(!guard.should_refresh());
        assert!(!guard.is_refreshing());
        store.resume.wait();

        late.join().unwrap().unwrap();
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
        assert_eq!(guard.credential().map(|c| c.claims().exp), Some(5000));
    }
}
