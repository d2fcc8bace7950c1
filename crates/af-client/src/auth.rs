//! AuthTokenManager - token lifecycle and 401-triggered refresh
//!
//! State machine:
//! - Authenticated --401--> Refreshing: one refresh runs on a spawned task,
//!   later 401s queue their replay behind it
//! - Refreshing --ok--> Authenticated: queued replays run once, in FIFO order
//! - Refreshing --failed--> Unauthenticated: queue rejected, session expired
//!
//! The check-and-set on the state happens under a synchronous lock before
//! any await, so two callers can never both start a refresh.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use af_common::{ApiEvent, ClassifiedError, EventBus, Response};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{FuturesOrdered, StreamExt};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

pub const DEFAULT_STORAGE_KEY: &str = "auth_token";

// ============================================================================
// Collaborators
// ============================================================================

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persistence for the single auth token
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    fn name(&self) -> &str;
}

/// Obtains a fresh token after the current one was rejected
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, rejected: Option<&str>) -> Result<String, ClassifiedError>;
}

/// In-process token store
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.values.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.values.lock().remove(key);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

// ============================================================================
// State
// ============================================================================

/// Re-sends a request with the given token. Never recovers from its own 401.
pub type ReplayFn =
    Box<dyn FnOnce(String) -> BoxFuture<'static, Result<Response, ClassifiedError>> + Send>;

struct PendingReplay {
    replay: ReplayFn,
    respond: oneshot::Sender<Result<Response, ClassifiedError>>,
}

enum AuthState {
    Authenticated(String),
    Refreshing {
        rejected: String,
        queue: VecDeque<PendingReplay>,
    },
    Unauthenticated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuthStatus {
    Authenticated,
    Refreshing,
    Unauthenticated,
}

enum Recovery {
    Reject,
    ReplayNow(ReplayFn, String),
    Wait(oneshot::Receiver<Result<Response, ClassifiedError>>),
}

// ============================================================================
// Manager
// ============================================================================

pub struct AuthTokenManager {
    state: Mutex<AuthState>,
    refresher: Arc<dyn TokenRefresher>,
    store: Arc<dyn TokenStore>,
    storage_key: String,
    events: EventBus,
}

impl AuthTokenManager {
    pub fn new(refresher: Arc<dyn TokenRefresher>, store: Arc<dyn TokenStore>, events: EventBus) -> Self {
        Self {
            state: Mutex::new(AuthState::Unauthenticated),
            refresher,
            store,
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            events,
        }
    }

    pub fn with_storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = key.into();
        self
    }

    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    pub fn status(&self) -> AuthStatus {
        match &*self.state.lock() {
            AuthState::Authenticated(_) => AuthStatus::Authenticated,
            AuthState::Refreshing { .. } => AuthStatus::Refreshing,
            AuthState::Unauthenticated => AuthStatus::Unauthenticated,
        }
    }

    /// Token to attach to outgoing requests. While refreshing this is the
    /// rejected token, so a request sent meanwhile joins the replay queue.
    pub fn current_token(&self) -> Option<String> {
        match &*self.state.lock() {
            AuthState::Authenticated(token) => Some(token.clone()),
            AuthState::Refreshing { rejected, .. } => Some(rejected.clone()),
            AuthState::Unauthenticated => None,
        }
    }

    /// Install a token after login. Requests waiting on a refresh are
    /// replayed with it.
    pub async fn set_token(&self, token: impl Into<String>) -> Result<(), StorageError> {
        let token = token.into();
        let previous = std::mem::replace(&mut *self.state.lock(), AuthState::Authenticated(token.clone()));
        if let AuthState::Refreshing { queue, .. } = previous {
            tokio::spawn(replay_all(queue, token.clone()));
        }
        info!(store = self.store.name(), "Auth token set");
        self.store.set(&self.storage_key, &token).await
    }

    /// Load a persisted token. Returns whether one was found.
    pub async fn restore(&self) -> Result<bool, StorageError> {
        let Some(token) = self.store.get(&self.storage_key).await? else {
            return Ok(false);
        };
        let mut state = self.state.lock();
        if matches!(*state, AuthState::Unauthenticated) {
            *state = AuthState::Authenticated(token);
            debug!("Restored auth token from store");
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Drop the token and reject anything waiting on a refresh
    pub async fn logout(&self) -> Result<(), StorageError> {
        let previous = std::mem::replace(&mut *self.state.lock(), AuthState::Unauthenticated);
        if let AuthState::Refreshing { queue, .. } = previous {
            reject_all(queue, "Logged out while refreshing");
        }
        info!("Logged out");
        self.store.delete(&self.storage_key).await
    }

    /// Handle a 401 for a request sent with `sent_token`.
    ///
    /// Resolves with the replay's own outcome once a token is available, or
    /// Authentication when the session cannot be recovered.
    pub async fn recover(
        self: &Arc<Self>,
        sent_token: Option<String>,
        replay: ReplayFn,
    ) -> Result<Response, ClassifiedError> {
        let recovery = {
            let mut state = self.state.lock();
            let previous = std::mem::replace(&mut *state, AuthState::Unauthenticated);
            let (next, recovery) = match previous {
                AuthState::Unauthenticated => (AuthState::Unauthenticated, Recovery::Reject),
                AuthState::Authenticated(current) if sent_token.as_deref() != Some(current.as_str()) => {
                    // Rejected token is already superseded
                    let recovery = Recovery::ReplayNow(replay, current.clone());
                    (AuthState::Authenticated(current), recovery)
                }
                AuthState::Authenticated(current) => {
                    let (tx, rx) = oneshot::channel();
                    let mut queue = VecDeque::new();
                    queue.push_back(PendingReplay { replay, respond: tx });
                    tokio::spawn(self.clone().run_refresh(current.clone()));
                    (AuthState::Refreshing { rejected: current, queue }, Recovery::Wait(rx))
                }
                AuthState::Refreshing { rejected, mut queue } => {
                    let (tx, rx) = oneshot::channel();
                    queue.push_back(PendingReplay { replay, respond: tx });
                    debug!(queued = queue.len(), "Refresh in progress, queued replay");
                    (AuthState::Refreshing { rejected, queue }, Recovery::Wait(rx))
                }
            };
            *state = next;
            recovery
        };

        match recovery {
            Recovery::Reject => Err(ClassifiedError::authentication("Not authenticated")),
            Recovery::ReplayNow(replay, token) => replay(token).await,
            Recovery::Wait(rx) => rx
                .await
                .unwrap_or_else(|_| Err(ClassifiedError::authentication("Token refresh abandoned"))),
        }
    }

    async fn run_refresh(self: Arc<Self>, rejected: String) {
        info!("Refreshing auth token");
        metrics::counter!("apiflow_token_refreshes_total").increment(1);

        let outcome = AssertUnwindSafe(self.refresher.refresh(Some(&rejected)))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(ClassifiedError::authentication("Token refresher panicked")));

        match outcome {
            Ok(token) => {
                let queue = {
                    let mut state = self.state.lock();
                    if !matches!(*state, AuthState::Refreshing { .. }) {
                        debug!("State changed during refresh, discarding refreshed token");
                        return;
                    }
                    match std::mem::replace(&mut *state, AuthState::Authenticated(token.clone())) {
                        AuthState::Refreshing { queue, .. } => queue,
                        _ => VecDeque::new(),
                    }
                };

                if let Err(e) = self.store.set(&self.storage_key, &token).await {
                    warn!(error = %e, store = self.store.name(), "Failed to persist refreshed token");
                }
                info!(replays = queue.len(), "Auth token refreshed");
                self.events.emit(ApiEvent::AuthTokenRefreshed);
                replay_all(queue, token).await;
            }
            Err(error) => {
                let queue = {
                    let mut state = self.state.lock();
                    match std::mem::replace(&mut *state, AuthState::Unauthenticated) {
                        AuthState::Refreshing { queue, .. } => queue,
                        other => {
                            *state = other;
                            return;
                        }
                    }
                };

                warn!(error = %error, rejected = queue.len(), "Token refresh failed, session expired");
                if let Err(e) = self.store.delete(&self.storage_key).await {
                    warn!(error = %e, "Failed to clear stored token");
                }
                reject_all(queue, "Session expired");
                self.events.emit(ApiEvent::AuthTokenExpired);
            }
        }
    }
}

/// Start every replay in submission order and deliver each outcome
async fn replay_all(queue: VecDeque<PendingReplay>, token: String) {
    let mut replays: FuturesOrdered<_> = queue
        .into_iter()
        .map(|pending| {
            let fut = (pending.replay)(token.clone());
            async move {
                let _ = pending.respond.send(fut.await);
            }
        })
        .collect();
    while replays.next().await.is_some() {}
}

fn reject_all(queue: VecDeque<PendingReplay>, reason: &str) {
    for pending in queue {
        let _ = pending.respond.send(Err(ClassifiedError::authentication(reason)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use af_common::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct MockRefresher {
        calls: AtomicU32,
        result: Result<String, ClassifiedError>,
    }

    impl MockRefresher {
        fn succeeding(token: &str) -> Arc<Self> {
            Arc::new(Self { calls: AtomicU32::new(0), result: Ok(token.to_string()) })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                result: Err(ClassifiedError::authentication("refresh token expired")),
            })
        }
    }

    #[async_trait]
    impl TokenRefresher for MockRefresher {
        async fn refresh(&self, _rejected: Option<&str>) -> Result<String, ClassifiedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.result.clone()
        }
    }

    fn recording_replay(log: Arc<Mutex<Vec<(u32, String)>>>, n: u32) -> ReplayFn {
        Box::new(move |token: String| {
            async move {
                log.lock().push((n, token));
                Ok(Response::new(200, Default::default(), format!("replay-{}", n)))
            }
            .boxed()
        })
    }

    async fn manager_with(refresher: Arc<MockRefresher>) -> (Arc<AuthTokenManager>, Arc<MemoryTokenStore>, EventBus) {
        let store = Arc::new(MemoryTokenStore::new());
        let events = EventBus::default();
        let manager = Arc::new(AuthTokenManager::new(refresher, store.clone(), events.clone()));
        manager.set_token("old").await.unwrap();
        (manager, store, events)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_401s_share_one_refresh() {
        let refresher = MockRefresher::succeeding("new");
        let (manager, store, events) = manager_with(refresher.clone()).await;
        let mut rx = events.subscribe();
        let log = Arc::new(Mutex::new(Vec::new()));

        let (a, b, c) = tokio::join!(
            manager.recover(Some("old".into()), recording_replay(log.clone(), 1)),
            manager.recover(Some("old".into()), recording_replay(log.clone(), 2)),
            manager.recover(Some("old".into()), recording_replay(log.clone(), 3)),
        );

        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap().text(), "replay-1");
        assert_eq!(b.unwrap().text(), "replay-2");
        assert_eq!(c.unwrap().text(), "replay-3");
        assert_eq!(
            *log.lock(),
            vec![(1, "new".to_string()), (2, "new".to_string()), (3, "new".to_string())]
        );
        assert_eq!(manager.status(), AuthStatus::Authenticated);
        assert_eq!(store.get(DEFAULT_STORAGE_KEY).await.unwrap().as_deref(), Some("new"));
        assert_eq!(rx.recv().await.unwrap().name(), "auth:tokenRefreshed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_failure_rejects_queue_and_expires_session() {
        let refresher = MockRefresher::failing();
        let (manager, store, events) = manager_with(refresher.clone()).await;
        let mut rx = events.subscribe();
        let log = Arc::new(Mutex::new(Vec::new()));

        let (a, b) = tokio::join!(
            manager.recover(Some("old".into()), recording_replay(log.clone(), 1)),
            manager.recover(Some("old".into()), recording_replay(log.clone(), 2)),
        );

        assert_eq!(a.unwrap_err().kind, ErrorKind::Authentication);
        assert_eq!(b.unwrap_err().kind, ErrorKind::Authentication);
        assert!(log.lock().is_empty());
        assert_eq!(manager.status(), AuthStatus::Unauthenticated);
        assert_eq!(manager.current_token(), None);
        assert_eq!(store.get(DEFAULT_STORAGE_KEY).await.unwrap(), None);
        assert_eq!(rx.recv().await.unwrap().name(), "auth:tokenExpired");
    }

    #[tokio::test]
    async fn test_unauthenticated_rejects_without_refresh() {
        let refresher = MockRefresher::succeeding("new");
        let manager = Arc::new(AuthTokenManager::new(
            refresher.clone(),
            Arc::new(MemoryTokenStore::new()),
            EventBus::default(),
        ));
        let log = Arc::new(Mutex::new(Vec::new()));

        let err = manager.recover(None, recording_replay(log.clone(), 1)).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::Authentication);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_stale_token_replays_with_current() {
        let refresher = MockRefresher::succeeding("unused");
        let (manager, _, _) = manager_with(refresher.clone()).await;
        let log = Arc::new(Mutex::new(Vec::new()));

        let resp = manager
            .recover(Some("older".into()), recording_replay(log.clone(), 1))
            .await
            .unwrap();

        assert_eq!(resp.status, 200);
        assert_eq!(*log.lock(), vec![(1, "old".to_string())]);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_during_refresh_rejects_waiters() {
        let refresher = MockRefresher::succeeding("new");
        let (manager, store, _) = manager_with(refresher).await;
        let log = Arc::new(Mutex::new(Vec::new()));

        let waiter = {
            let manager = manager.clone();
            let log = log.clone();
            tokio::spawn(async move { manager.recover(Some("old".into()), recording_replay(log, 1)).await })
        };
        while manager.status() != AuthStatus::Refreshing {
            tokio::task::yield_now().await;
        }

        manager.logout().await.unwrap();
        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Authentication);

        // Refreshed token arriving after logout is discarded
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.status(), AuthStatus::Unauthenticated);
        assert_eq!(store.get(DEFAULT_STORAGE_KEY).await.unwrap(), None);
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_restore_from_store() {
        let store = Arc::new(MemoryTokenStore::new());
        store.set("session", "persisted").await.unwrap();
        let manager = AuthTokenManager::new(MockRefresher::succeeding("x"), store, EventBus::default())
            .with_storage_key("session");

        assert!(manager.restore().await.unwrap());
        assert_eq!(manager.current_token().as_deref(), Some("persisted"));
        assert_eq!(manager.status(), AuthStatus::Authenticated);
    }
}
