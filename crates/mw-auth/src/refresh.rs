//! Single-flight token refresh.
//!
//! At most one refresh-token exchange runs at a time. Callers arriving while
//! one is in flight are queued and all receive its outcome, in arrival order.
//! The exchange itself runs on its own task, so a caller that gives up waiting
//! never cancels the refresh other callers still depend on. If that task
//! panics the waiters receive an error and the coordinator returns to idle.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{oneshot, watch};
use tracing::{debug, info, instrument, warn};

use crate::credential::Credential;
use crate::credential_store::CredentialStore;
use crate::errors::RefreshError;
use crate::models::TokenResponse;

/// The external token-issuance call
#[async_trait::async_trait]
pub trait TokenExchange: Send + Sync {
    async fn exchange(&self, refresh_token: &str) -> Result<TokenResponse, RefreshError>;
}

type Outcome = Result<Credential, RefreshError>;
type Waiter = oneshot::Sender<Outcome>;

enum Flight {
    Idle,
    InFlight { waiters: VecDeque<Waiter> },
}

/// Owner of the in-flight flag and the waiter queue
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    exchange: Arc<dyn TokenExchange>,
    store: CredentialStore,
    flight: Mutex<Flight>,
    exchanges: AtomicU64,
}

impl std::fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("exchanges_started", &self.exchanges_started())
            .field("pending_waiters", &self.pending_waiters())
            .finish()
    }
}

impl RefreshCoordinator {
    pub fn new(exchange: Arc<dyn TokenExchange>, store: CredentialStore) -> Self {
        Self {
            inner: Arc::new(Inner {
                exchange,
                store,
                flight: Mutex::new(Flight::Idle),
                exchanges: AtomicU64::new(0),
            }),
        }
    }

    /// Obtain a fresh credential, starting an exchange or joining the one
    /// already in flight.
    ///
    /// On failure the credential store has been cleared (forced logout) and
    /// every caller that joined the same exchange receives the same error.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<Credential, RefreshError> {
        let (tx, rx) = oneshot::channel();

        let leader = {
            let mut flight = self.inner.lock();
            match &mut *flight {
                Flight::InFlight { waiters } => {
                    waiters.push_back(tx);
                    false
                }
                Flight::Idle => {
                    *flight = Flight::InFlight {
                        waiters: VecDeque::from([tx]),
                    };
                    true
                }
            }
        };

        if leader {
            let inner = self.inner.clone();
            inner.exchanges.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let exchange = tokio::spawn({
                    let inner = inner.clone();
                    async move { inner.run_exchange().await }
                });
                // A panicking exchange still settles so waiters are released
                let outcome = exchange.await.unwrap_or_else(|e| {
                    Err(RefreshError::Transport(format!("refresh exchange failed: {e}")))
                });
                inner.settle(outcome).await;
            });
        } else {
            debug!("Joining in-flight refresh");
        }

        rx.await.unwrap_or_else(|_| {
            Err(RefreshError::Transport(
                "refresh task ended without settling".to_string(),
            ))
        })
    }

    /// True while an exchange is in flight
    pub fn is_refreshing(&self) -> bool {
        matches!(*self.inner.lock(), Flight::InFlight { .. })
    }

    /// Callers currently waiting on the in-flight exchange
    pub fn pending_waiters(&self) -> usize {
        match &*self.inner.lock() {
            Flight::InFlight { waiters } => waiters.len(),
            Flight::Idle => 0,
        }
    }

    /// Number of network exchanges started since creation
    pub fn exchanges_started(&self) -> u64 {
        self.inner.exchanges.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &CredentialStore {
        &self.inner.store
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Flight> {
        self.flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn run_exchange(&self) -> Outcome {
        let current = self
            .store
            .get()
            .ok_or(RefreshError::MissingRefreshToken)?;

        let tokens = tokio::select! {
            result = self.exchange.exchange(&current.refresh_token) => result?,
            _ = signed_out(self.store.subscribe()) => return Err(RefreshError::LoggedOut),
        };

        if self.store.get().is_none() {
            return Err(RefreshError::LoggedOut);
        }

        Credential::from_token_response(tokens, Some(&current.refresh_token), current.persistent)
    }

    /// Persist or clear, then release every waiter in arrival order
    async fn settle(&self, outcome: Outcome) {
        let outcome = match outcome {
            Ok(credential) => match self.store.set(credential.clone()).await {
                Ok(()) => {
                    info!(expires_at = %credential.expires_at, "Access token refreshed");
                    Ok(credential)
                }
                Err(e) => Err(RefreshError::Storage(e.to_string())),
            },
            Err(e) => Err(e),
        };

        if let Err(e) = &outcome {
            warn!("Token refresh failed: {}", e);
            if *e != RefreshError::LoggedOut
                && let Err(clear_err) = self.store.clear().await
            {
                warn!("Failed to clear credential after refresh failure: {}", clear_err);
            }
        }

        let waiters = match std::mem::replace(&mut *self.lock(), Flight::Idle) {
            Flight::InFlight { waiters } => waiters,
            Flight::Idle => VecDeque::new(),
        };

        debug!(waiters = waiters.len(), "Releasing refresh waiters");
        for waiter in waiters {
            // A waiter whose caller was cancelled has dropped its receiver
            let _ = waiter.send(outcome.clone());
        }
    }
}

/// Resolves once the store holds no credential
async fn signed_out(mut changes: watch::Receiver<Option<Credential>>) {
    loop {
        if changes.borrow_and_update().is_none() {
            return;
        }
        if changes.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Exchange that blocks until released, then returns a fixed result
    struct GatedExchange {
        calls: AtomicUsize,
        gate: Notify,
        result: Result<TokenResponse, RefreshError>,
    }

    impl GatedExchange {
        fn new(result: Result<TokenResponse, RefreshError>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Notify::new(),
                result,
            })
        }
    }

    #[async_trait::async_trait]
    impl TokenExchange for GatedExchange {
        async fn exchange(&self, _refresh_token: &str) -> Result<TokenResponse, RefreshError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            self.result.clone()
        }
    }

    fn tokens(token: &str) -> TokenResponse {
        TokenResponse {
            token: token.to_string(),
            refresh_token: Some(format!("{token}-refresh")),
            expires_in: Some(900),
        }
    }

    async fn signed_in_store() -> CredentialStore {
        let store = CredentialStore::in_memory().await.unwrap();
        store
            .set(Credential {
                access_token: "old".to_string(),
                refresh_token: "old-refresh".to_string(),
                expires_at: Utc::now() + chrono::Duration::seconds(5),
                persistent: false,
            })
            .await
            .unwrap();
        store
    }

    async fn wait_for_waiters(coordinator: &RefreshCoordinator, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while coordinator.pending_waiters() < n {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("waiters queued");
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_exchange() {
        let exchange = GatedExchange::new(Ok(tokens("new")));
        let coordinator = RefreshCoordinator::new(exchange.clone(), signed_in_store().await);

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let c = coordinator.clone();
                tokio::spawn(async move { c.refresh().await })
            })
            .collect();

        wait_for_waiters(&coordinator, 5).await;
        assert!(coordinator.is_refreshing());
        exchange.gate.notify_one();

        for handle in handles {
            let credential = handle.await.unwrap().unwrap();
            assert_eq!(credential.access_token, "new");
        }

        assert_eq!(exchange.calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.exchanges_started(), 1);
        assert!(!coordinator.is_refreshing());
        assert_eq!(coordinator.store().get().unwrap().access_token, "new");
    }

    #[tokio::test]
    async fn test_failure_rejects_all_and_clears_store() {
        let rejected = RefreshError::Rejected {
            status: 401,
            body_snippet: "invalid refresh token".to_string(),
        };
        let exchange = GatedExchange::new(Err(rejected.clone()));
        let coordinator = RefreshCoordinator::new(exchange.clone(), signed_in_store().await);

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let c = coordinator.clone();
                tokio::spawn(async move { c.refresh().await })
            })
            .collect();

        wait_for_waiters(&coordinator, 3).await;
        exchange.gate.notify_one();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Err(rejected.clone()));
        }
        assert!(coordinator.store().get().is_none());
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_waiters_released_in_arrival_order() {
        let exchange = GatedExchange::new(Ok(tokens("new")));
        let coordinator = RefreshCoordinator::new(exchange.clone(), signed_in_store().await);
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for id in 0..4 {
            let c = coordinator.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                c.refresh().await.unwrap();
                order.lock().unwrap().push(id);
            }));
            wait_for_waiters(&coordinator, id + 1).await;
        }

        exchange.gate.notify_one();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_sequential_refreshes_start_new_exchanges() {
        let exchange = GatedExchange::new(Ok(tokens("new")));
        let coordinator = RefreshCoordinator::new(exchange.clone(), signed_in_store().await);

        for expected in 1..=2 {
            let c = coordinator.clone();
            let handle = tokio::spawn(async move { c.refresh().await });
            wait_for_waiters(&coordinator, 1).await;
            exchange.gate.notify_one();
            handle.await.unwrap().unwrap();
            assert_eq!(coordinator.exchanges_started(), expected);
        }
    }

    #[tokio::test]
    async fn test_cancelled_leader_does_not_cancel_refresh() {
        let exchange = GatedExchange::new(Ok(tokens("new")));
        let coordinator = RefreshCoordinator::new(exchange.clone(), signed_in_store().await);

        let leader = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.refresh().await })
        };
        wait_for_waiters(&coordinator, 1).await;
        let follower = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.refresh().await })
        };
        wait_for_waiters(&coordinator, 2).await;

        leader.abort();
        exchange.gate.notify_one();

        assert_eq!(follower.await.unwrap().unwrap().access_token, "new");
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_logout_cancels_in_flight_refresh() {
        let exchange = GatedExchange::new(Ok(tokens("new")));
        let coordinator = RefreshCoordinator::new(exchange.clone(), signed_in_store().await);

        let handle = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.refresh().await })
        };
        wait_for_waiters(&coordinator, 1).await;
        while exchange.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        coordinator.store().clear().await.unwrap();

        assert_eq!(handle.await.unwrap(), Err(RefreshError::LoggedOut));
        // The late exchange result must not sign the user back in
        assert!(coordinator.store().get().is_none());
    }

    #[tokio::test]
    async fn test_missing_credential() {
        let exchange = GatedExchange::new(Ok(tokens("new")));
        let store = CredentialStore::in_memory().await.unwrap();
        let coordinator = RefreshCoordinator::new(exchange.clone(), store);

        assert_eq!(
            coordinator.refresh().await,
            Err(RefreshError::MissingRefreshToken)
        );
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 0);
    }

    /// Exchange that answers from a queue of responses
    struct QueuedExchange {
        responses: Mutex<VecDeque<TokenResponse>>,
    }

    #[async_trait::async_trait]
    impl TokenExchange for QueuedExchange {
        async fn exchange(&self, _refresh_token: &str) -> Result<TokenResponse, RefreshError> {
            let next = self.responses.lock().unwrap().pop_front();
            next.ok_or_else(|| RefreshError::Transport("no response queued".to_string()))
        }
    }

    /// Exchange that panics for one refresh token and succeeds for others
    struct PanickingExchange {
        poisoned: &'static str,
    }

    #[async_trait::async_trait]
    impl TokenExchange for PanickingExchange {
        async fn exchange(&self, refresh_token: &str) -> Result<TokenResponse, RefreshError> {
            if refresh_token == self.poisoned {
                panic!("token endpoint blew up");
            }
            Ok(tokens("new"))
        }
    }

    async fn sign_in_again(store: &CredentialStore, refresh_token: &str) {
        store
            .set(Credential {
                access_token: "again".to_string(),
                refresh_token: refresh_token.to_string(),
                expires_at: Utc::now() + chrono::Duration::seconds(5),
                persistent: false,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_out_of_range_lifetime_fails_cleanly() {
        let huge = TokenResponse {
            expires_in: Some(u64::MAX / 2),
            ..tokens("huge")
        };
        let exchange = Arc::new(QueuedExchange {
            responses: Mutex::new(VecDeque::from([huge, tokens("new")])),
        });
        let coordinator = RefreshCoordinator::new(exchange, signed_in_store().await);

        let first = tokio::time::timeout(Duration::from_secs(5), coordinator.refresh())
            .await
            .expect("refresh settles");
        assert!(matches!(first, Err(RefreshError::InvalidResponse(_))));
        assert!(!coordinator.is_refreshing());
        assert!(coordinator.store().get().is_none());

        sign_in_again(coordinator.store(), "again-refresh").await;
        let second = tokio::time::timeout(Duration::from_secs(5), coordinator.refresh())
            .await
            .expect("refresh settles");
        assert_eq!(second.unwrap().access_token, "new");
        assert_eq!(coordinator.exchanges_started(), 2);
    }

    #[tokio::test]
    async fn test_panicking_exchange_releases_waiters() {
        let exchange = Arc::new(PanickingExchange {
            poisoned: "old-refresh",
        });
        let coordinator = RefreshCoordinator::new(exchange, signed_in_store().await);

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let c = coordinator.clone();
                tokio::spawn(async move { c.refresh().await })
            })
            .collect();

        for handle in handles {
            let result = tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .expect("refresh settles")
                .unwrap();
            assert!(matches!(result, Err(RefreshError::Transport(_))));
        }
        assert!(!coordinator.is_refreshing());
        assert!(coordinator.store().get().is_none());

        sign_in_again(coordinator.store(), "again-refresh").await;
        assert_eq!(coordinator.refresh().await.unwrap().access_token, "new");
    }
}
