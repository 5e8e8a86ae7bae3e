use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::abort::AbortSignal;
use crate::credential_store::CredentialStore;
use crate::errors::{AuthError, Result};
use crate::refresh::RefreshCoordinator;
use crate::retry::{FailureClass, RetryPolicy, RetryState};
use crate::transport::{ApiRequest, ApiResponse, Transport, TransportError};

/// Sends requests with the current access token attached, refreshing the
/// token on `401` and retrying network failures.
#[derive(Clone)]
pub struct AuthorizedRequestSender {
    transport: Arc<dyn Transport>,
    coordinator: RefreshCoordinator,
    retry: RetryPolicy,
}

impl std::fmt::Debug for AuthorizedRequestSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizedRequestSender")
            .field("retry", &self.retry)
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

impl AuthorizedRequestSender {
    pub fn new(
        transport: Arc<dyn Transport>,
        coordinator: RefreshCoordinator,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            coordinator,
            retry,
        }
    }

    pub fn store(&self) -> &CredentialStore {
        self.coordinator.store()
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    /// Send `request`, returning the first 2xx response.
    ///
    /// Fails with [`AuthError::AuthExpired`] when the token could not be
    /// refreshed, [`AuthError::Unauthorized`] when the refreshed token is
    /// rejected too, [`AuthError::NetworkExhausted`] once network retries run
    /// out, and [`AuthError::Http`] for any other non-2xx status.
    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        let mut state = RetryState::new();

        loop {
            let token = self.store().get().map(|c| c.access_token);
            let outgoing = request.with_bearer(token.as_deref());

            let response = match self.transport.execute(&outgoing).await {
                Ok(response) => response,
                Err(TransportError::Network(message)) => {
                    let decision = self.retry.should_retry(FailureClass::Network, state.attempt);
                    if !decision.retry {
                        warn!(
                            attempts = state.attempt + 1,
                            elapsed_ms = state.first_attempt_at.elapsed().as_millis() as u64,
                            "Giving up after network failures"
                        );
                        return Err(AuthError::NetworkExhausted {
                            attempts: state.attempt + 1,
                            last_error: message,
                        });
                    }

                    state.attempt += 1;
                    debug!(
                        attempt = state.attempt,
                        delay_ms = decision.delay.as_millis() as u64,
                        error = %message,
                        "Network failure, retrying"
                    );
                    tokio::time::sleep(decision.delay).await;
                    continue;
                }
                Err(TransportError::Request(message)) => {
                    return Err(AuthError::Transport(message));
                }
            };

            if response.status.is_success() {
                return Ok(response);
            }

            if FailureClass::of_status(response.status) != FailureClass::Unauthorized {
                return response.error_for_status();
            }

            if state.has_retried_after_refresh {
                warn!("Refreshed token rejected, not refreshing again");
                return Err(AuthError::Unauthorized);
            }
            state.has_retried_after_refresh = true;

            // Another caller may already have rotated the token this request used
            let current = self.store().get().map(|c| c.access_token);
            if current.is_some() && current != token {
                debug!("Token rotated while request was in flight, resending");
                continue;
            }

            debug!("Access token rejected, refreshing");
            self.coordinator.refresh().await?;
        }
    }

    /// [`send`](Self::send) that gives up with [`AuthError::Cancelled`] as
    /// soon as `signal` fires. A refresh this call joined keeps running for
    /// the other callers waiting on it.
    pub async fn send_with_abort(
        &self,
        request: ApiRequest,
        mut signal: AbortSignal,
    ) -> Result<ApiResponse> {
        if signal.is_aborted() {
            return Err(AuthError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = signal.aborted() => {
                debug!("Request aborted");
                Err(AuthError::Cancelled)
            }
            result = self.send(request) => result,
        }
    }
}
