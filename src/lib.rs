//! Mockwise API client
//!
//! [`Mockwise`] bundles the pieces an application needs to talk to the API
//! as a signed-in user: authorized requests with token refresh and retries,
//! idle-session warnings and expiry, and account registration.
//!
//! ```no_run
//! use mockwise::{Mockwise, Settings};
//! use mw_auth::ApiRequest;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load(None).await?;
//!     let app = Mockwise::from_settings(&settings).await?;
//!
//!     let _warning = app.on_session_warning(|remaining| {
//!         println!("Session ends in {}s", remaining.as_secs());
//!     });
//!     let _expired = app.on_session_expired(|| println!("Signed out"));
//!
//!     app.login("ada@example.com", "hunter2", true).await?;
//!     let response = app.authorized_send(ApiRequest::get("interviews")).await?;
//!     println!("{}", response.body);
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use mw_auth::{
    AbortSignal, ApiRequest, ApiResponse, AuthClient, AuthConfig, AuthorizedRequestSender,
    Credential, CredentialStore, FileKeyValueStore, HttpTransport, MemoryKeyValueStore,
    RefreshCoordinator, Transport,
};
use mw_session::{
    HttpRegistrationApi, RegistrationAction, RegistrationStateMachine, RegistrationStep,
    SessionConfig, SessionEvent, SessionMonitor, SessionStatus,
};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

pub mod errors;
pub mod settings;

pub use errors::{Error, Result};
pub use settings::{Settings, SettingsError};

/// Keeps a session callback registered. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct Mockwise {
    client: AuthClient,
    sender: AuthorizedRequestSender,
    monitor: SessionMonitor,
    registration: Mutex<RegistrationStateMachine>,
    watcher: Option<JoinHandle<()>>,
}

impl Drop for Mockwise {
    fn drop(&mut self) {
        if let Some(watcher) = &self.watcher {
            watcher.abort();
        }
    }
}

impl std::fmt::Debug for Mockwise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mockwise")
            .field("base_url", &self.client.config().base_url.as_str())
            .field("session", &self.monitor.status())
            .finish()
    }
}

impl Mockwise {
    /// Build from a settings file: credentials marked `persistent` live in
    /// the storage directory, everything else in memory.
    #[instrument(skip(settings))]
    pub async fn from_settings(settings: &Settings) -> Result<Self> {
        let config = settings.auth_config()?;

        let dir = match &settings.storage.dir {
            Some(dir) => dir.clone(),
            None => FileKeyValueStore::default_storage_dir()?,
        };
        let durable = Arc::new(FileKeyValueStore::open(&dir).await?);
        let watcher = settings
            .watch_interval()
            .map(|every| durable.watch_external(every));
        let store = CredentialStore::open(durable, Arc::new(MemoryKeyValueStore::new())).await?;

        let mut app = Self::new(config, settings.session.clone(), store)?;
        app.watcher = watcher;
        info!("Credential storage at {}", dir.display());
        Ok(app)
    }

    pub fn new(config: AuthConfig, session: SessionConfig, store: CredentialStore) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(&config)?);
        Ok(Self::with_transport(config, session, store, transport))
    }

    /// Build over any [`Transport`]. Must be called from within a tokio
    /// runtime.
    pub fn with_transport(
        config: AuthConfig,
        session: SessionConfig,
        store: CredentialStore,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let client = AuthClient::new(config.clone(), transport.clone());
        let coordinator = RefreshCoordinator::new(Arc::new(client.clone()), store);
        let sender =
            AuthorizedRequestSender::new(transport.clone(), coordinator.clone(), config.retry);
        let monitor = SessionMonitor::start(session, coordinator);
        let api = HttpRegistrationApi::new(transport, sender.clone());

        Self {
            client,
            sender,
            monitor,
            registration: Mutex::new(RegistrationStateMachine::new(Arc::new(api))),
            watcher: None,
        }
    }

    pub fn credentials(&self) -> &CredentialStore {
        self.sender.store()
    }

    pub fn sender(&self) -> &AuthorizedRequestSender {
        &self.sender
    }

    pub fn monitor(&self) -> &SessionMonitor {
        &self.monitor
    }

    /// Send a request as the signed-in user
    pub async fn authorized_send(&self, request: ApiRequest) -> mw_auth::Result<ApiResponse> {
        self.sender.send(request).await
    }

    pub async fn authorized_send_with_abort(
        &self,
        request: ApiRequest,
        signal: AbortSignal,
    ) -> mw_auth::Result<ApiResponse> {
        self.sender.send_with_abort(request, signal).await
    }

    #[instrument(skip(self, password))]
    pub async fn login(&self, email: &str, password: &str, remember_me: bool) -> Result<Credential> {
        let credential = self.client.login(email, password, remember_me).await?;
        self.credentials().set(credential.clone()).await?;
        self.monitor.reset();
        info!("Signed in");
        Ok(credential)
    }

    /// Sign out everywhere. Cancels a refresh that is still in flight.
    pub async fn logout(&self) -> Result<()> {
        self.credentials().clear().await?;
        info!("Signed out");
        Ok(())
    }

    pub fn record_activity(&self) {
        self.monitor.record_activity();
    }

    pub fn session_status(&self) -> SessionStatus {
        self.monitor.status()
    }

    /// Call `callback` with the time left each time the expiry warning fires
    pub fn on_session_warning<F>(&self, callback: F) -> Subscription
    where
        F: Fn(Duration) + Send + 'static,
    {
        self.on_session_event(move |event| {
            if let SessionEvent::Warning { remaining } = event {
                callback(remaining);
            }
        })
    }

    pub fn on_session_expired<F>(&self, callback: F) -> Subscription
    where
        F: Fn() + Send + 'static,
    {
        self.on_session_event(move |event| {
            if event == SessionEvent::Expired {
                callback();
            }
        })
    }

    fn on_session_event<F>(&self, handler: F) -> Subscription
    where
        F: Fn(SessionEvent) + Send + 'static,
    {
        let mut events = self.monitor.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => handler(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Session listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription { task }
    }

    pub async fn registration_step(&self) -> RegistrationStep {
        self.registration.lock().await.step()
    }

    /// Complete the current registration step. The step stays put on error.
    pub async fn advance_registration(&self, action: RegistrationAction) -> Result<RegistrationStep> {
        Ok(self.registration.lock().await.advance(action).await?)
    }

    pub async fn resend_otp(&self) -> Result<()> {
        Ok(self.registration.lock().await.resend_otp().await?)
    }
}
