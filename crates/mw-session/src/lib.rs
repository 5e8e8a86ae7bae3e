//! Session lifetime and account onboarding for Mockwise clients
//!
//! - [`SessionMonitor`] expires idle sessions, warns ahead of expiry and
//!   refreshes the access token before it runs out
//! - [`RegistrationStateMachine`] walks a new account through
//!   `register -> verify-otp -> select-role -> complete`
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mw_auth::{AuthClient, AuthConfig, CredentialStore, HttpTransport, RefreshCoordinator};
//! use mw_session::{SessionConfig, SessionEvent, SessionMonitor};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AuthConfig::new("https://api.mockwise.dev/".parse()?);
//!     let transport = Arc::new(HttpTransport::new(&config)?);
//!     let client = AuthClient::new(config, transport);
//!     let coordinator = RefreshCoordinator::new(Arc::new(client), CredentialStore::in_memory().await?);
//!
//!     let monitor = SessionMonitor::start(SessionConfig::default(), coordinator);
//!     let mut events = monitor.subscribe();
//!     while let Ok(event) = events.recv().await {
//!         if event == SessionEvent::Expired {
//!             println!("Signed out after inactivity");
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod errors;
pub mod monitor;
pub mod registration;

pub use api::HttpRegistrationApi;
pub use config::SessionConfig;
pub use errors::{RegistrationError, Result};
pub use monitor::{SessionEvent, SessionMonitor, SessionState, SessionStatus};
pub use registration::{
    RegisterForm, RegistrationAction, RegistrationApi, RegistrationProgress,
    RegistrationStateMachine, RegistrationStep, Role,
};
