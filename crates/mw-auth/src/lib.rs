//! Authenticated API client for the Mockwise interview-preparation service
//!
//! This crate wraps a plain "send a request" primitive with everything needed
//! to talk to the API on behalf of a signed-in user.
//!
//! # Request Flow
//!
//! 1. The current access token is read from the [`CredentialStore`] and
//!    attached as `Authorization: Bearer <token>`
//! 2. On `401` the [`RefreshCoordinator`] exchanges the refresh token; the
//!    request is resent once with the new token
//! 3. On network failures the [`RetryPolicy`] decides whether to back off and
//!    resend
//! 4. Any other non-2xx status is returned to the caller untouched
//!
//! Concurrent requests that hit `401` at the same time share a single refresh
//! exchange. A failed refresh clears the credential store (forced logout).
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mw_auth::{
//!     ApiRequest, AuthClient, AuthConfig, AuthorizedRequestSender, CredentialStore,
//!     HttpTransport, RefreshCoordinator,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AuthConfig::new("https://api.mockwise.dev/".parse()?);
//!     let transport = Arc::new(HttpTransport::new(&config)?);
//!     let store = CredentialStore::in_memory().await?;
//!
//!     let client = AuthClient::new(config.clone(), transport.clone());
//!     store.set(client.login("ada@example.com", "hunter2", false).await?).await?;
//!
//!     let coordinator = RefreshCoordinator::new(Arc::new(client), store);
//!     let sender = AuthorizedRequestSender::new(transport, coordinator, config.retry);
//!
//!     let response = sender.send(ApiRequest::get("interviews")).await?;
//!     println!("{}", response.body);
//!     Ok(())
//! }
//! ```
//!
//! # Credential Storage
//!
//! Credentials live in a shared key-value area with change notification, so
//! every context sharing the area sees logins, refreshes and logouts:
//!
//! ```
//! use std::sync::Arc;
//! use mw_auth::{CredentialStore, MemoryKeyValueStore};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let durable = Arc::new(MemoryKeyValueStore::new());
//! let ephemeral = Arc::new(MemoryKeyValueStore::new());
//!
//! let tab_a = CredentialStore::open(durable.clone(), ephemeral.clone()).await?;
//! let tab_b = CredentialStore::open(durable, ephemeral).await?;
//!
//! let mut changes = tab_b.subscribe();
//! tab_a.clear().await?;
//! # let _ = changes.has_changed();
//! # Ok(())
//! # }
//! # tokio_test::block_on(example()).unwrap();
//! ```
//!
//! Use [`FileKeyValueStore`] as the durable area so credentials marked
//! `persistent` survive restarts.

pub mod abort;
pub mod client;
pub mod config;
pub mod credential;
pub mod credential_store;
pub mod errors;
pub mod file_store;
pub mod models;
pub mod refresh;
pub mod retry;
pub mod sender;
pub mod store;
pub mod transport;

// Re-export main types
pub use abort::{AbortController, AbortSignal};
pub use client::AuthClient;
pub use config::{AuthConfig, HttpTimeouts};
pub use credential::Credential;
pub use credential_store::CredentialStore;
pub use errors::{AuthError, RefreshError, Result};
pub use file_store::FileKeyValueStore;
pub use models::{ApiErrorBody, TokenResponse};
pub use refresh::{RefreshCoordinator, TokenExchange};
pub use retry::{FailureClass, RetryDecision, RetryPolicy, RetryState};
pub use sender::AuthorizedRequestSender;
pub use store::{KeyChange, KeyValueStore, MemoryKeyValueStore, StorageEvent};
pub use transport::{ApiRequest, ApiResponse, HttpTransport, Transport, TransportError};
