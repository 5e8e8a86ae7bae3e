use thiserror::Error;

/// Errors surfaced by the authenticated client layer
#[derive(Error, Debug)]
pub enum AuthError {
    /// The access token was rejected and could not be renewed. Callers are
    /// expected to send the user back to the login screen.
    #[error("Session expired: {0}")]
    AuthExpired(#[from] RefreshError),

    /// A resend carrying a freshly refreshed token was rejected again.
    #[error("Request unauthorized even after refreshing the access token")]
    Unauthorized,

    #[error("Network failure persisted after {attempts} attempts: {last_error}")]
    NetworkExhausted { attempts: u32, last_error: String },

    #[error("HTTP error {status}: {}", snippet(.body))]
    Http {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request was aborted")]
    Cancelled,

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage is locked by another process")]
    LockTimeout,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Failure of a refresh-token exchange.
///
/// Cloned once per queued waiter, so every caller that joined the same
/// exchange observes the same failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("No refresh token available")]
    MissingRefreshToken,

    #[error("Token endpoint rejected the refresh with {status}: {body_snippet}")]
    Rejected { status: u16, body_snippet: String },

    #[error("Refresh exchange failed: {0}")]
    Transport(String),

    #[error("Invalid token response: {0}")]
    InvalidResponse(String),

    #[error("Failed to persist refreshed credential: {0}")]
    Storage(String),

    #[error("Signed out while the refresh was in flight")]
    LoggedOut,
}

fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}

pub type Result<T> = std::result::Result<T, AuthError>;
