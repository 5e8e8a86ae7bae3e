use std::time::Duration;
use url::Url;

use crate::retry::RetryPolicy;

/// API endpoint paths, relative to the configured base URL
pub mod endpoints {
    pub const LOGIN: &str = "auth/login";
    pub const REFRESH_TOKEN: &str = "refresh-token";
    pub const REGISTER: &str = "auth/register";
    pub const VERIFY_OTP: &str = "auth/verify-otp";
    pub const RESEND_OTP: &str = "auth/resend-otp";
    pub const SELECT_ROLE: &str = "auth/select-role";
}

/// Logical storage keys shared by every browser context
pub mod keys {
    pub const AUTH_TOKEN: &str = "AUTH_TOKEN";
    pub const REFRESH_TOKEN: &str = "REFRESH_TOKEN";
    pub const AUTH_EXPIRES_AT: &str = "AUTH_EXPIRES_AT";
}

pub const DEFAULT_USER_AGENT: &str = "mockwise";

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpTimeouts {
    pub connect: Duration,
    pub request: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(15),
            request: Duration::from_secs(30),
        }
    }
}

/// Configuration for the authenticated API client
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Base URL every request path is joined onto. Should end with `/`.
    pub base_url: Url,

    /// Path of the token-issuance endpoint
    pub refresh_path: String,

    /// Path of the password login endpoint
    pub login_path: String,

    /// HTTP client timeouts
    pub http_timeouts: HttpTimeouts,

    /// Custom user agent (optional)
    pub user_agent: Option<String>,

    /// Retry policy for network-class failures
    pub retry: RetryPolicy,
}

impl AuthConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url: normalize_base(base_url),
            refresh_path: endpoints::REFRESH_TOKEN.to_string(),
            login_path: endpoints::LOGIN.to_string(),
            http_timeouts: HttpTimeouts::default(),
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// `Url::join` drops the last path segment unless the base ends with a slash.
fn normalize_base(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}
