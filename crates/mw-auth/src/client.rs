use std::sync::Arc;

use reqwest::StatusCode;
use tracing::{debug, instrument, warn};

use crate::config::AuthConfig;
use crate::credential::Credential;
use crate::errors::{AuthError, RefreshError, Result};
use crate::models::{LoginRequest, RefreshTokenRequest, TokenResponse};
use crate::refresh::TokenExchange;
use crate::transport::{ApiRequest, Transport};

/// Unauthenticated calls against the token-issuing endpoints
#[derive(Clone)]
pub struct AuthClient {
    config: AuthConfig,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for AuthClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthClient")
            .field("base_url", &self.config.base_url.as_str())
            .finish()
    }
}

impl AuthClient {
    pub fn new(config: AuthConfig, transport: Arc<dyn Transport>) -> Self {
        Self { config, transport }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Exchange email and password for a credential
    #[instrument(skip(self, password))]
    pub async fn login(&self, email: &str, password: &str, remember_me: bool) -> Result<Credential> {
        let request = ApiRequest::post(&self.config.login_path).json(&LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        })?;

        debug!("Logging in");
        let response = self
            .transport
            .execute(&request)
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?
            .error_for_status()?;

        let tokens: TokenResponse = response.json()?;
        Credential::from_token_response(tokens, None, remember_me)
            .map_err(|e| AuthError::InvalidResponse(e.to_string()))
    }
}

#[async_trait::async_trait]
impl TokenExchange for AuthClient {
    #[instrument(skip(self, refresh_token))]
    async fn exchange(&self, refresh_token: &str) -> std::result::Result<TokenResponse, RefreshError> {
        let request = ApiRequest::post(&self.config.refresh_path)
            .json(&RefreshTokenRequest {
                refresh_token: refresh_token.to_string(),
            })
            .map_err(|e| RefreshError::Transport(e.to_string()))?;

        debug!("Exchanging refresh token");
        let response = self
            .transport
            .execute(&request)
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;

        if !response.status.is_success() {
            if response.status == StatusCode::UNAUTHORIZED || response.status == StatusCode::FORBIDDEN
            {
                warn!("Refresh token rejected");
            }
            return Err(RefreshError::Rejected {
                status: response.status.as_u16(),
                body_snippet: response.body.chars().take(200).collect(),
            });
        }

        response
            .json::<TokenResponse>()
            .map_err(|e| RefreshError::InvalidResponse(e.to_string()))
    }
}
