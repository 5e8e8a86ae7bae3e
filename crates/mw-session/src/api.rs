//! Registration endpoints over HTTP.

use std::sync::Arc;

use mw_auth::config::endpoints;
use mw_auth::{
    ApiErrorBody, ApiRequest, ApiResponse, AuthError, AuthorizedRequestSender, Credential,
    TokenResponse, Transport,
};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::errors::{RegistrationError, Result};
use crate::registration::{RegisterForm, RegistrationApi, Role};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterResponse {
    #[serde(alias = "id")]
    user_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifyOtpRequest<'a> {
    user_id: &'a str,
    otp: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubjectRequest<'a> {
    user_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SelectRoleRequest<'a> {
    user_id: &'a str,
    role: Role,
}

/// [`RegistrationApi`] backed by the Mockwise API.
///
/// `register`, `verify-otp` and `resend-otp` are sent anonymously;
/// `select-role` goes through the authorized sender so it carries the
/// credential issued at OTP verification.
#[derive(Clone)]
pub struct HttpRegistrationApi {
    transport: Arc<dyn Transport>,
    sender: AuthorizedRequestSender,
    remember_me: bool,
}

impl std::fmt::Debug for HttpRegistrationApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRegistrationApi")
            .field("remember_me", &self.remember_me)
            .finish()
    }
}

impl HttpRegistrationApi {
    pub fn new(transport: Arc<dyn Transport>, sender: AuthorizedRequestSender) -> Self {
        Self {
            transport,
            sender,
            remember_me: false,
        }
    }

    /// Store the credential issued at OTP verification durably
    pub fn remember_me(mut self, remember_me: bool) -> Self {
        self.remember_me = remember_me;
        self
    }

    async fn post_anonymous(&self, request: ApiRequest) -> Result<ApiResponse> {
        let response = self
            .transport
            .execute(&request)
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;
        check_status(response)
    }
}

/// Map rejected submissions to [`RegistrationError::ValidationFailed`]
fn check_status(response: ApiResponse) -> Result<ApiResponse> {
    match response.status {
        s if s.is_success() => Ok(response),
        StatusCode::BAD_REQUEST | StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
            Err(validation_failed(response.status, &response.body))
        }
        status => Err(AuthError::Http {
            status,
            body: response.body,
        }
        .into()),
    }
}

fn validation_failed(status: StatusCode, body: &str) -> RegistrationError {
    let message = ApiErrorBody::message_from(body).unwrap_or_else(|| {
        status
            .canonical_reason()
            .unwrap_or("Request rejected")
            .to_string()
    });
    RegistrationError::ValidationFailed {
        status: status.as_u16(),
        message,
    }
}

#[async_trait::async_trait]
impl RegistrationApi for HttpRegistrationApi {
    #[instrument(skip(self, form), fields(email = %form.email))]
    async fn register(&self, form: &RegisterForm) -> Result<String> {
        let request = ApiRequest::post(endpoints::REGISTER).json(form)?;
        let response = self.post_anonymous(request).await?;
        let body: RegisterResponse = response.json()?;
        Ok(body.user_id)
    }

    #[instrument(skip(self, code))]
    async fn verify_otp(&self, subject_id: &str, code: &str) -> Result<()> {
        let request = ApiRequest::post(endpoints::VERIFY_OTP).json(&VerifyOtpRequest {
            user_id: subject_id,
            otp: code,
        })?;
        let response = self.post_anonymous(request).await?;

        if response.body.trim().is_empty() {
            return Ok(());
        }
        // Tokens in the answer mean the account is signed in straight away
        let body: serde_json::Value = response.json()?;
        if body.get("token").is_some() {
            let tokens: TokenResponse = serde_json::from_value(body).map_err(AuthError::from)?;
            let credential = Credential::from_token_response(tokens, None, self.remember_me)
                .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;
            self.sender.store().set(credential).await?;
            info!("Account verified and signed in");
        } else {
            debug!("Account verified without tokens");
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn resend_otp(&self, subject_id: &str) -> Result<()> {
        let request = ApiRequest::post(endpoints::RESEND_OTP).json(&SubjectRequest {
            user_id: subject_id,
        })?;
        self.post_anonymous(request).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn select_role(&self, subject_id: &str, role: Role) -> Result<()> {
        let request = ApiRequest::post(endpoints::SELECT_ROLE).json(&SelectRoleRequest {
            user_id: subject_id,
            role,
        })?;

        match self.sender.send(request).await {
            Ok(_) => Ok(()),
            Err(AuthError::Http { status, body })
                if matches!(
                    status,
                    StatusCode::BAD_REQUEST | StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY
                ) =>
            {
                Err(validation_failed(status, &body))
            }
            Err(e) => Err(e.into()),
        }
    }
}
