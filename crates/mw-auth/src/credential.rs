use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::RefreshError;
use crate::models::TokenResponse;

/// Access/refresh token pair with its server-issued expiry
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    /// Survives restarts when true, otherwise lives only for this session
    pub persistent: bool,
}

impl Credential {
    /// Build a credential from a token response.
    ///
    /// When the response omits `refreshToken` the previous one is kept.
    /// The expiry comes from `expiresIn`, or from the access token's `exp`
    /// claim if that is missing.
    pub fn from_token_response(
        response: TokenResponse,
        previous_refresh_token: Option<&str>,
        persistent: bool,
    ) -> Result<Self, RefreshError> {
        let refresh_token = response
            .refresh_token
            .or_else(|| previous_refresh_token.map(str::to_string))
            .ok_or(RefreshError::MissingRefreshToken)?;

        let expires_at = match response.expires_in {
            Some(secs) => i64::try_from(secs)
                .ok()
                .and_then(TimeDelta::try_seconds)
                .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
                .ok_or_else(|| {
                    RefreshError::InvalidResponse(format!("expiresIn out of range: {secs}"))
                })?,
            None => jwt_expiry(&response.token).ok_or_else(|| {
                RefreshError::InvalidResponse(
                    "token response carries neither expiresIn nor an exp claim".to_string(),
                )
            })?,
        };

        Ok(Self {
            access_token: response.token,
            refresh_token,
            expires_at,
            persistent,
        })
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Time until the access token expires, zero when already expired
    pub fn remaining(&self) -> std::time::Duration {
        (self.expires_at - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO)
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("persistent", &self.persistent)
            .finish()
    }
}

/// Read the `exp` claim of a JWT without verifying it
pub fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    #[derive(Deserialize)]
    struct Claims {
        exp: i64,
    }

    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Claims = serde_json::from_slice(&bytes).ok()?;
    Utc.timestamp_opt(claims.exp, 0).single()
}
