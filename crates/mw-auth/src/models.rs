use serde::{Deserialize, Serialize};

/// `POST /refresh-token` request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTokenRequest {
    pub refresh_token: String,
}

/// Token response shared by login, refresh and OTP verification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Access token lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// `POST /auth/login` request
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Error body returned by the API on rejected requests
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default, alias = "error")]
    pub message: Option<String>,
}

impl ApiErrorBody {
    /// Best-effort extraction of a human readable message
    pub fn message_from(body: &str) -> Option<String> {
        serde_json::from_str::<ApiErrorBody>(body)
            .ok()
            .and_then(|b| b.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_response_optional_fields() {
        let parsed: TokenResponse = serde_json::from_str(r#"{"token":"abc"}"#).unwrap();
        assert_eq!(parsed.token, "abc");
        assert!(parsed.refresh_token.is_none());
        assert!(parsed.expires_in.is_none());

        let parsed: TokenResponse =
            serde_json::from_str(r#"{"token":"abc","refreshToken":"r","expiresIn":900}"#).unwrap();
        assert_eq!(parsed.refresh_token.as_deref(), Some("r"));
        assert_eq!(parsed.expires_in, Some(900));
    }

    #[test]
    fn test_refresh_request_wire_shape() {
        let body = serde_json::to_value(RefreshTokenRequest {
            refresh_token: "r1".to_string(),
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({ "refreshToken": "r1" }));
    }

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(
            ApiErrorBody::message_from(r#"{"message":"Invalid OTP"}"#).as_deref(),
            Some("Invalid OTP")
        );
        assert_eq!(
            ApiErrorBody::message_from(r#"{"error":"Email taken"}"#).as_deref(),
            Some("Email taken")
        );
        assert!(ApiErrorBody::message_from("<html>").is_none());
    }
}
