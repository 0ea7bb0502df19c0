//! DTOs for interacting with the application's refresh endpoint

use serde::{Deserialize, Serialize};

use crate::{AccessToken, RefreshToken, RefreshTokenRef};

/// Body of a refresh request
#[derive(Debug, Serialize)]
pub struct RefreshRequest<'a> {
    /// The refresh token to exchange
    pub refresh_token: &'a RefreshTokenRef,
}

/// Body of a successful refresh response
#[derive(Debug, Deserialize, Serialize)]
pub struct RefreshResponse {
    /// The new access token
    pub access_token: AccessToken,
    /// Lifetime of the access token in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    /// A rotated refresh token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<RefreshToken>,
}

/// Body of an OAuth2-style error response
#[derive(Debug, Deserialize)]
pub struct ErrorResponse {
    /// The error code, e.g. `invalid_grant`
    pub error: String,
    /// A human-readable description
    #[serde(default)]
    pub error_description: Option<String>,
}

/// The error code reported when a refresh token is invalid or revoked
pub const INVALID_GRANT: &str = "invalid_grant";

/// Whether an error body reports that the refresh grant itself is invalid
///
/// Recognizes the structured `{"error": "invalid_grant"}` form and, for
/// backends that forward the upstream error as text, the bare code.
pub fn is_invalid_grant(body: &str) -> bool {
    match serde_json::from_str::<ErrorResponse>(body) {
        Ok(resp) => resp.error == INVALID_GRANT,
        Err(_) => body.contains(INVALID_GRANT),
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;

    use super::*;

    #[test]
    fn missing_optional_fields_deserialize() -> Result<()> {
        let resp: RefreshResponse = serde_json::from_str(r#"{"access_token":"a2"}"#)?;
        assert_eq!(resp.access_token, AccessToken::from_static("a2"));
        assert_eq!(resp.expires_in, None);
        assert_eq!(resp.refresh_token, None);
        Ok(())
    }

    #[test]
    fn request_serializes_refresh_token() -> Result<()> {
        let req = RefreshRequest {
            refresh_token: RefreshTokenRef::from_static("r1"),
        };
        assert_eq!(serde_json::to_string(&req)?, r#"{"refresh_token":"r1"}"#);
        Ok(())
    }

    #[test]
    fn detects_invalid_grant() {
        assert!(is_invalid_grant(
            r#"{"error":"invalid_grant","error_description":"Refresh token revoked"}"#
        ));
        assert!(is_invalid_grant("upstream said: invalid_grant"));
        assert!(!is_invalid_grant(r#"{"error":"invalid_client"}"#));
        assert!(!is_invalid_grant(""));
    }
}
