//! Token issuer response types.
//!
//! Both grants answer with the same shape. A refresh grant usually omits
//! `refresh_token`; an authorization-code grant always carries one.
//!
//! # Example Response
//!
//! ```json
//! {
//!     "access_token": "BQDx...",
//!     "token_type": "Bearer",
//!     "scope": "user-read-currently-playing user-read-recently-played",
//!     "expires_in": 3600
//! }
//! ```
//!
//! A rejected exchange answers with a non-success status and an
//! [`AuthError`] body.

use std::time::Duration;

use serde::Deserialize;
use serde_with::{formats::Flexible, serde_as, DurationSeconds};
use veil::Redact;

/// Successful answer of the token issuer.
#[serde_as]
#[derive(Clone, Eq, PartialEq, Deserialize, Redact, Hash)]
pub struct AccessToken {
    /// Short-lived bearer credential. Absent in malformed answers.
    #[redact]
    #[serde(default)]
    pub access_token: Option<String>,

    #[serde(default)]
    pub token_type: Option<String>,

    #[serde(default)]
    pub scope: Option<String>,

    #[serde_as(as = "Option<DurationSeconds<u64, Flexible>>")]
    pub expires_in: Option<Duration>,

    /// Long-lived credential, returned by the authorization-code grant.
    #[redact]
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Error answer of the token issuer.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Hash)]
pub struct AuthError {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_refresh_answer() {
        let token: AccessToken = serde_json::from_str(
            r#"{"access_token":"abc","token_type":"Bearer","expires_in":3600,"scope":"x"}"#,
        )
        .unwrap();
        assert_eq!(token.access_token.as_deref(), Some("abc"));
        assert_eq!(token.expires_in, Some(Duration::from_secs(3600)));
        assert!(token.refresh_token.is_none());
        assert!(!format!("{token:?}").contains("abc"));
    }

    #[test]
    fn parses_issuer_error() {
        let error: AuthError = serde_json::from_str(
            r#"{"error":"invalid_grant","error_description":"Invalid refresh token"}"#,
        )
        .unwrap();
        assert_eq!(error.error, "invalid_grant");
    }
}
