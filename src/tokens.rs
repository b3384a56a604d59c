use std::{fmt, time::Duration};

use async_trait::async_trait;
use veil::Redact;

use crate::error::Result;

/// Short-lived credential authorizing calls to the remote music API.
///
/// A bearer token is never cached: whoever needs one asks its
/// [`TokenProvider`] again. The time to live is kept for diagnostics only.
#[derive(Clone, Redact, PartialEq, Eq, Hash)]
pub struct BearerToken {
    #[redact]
    value: String,
    expires_in: Option<Duration>,
}

impl BearerToken {
    #[must_use]
    pub fn new(value: impl Into<String>, expires_in: Option<Duration>) -> Self {
        Self {
            value: value.into(),
            expires_in,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.value
    }

    #[must_use]
    pub fn expires_in(&self) -> Option<Duration> {
        self.expires_in
    }
}

/// Shows the token length only.
impl fmt::Display for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} characters>", self.value.chars().count())
    }
}

/// Source of fresh bearer tokens.
///
/// Every call must perform a new exchange. Implementations may fail with
/// `Configuration` (no recovery possible) or `TokenExchange`.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn bearer_token(&self) -> Result<BearerToken>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_prints_its_value() {
        let token = BearerToken::new("BQDx-very-secret", Some(Duration::from_secs(3600)));
        assert!(!format!("{token}").contains("secret"));
        assert!(!format!("{token:?}").contains("secret"));
        assert_eq!(token.as_str(), "BQDx-very-secret");
        assert_eq!(token.expires_in(), Some(Duration::from_secs(3600)));
    }
}
