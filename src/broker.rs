//! Credential Broker.
//!
//! Turns the stored refresh credential into a short-lived [`BearerToken`].
//! There is no cache: every call performs a fresh exchange, and nothing is
//! retried here. Retry policy belongs to the caller.
//!
//! # Example
//!
//! ```rust
//! use nowplaying::{broker::CredentialBroker, config::Config, http::Client as HttpClient};
//!
//! let broker = CredentialBroker::new(&config, HttpClient::new(&config)?);
//! let token = broker.exchange().await?;
//! ```

use async_trait::async_trait;
use url::Url;

use crate::{
    config::{Config, Credentials},
    error::{Error, Result},
    http::Client as HttpClient,
    protocol::auth,
    tokens::{BearerToken, TokenProvider},
};

pub struct CredentialBroker {
    credentials: Credentials,
    token_url: Url,
    http_client: HttpClient,
}

impl CredentialBroker {
    /// Creates a broker for the Credential Pair in `config`.
    ///
    /// Missing credentials are not an error yet: they fail every exchange.
    #[must_use]
    pub fn new(config: &Config, http_client: HttpClient) -> Self {
        Self {
            credentials: config.credentials.clone(),
            token_url: config.token_url.clone(),
            http_client,
        }
    }

    /// Exchanges the refresh credential for a bearer token.
    ///
    /// # Errors
    ///
    /// * `Configuration` if any of the three credentials is absent; no
    ///   request is made in that case
    /// * `TokenExchange` if the issuer refuses, carrying its error body
    /// * a transport error kind if the issuer cannot be reached
    pub async fn exchange(&self) -> Result<BearerToken> {
        let (client_id, client_secret, refresh_token) = match &self.credentials {
            Credentials {
                client_id: Some(id),
                client_secret: Some(secret),
                refresh_token: Some(token),
            } => (id, secret, token),
            credentials => {
                return Err(Error::configuration(format!(
                    "missing {}",
                    credentials.missing().join(", ")
                )));
            }
        };

        let answer = self
            .grant(
                client_id,
                client_secret,
                &[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh_token),
                ],
            )
            .await?;

        let access_token = answer
            .access_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| Error::token_exchange("no access token received"))?;

        debug!("bearer token received");
        Ok(BearerToken::new(access_token, answer.expires_in))
    }

    /// Exchanges a one-time authorization code for the long-lived refresh
    /// credential.
    ///
    /// Only the client id and secret are needed. `redirect_uri` must be the
    /// one the authorization request was made with.
    ///
    /// # Errors
    ///
    /// * `Configuration` if the client id or secret is absent
    /// * `InvalidArgument` if `code` is empty
    /// * `TokenExchange` if the issuer refuses or returns no refresh token
    pub async fn authorize(&self, code: &str, redirect_uri: &Url) -> Result<String> {
        let (Some(client_id), Some(client_secret)) = (
            self.credentials.client_id.as_deref(),
            self.credentials.client_secret.as_deref(),
        ) else {
            let missing: Vec<_> = self
                .credentials
                .missing()
                .into_iter()
                .filter(|name| *name != "refresh token")
                .collect();
            return Err(Error::configuration(format!("missing {}", missing.join(", "))));
        };

        let code = code.trim();
        if code.is_empty() {
            return Err(Error::invalid_argument("authorization code is empty"));
        }

        let answer = self
            .grant(
                client_id,
                client_secret,
                &[
                    ("grant_type", "authorization_code"),
                    ("code", code),
                    ("redirect_uri", redirect_uri.as_str()),
                ],
            )
            .await?;

        answer
            .refresh_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| Error::token_exchange("no refresh token received"))
    }

    /// Posts `form` to the token issuer with HTTP Basic client credentials.
    async fn grant(
        &self,
        client_id: &str,
        client_secret: &str,
        form: &[(&str, &str)],
    ) -> Result<auth::AccessToken> {
        let mut request = self.http_client.post_form(self.token_url.clone(), form)?;
        HttpClient::basic(&mut request, client_id, client_secret)?;

        let response = self.http_client.execute(request).await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let reason = match serde_json::from_str::<auth::AuthError>(&body) {
                Ok(error) => match error.error_description {
                    Some(description) => format!("{status}: {} ({description})", error.error),
                    None => format!("{status}: {}", error.error),
                },
                Err(_) => format!("{status}: {body}"),
            };
            warn!("token exchange refused: {reason}");
            return Err(Error::token_exchange(reason));
        }

        // Not `protocol::json`: the raw body must not reach the logs.
        let answer: auth::AccessToken = serde_json::from_str(&body)
            .map_err(|e| Error::token_exchange(format!("malformed answer: {e}")))?;
        trace!("token: {answer:?}");
        Ok(answer)
    }
}

#[async_trait]
impl TokenProvider for CredentialBroker {
    async fn bearer_token(&self) -> Result<BearerToken> {
        self.exchange().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn broker(credentials: Credentials) -> CredentialBroker {
        // Nothing listens here; any request would fail with `Unavailable`.
        let config = Config::with_credentials(credentials)
            .with_base_url("http://127.0.0.1:9")
            .unwrap();
        CredentialBroker::new(&config, HttpClient::new(&config).unwrap())
    }

    #[tokio::test]
    async fn missing_credentials_are_named() {
        let broker = broker(Credentials::new(Some("id"), None, None));
        let err = broker.exchange().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);
        assert_eq!(
            err.to_string(),
            "configuration error: missing client secret, refresh token"
        );
    }

    #[tokio::test]
    async fn authorize_does_not_need_a_refresh_token() {
        let broker = broker(Credentials::new(Some("id"), Some("secret"), None));
        let redirect = Url::parse("http://localhost/callback").unwrap();
        let err = broker.authorize("  ", &redirect).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }
}
