//! HTTP client with rate limiting for the token issuer and remote API.
//!
//! This module provides a wrapper around `reqwest::Client` that adds:
//! * Request rate limiting to stay within the service's quota
//! * Consistent timeouts and `User-Agent`
//! * Helpers for the two authorization schemes in use: HTTP Basic for the
//!   token issuer and Bearer for the remote API
//!
//! # Rate Limiting
//!
//! The service computes its limit over a rolling 30 second window. Requests
//! that would exceed 180 calls in that window are delayed, not dropped.
//!
//! The budget is shared by a client and all its clones. Build one client per
//! process and hand clones to every component.
//!
//! # Example
//!
//! ```rust
//! use nowplaying::http::Client;
//!
//! let client = Client::new(&config)?;
//! let mut request = client.get(url);
//! Client::bearer(&mut request, &token)?;
//! let response = client.execute(request).await?;
//! ```

use std::{future::Future, num::NonZeroU32, sync::Arc, time::Duration};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures_util::{FutureExt, TryFutureExt};
use governor::{DefaultDirectRateLimiter, Quota};
use reqwest::{
    header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Body, Method, Url,
};

use crate::{config::Config, error::Result, tokens::BearerToken};

/// HTTP client with built-in rate limiting.
///
/// Clones share the connection pool and the rate limit.
#[derive(Clone)]
pub struct Client {
    /// Unlimited request client for special cases.
    pub unlimited: reqwest::Client,

    rate_limiter: Arc<DefaultDirectRateLimiter>,
}

impl Client {
    /// Rolling window over which the remote service counts requests.
    const RATE_LIMIT_INTERVAL: Duration = Duration::from_secs(30);

    /// Maximum allowed API calls per interval.
    const RATE_LIMIT_CALLS_PER_INTERVAL: u8 = 180;

    /// Duration to keep idle connections alive.
    const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Duration to wait for a connection to be established.
    const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Duration to wait for a complete response.
    ///
    /// Every call here is a small JSON exchange, so a slow response is as
    /// good as a failed one.
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

    /// Form content type used by the token issuer.
    const FORM_CONTENT: HeaderValue = HeaderValue::from_static("application/x-www-form-urlencoded");

    /// JSON content type used by the remote API.
    const JSON_CONTENT: HeaderValue = HeaderValue::from_static("application/json");

    /// Creates a new client.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built.
    ///
    /// # Panics
    ///
    /// Panics if rate limit parameters are zero.
    pub fn new(config: &Config) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .tcp_keepalive(Self::KEEPALIVE_TIMEOUT)
            .connect_timeout(Self::CONNECT_TIMEOUT)
            .timeout(Self::REQUEST_TIMEOUT)
            .user_agent(&config.user_agent);

        // Rate limit own requests as to not get throttled by the service.
        let replenish_interval =
            Self::RATE_LIMIT_INTERVAL / u32::from(Self::RATE_LIMIT_CALLS_PER_INTERVAL);
        let quota = Quota::with_period(replenish_interval)
            .expect("quota time interval is zero")
            .allow_burst(
                NonZeroU32::new(Self::RATE_LIMIT_CALLS_PER_INTERVAL.into())
                    .expect("calls per interval is zero"),
            );

        Ok(Self {
            unlimited: http_client.build()?,
            rate_limiter: Arc::new(governor::RateLimiter::direct(quota)),
        })
    }

    /// Builds a request with specified method, URL and body.
    pub fn request<U, T>(&self, method: Method, url: U, body: T) -> reqwest::Request
    where
        U: Into<Url>,
        T: Into<Body>,
    {
        let mut request = reqwest::Request::new(method, url.into());
        let body_mut = request.body_mut();
        *body_mut = Some(body.into());

        request
    }

    /// Builds a GET request without a body.
    pub fn get<U>(&self, url: U) -> reqwest::Request
    where
        U: Into<Url>,
    {
        reqwest::Request::new(Method::GET, url.into())
    }

    /// Builds a form-encoded POST request.
    ///
    /// # Errors
    ///
    /// Returns error if the form cannot be encoded.
    pub fn post_form<U>(&self, url: U, form: &[(&str, &str)]) -> Result<reqwest::Request>
    where
        U: Into<Url>,
    {
        let body = encode_form(form);
        let mut request = self.request(Method::POST, url, body);
        request
            .headers_mut()
            .try_insert(CONTENT_TYPE, Self::FORM_CONTENT)?;
        Ok(request)
    }

    /// Builds a PUT request, with a JSON body if one is given.
    ///
    /// # Errors
    ///
    /// Returns error if the body cannot be serialized.
    pub fn put_json<U, T>(&self, url: U, body: Option<&T>) -> Result<reqwest::Request>
    where
        U: Into<Url>,
        T: serde::Serialize,
    {
        match body {
            Some(body) => {
                let json = serde_json::to_vec(body)?;
                let mut request = self.request(Method::PUT, url, json);
                request
                    .headers_mut()
                    .try_insert(CONTENT_TYPE, Self::JSON_CONTENT)?;
                Ok(request)
            }
            None => Ok(self.request(Method::PUT, url, Vec::new())),
        }
    }

    /// Adds HTTP Basic authorization to `request`.
    ///
    /// # Errors
    ///
    /// Returns error if the header value is invalid.
    pub fn basic(request: &mut reqwest::Request, username: &str, password: &str) -> Result<()> {
        let encoded = BASE64.encode(format!("{username}:{password}"));
        let mut value = HeaderValue::from_str(&format!("Basic {encoded}"))?;
        value.set_sensitive(true);
        request.headers_mut().try_insert(AUTHORIZATION, value)?;
        Ok(())
    }

    /// Adds Bearer authorization to `request`.
    ///
    /// # Errors
    ///
    /// Returns error if the header value is invalid.
    pub fn bearer(request: &mut reqwest::Request, token: &BearerToken) -> Result<()> {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", token.as_str()))?;
        value.set_sensitive(true);
        request.headers_mut().try_insert(AUTHORIZATION, value)?;
        Ok(())
    }

    /// Executes a request with rate limiting.
    ///
    /// # Errors
    ///
    /// Returns error if the request cannot be sent or no response arrives.
    /// Non-success statuses are not errors here; callers interpret them.
    pub fn execute(
        &self,
        request: reqwest::Request,
    ) -> impl Future<Output = Result<reqwest::Response>> + '_ {
        trace!("{} {}", request.method(), request.url());
        let throttle = self.rate_limiter.until_ready();
        throttle.then(|()| self.unlimited.execute(request).map_err(Into::into))
    }
}

/// Encodes `form` as `application/x-www-form-urlencoded`.
fn encode_form(form: &[(&str, &str)]) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(form)
        .finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;

    fn client() -> Client {
        Client::new(&Config::with_credentials(Credentials::default())).unwrap()
    }

    #[test]
    fn form_body_is_url_encoded() {
        assert_eq!(
            encode_form(&[("grant_type", "refresh_token"), ("refresh_token", "a b&c")]),
            "grant_type=refresh_token&refresh_token=a+b%26c"
        );
    }

    #[test]
    fn basic_authorization_is_base64_of_id_and_secret() {
        let client = client();
        let url = Url::parse("http://localhost/api/token").unwrap();
        let mut request = client.post_form(url, &[("a", "b")]).unwrap();
        Client::basic(&mut request, "id", "secret").unwrap();

        let header = request.headers().get(AUTHORIZATION).unwrap();
        assert_eq!(header.to_str().unwrap(), "Basic aWQ6c2VjcmV0");
        assert!(header.is_sensitive());
        assert_eq!(
            request.headers().get(CONTENT_TYPE).unwrap(),
            "application/x-www-form-urlencoded"
        );
    }

    #[test]
    fn clones_share_the_rate_limit() {
        let client = client();
        let clone = client.clone();

        for _ in 0..Client::RATE_LIMIT_CALLS_PER_INTERVAL {
            assert!(client.rate_limiter.check().is_ok());
        }
        assert!(clone.rate_limiter.check().is_err());
    }

    #[test]
    fn json_put_has_json_content_type() {
        let client = client();
        let url = Url::parse("http://localhost/v1/me/player/play").unwrap();
        let request = client
            .put_json(url, Some(&serde_json::json!({ "uris": ["spotify:track:1"] })))
            .unwrap();
        assert_eq!(request.method(), Method::PUT);
        assert_eq!(request.headers().get(CONTENT_TYPE).unwrap(), "application/json");
    }
}
