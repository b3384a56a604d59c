//! Client for the remote music-service API.
//!
//! Every call asks the [`TokenProvider`] for a fresh bearer token; tokens are
//! never reused across calls. Responses are parsed into [`protocol::player`]
//! types and non-success statuses are turned into errors, so that callers
//! decide what a failure means for them.
//!
//! # Endpoints
//!
//! | Method | Path                              | Used by             |
//! |--------|-----------------------------------|---------------------|
//! | GET    | `me/player/currently-playing`     | Track Resolver      |
//! | GET    | `me/player/recently-played`       | Track Resolver      |
//! | PUT    | `me/player`                       | Start Protocol      |
//! | PUT    | `me/player/play`                  | Start Protocol      |
//! | PUT    | `me/player/pause`                 | Connect device      |
//! | GET    | `me/player`                       | Connect device      |
//! | GET    | `me/player/devices`               | Connect device      |

use std::sync::Arc;

use reqwest::{Response, StatusCode};
use url::Url;

use crate::{
    config::Config,
    error::{Error, ErrorKind, Result},
    http::Client as HttpClient,
    protocol::{
        self,
        player::{
            ApiError, CurrentlyPlaying, DeviceObject, Devices, PlaybackState, RecentlyPlayed,
            StartPlayback, TransferPlayback,
        },
    },
    tokens::TokenProvider,
};

pub struct WebApi {
    api_url: Url,
    http_client: HttpClient,
    tokens: Arc<dyn TokenProvider>,
}

impl WebApi {
    /// Creates a client that authorizes with tokens from `tokens`.
    #[must_use]
    pub fn new(config: &Config, tokens: Arc<dyn TokenProvider>, http_client: HttpClient) -> Self {
        Self {
            api_url: config.api_url.clone(),
            http_client,
            tokens,
        }
    }

    /// The provider every call takes its bearer token from.
    #[must_use]
    pub fn tokens(&self) -> Arc<dyn TokenProvider> {
        Arc::clone(&self.tokens)
    }

    /// What the listener is playing right now.
    ///
    /// Returns `None` on `204 No Content`, which the service sends when
    /// nothing is playing.
    ///
    /// # Errors
    ///
    /// Returns error if no token can be obtained, the request fails, the
    /// service answers with a non-success status or the payload is malformed.
    pub async fn currently_playing(&self) -> Result<Option<CurrentlyPlaying>> {
        let url = self.url("me/player/currently-playing")?;
        let response = self.send(self.http_client.get(url)).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let body = Self::success_body(response).await?;
        protocol::json(&body, "currently playing").map(Some)
    }

    /// The `limit` most recently played tracks, most recent first.
    ///
    /// # Errors
    ///
    /// As [`currently_playing`](Self::currently_playing).
    pub async fn recently_played(&self, limit: u8) -> Result<RecentlyPlayed> {
        let mut url = self.url("me/player/recently-played")?;
        url.query_pairs_mut().append_pair("limit", &limit.to_string());

        let response = self.send(self.http_client.get(url)).await?;
        let body = Self::success_body(response).await?;
        protocol::json(&body, "recently played")
    }

    /// Transfers playback ownership to `device_id` without starting to play.
    ///
    /// `404 Not Found` counts as success: the service sends it when no device
    /// was active before, which is the normal case for a first transfer.
    ///
    /// # Errors
    ///
    /// Returns error on any other non-success status.
    pub async fn transfer_playback(&self, device_id: &str) -> Result<()> {
        let url = self.url("me/player")?;
        let request = self
            .http_client
            .put_json(url, Some(&TransferPlayback::to(device_id)))?;

        let response = self.send(request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!("transfer to {device_id}: no active device before");
            return Ok(());
        }

        Self::success_body(response).await.map(|_| ())
    }

    /// Starts playing `uri` on the active device.
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if the service does not know an active
    /// device yet, or another error on any non-success status.
    pub async fn play(&self, uri: &str) -> Result<()> {
        let url = self.url("me/player/play")?;
        let request = self
            .http_client
            .put_json(url, Some(&StartPlayback::uri(uri)))?;

        let response = self.send(request).await?;
        Self::success_body(response).await.map(|_| ())
    }

    /// Resumes whatever is loaded on `device_id`, or on the active device.
    ///
    /// # Errors
    ///
    /// As [`play`](Self::play).
    pub async fn resume(&self, device_id: Option<&str>) -> Result<()> {
        let url = self.device_url("me/player/play", device_id)?;
        let request = self.http_client.put_json::<_, ()>(url, None)?;
        let response = self.send(request).await?;
        Self::success_body(response).await.map(|_| ())
    }

    /// Pauses `device_id`, or the active device.
    ///
    /// # Errors
    ///
    /// As [`play`](Self::play).
    pub async fn pause(&self, device_id: Option<&str>) -> Result<()> {
        let url = self.device_url("me/player/pause", device_id)?;
        let request = self.http_client.put_json::<_, ()>(url, None)?;
        let response = self.send(request).await?;
        Self::success_body(response).await.map(|_| ())
    }

    /// Playback state of the active device, or `None` if no device is
    /// active.
    ///
    /// # Errors
    ///
    /// As [`currently_playing`](Self::currently_playing).
    pub async fn playback_state(&self) -> Result<Option<PlaybackState>> {
        let url = self.url("me/player")?;
        let response = self.send(self.http_client.get(url)).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let body = Self::success_body(response).await?;
        protocol::json(&body, "playback state").map(Some)
    }

    /// Devices currently visible to the service for this account.
    ///
    /// # Errors
    ///
    /// As [`currently_playing`](Self::currently_playing).
    pub async fn devices(&self) -> Result<Vec<DeviceObject>> {
        let url = self.url("me/player/devices")?;
        let response = self.send(self.http_client.get(url)).await?;
        let body = Self::success_body(response).await?;
        protocol::json::<Devices>(&body, "devices").map(|devices| devices.devices)
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.api_url.join(path).map_err(Into::into)
    }

    fn device_url(&self, path: &str, device_id: Option<&str>) -> Result<Url> {
        let mut url = self.url(path)?;
        if let Some(device_id) = device_id {
            url.query_pairs_mut().append_pair("device_id", device_id);
        }
        Ok(url)
    }

    /// Authorizes `request` with a fresh bearer token and sends it.
    ///
    /// Any failure to get the token is a `TokenExchange` error, unless it is
    /// a configuration error.
    async fn send(&self, mut request: reqwest::Request) -> Result<Response> {
        let token = self.tokens.bearer_token().await.map_err(token_error)?;
        HttpClient::bearer(&mut request, &token)?;
        self.http_client.execute(request).await
    }

    /// Reads the body of a successful response, or converts the status into
    /// an error.
    async fn success_body(response: Response) -> Result<String> {
        let status = response.status();
        let url = response.url().path().to_owned();
        let body = response.text().await?;
        if status.is_success() {
            return Ok(body);
        }

        Err(status_error(status, &body, &url))
    }
}

/// Folds every token failure into `TokenExchange`, so that callers can stop
/// early whatever went wrong at the issuer.
fn token_error(e: Error) -> Error {
    if e.is_fatal() || e.kind == ErrorKind::TokenExchange {
        e
    } else {
        Error::token_exchange(format!("unable to get a token: {e}"))
    }
}

/// Classifies a non-success answer of the remote API.
fn status_error(status: StatusCode, body: &str, path: &str) -> Error {
    let detail = serde_json::from_str::<ApiError>(body)
        .map(|error| error.error)
        .unwrap_or_default();

    let message = format!(
        "{path}: {status}{}",
        detail
            .message
            .as_deref()
            .map(|message| format!(" ({message})"))
            .unwrap_or_default()
    );

    if detail.is_no_active_device() || status == StatusCode::NOT_FOUND {
        return Error::device_unavailable(message);
    }

    match status {
        StatusCode::BAD_REQUEST => Error::invalid_argument(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::failed_precondition(message),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
            Error::unavailable(message)
        }
        StatusCode::GATEWAY_TIMEOUT => Error::deadline_exceeded(message),
        status if status.is_server_error() => Error::unavailable(message),
        _ => Error::unknown(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_failures_become_token_exchange() {
        let err = token_error(Error::unavailable("connection refused"));
        assert_eq!(err.kind, ErrorKind::TokenExchange);
        assert!(err.to_string().contains("connection refused"));

        let err = token_error(Error::configuration("missing refresh token"));
        assert_eq!(err.kind, ErrorKind::Configuration);
    }

    #[test]
    fn no_active_device_is_a_device_error() {
        let body = r#"{"error":{"status":404,"message":"No active device found","reason":"NO_ACTIVE_DEVICE"}}"#;
        let err = status_error(StatusCode::NOT_FOUND, body, "/v1/me/player/play");
        assert_eq!(err.kind, ErrorKind::DeviceUnavailable);
        assert_eq!(
            err.to_string(),
            "device unavailable: /v1/me/player/play: 404 Not Found (No active device found)"
        );
    }

    #[test]
    fn reason_wins_over_status() {
        let body = r#"{"error":{"status":403,"message":"Restricted","reason":"NO_ACTIVE_DEVICE"}}"#;
        let err = status_error(StatusCode::FORBIDDEN, body, "/v1/me/player/play");
        assert_eq!(err.kind, ErrorKind::DeviceUnavailable);
    }

    #[test]
    fn unparsable_bodies_still_classify() {
        let err = status_error(StatusCode::BAD_GATEWAY, "<html>", "/v1/me/player");
        assert_eq!(err.kind, ErrorKind::Unavailable);
        let err = status_error(StatusCode::UNAUTHORIZED, "", "/v1/me/player");
        assert_eq!(err.kind, ErrorKind::FailedPrecondition);
    }
}
