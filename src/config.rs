//! Process-wide configuration.
//!
//! [`Config`] is built once at startup and shared read-only afterwards. It
//! carries the [`Credentials`] used by the Credential Broker, the remote
//! endpoints and the timing knobs of the playback engine.
//!
//! # Credentials
//!
//! Credentials are read from a TOML secrets file and may be overridden by
//! environment variables:
//!
//! ```toml
//! client_id = "..."
//! client_secret = "..."
//! refresh_token = "..."
//! ```
//!
//! Absent values are kept as absent. Loading never fails because a value is
//! missing: the Credential Broker reports that as a configuration error on
//! every exchange, without touching the network.

use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use url::Url;
use veil::Redact;

use crate::error::{Error, Result};

/// Environment variable holding the client id.
pub const ENV_CLIENT_ID: &str = "SPOTIFY_CLIENT_ID";
/// Environment variable holding the client secret.
pub const ENV_CLIENT_SECRET: &str = "SPOTIFY_CLIENT_SECRET";
/// Environment variable holding the refresh token.
pub const ENV_REFRESH_TOKEN: &str = "SPOTIFY_REFRESH_TOKEN";

/// The long-lived Credential Pair.
///
/// Immutable for the lifetime of the process and never persisted. The
/// `Debug` output is redacted.
#[derive(Clone, Default, Deserialize, Redact, PartialEq, Eq, Hash)]
pub struct Credentials {
    #[redact]
    #[serde(default)]
    pub client_id: Option<String>,

    #[redact]
    #[serde(default)]
    pub client_secret: Option<String>,

    #[redact]
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl Credentials {
    /// Maximum size of a secrets file.
    ///
    /// A secrets file is three short lines. Anything larger is not one.
    const MAX_FILE_SIZE: u64 = 4 * 1024;

    /// Creates credentials from raw values, normalizing each of them.
    #[must_use]
    pub fn new(
        client_id: Option<&str>,
        client_secret: Option<&str>,
        refresh_token: Option<&str>,
    ) -> Self {
        Self {
            client_id: client_id.and_then(normalize),
            client_secret: client_secret.and_then(normalize),
            refresh_token: refresh_token.and_then(normalize),
        }
    }

    /// Reads credentials from a TOML secrets file.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the file cannot be read, is too large or is
    /// not valid TOML.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        // Prevent out-of-memory condition: secrets file should be small.
        let file_size = fs::metadata(path)?.len();
        if file_size > Self::MAX_FILE_SIZE {
            return Err(Error::configuration(format!(
                "{} is too large ({file_size} bytes)",
                path.display()
            )));
        }

        let contents = fs::read_to_string(path)?;
        contents.parse()
    }

    /// Reads credentials from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        let var = |key| std::env::var(key).ok();
        Self::new(
            var(ENV_CLIENT_ID).as_deref(),
            var(ENV_CLIENT_SECRET).as_deref(),
            var(ENV_REFRESH_TOKEN).as_deref(),
        )
    }

    /// Fills in any value that is absent here from `other`.
    #[must_use]
    pub fn or(self, other: Self) -> Self {
        Self {
            client_id: self.client_id.or(other.client_id),
            client_secret: self.client_secret.or(other.client_secret),
            refresh_token: self.refresh_token.or(other.refresh_token),
        }
    }

    /// Names of the values that are absent.
    #[must_use]
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.client_id.is_none() {
            missing.push("client id");
        }
        if self.client_secret.is_none() {
            missing.push("client secret");
        }
        if self.refresh_token.is_none() {
            missing.push("refresh token");
        }
        missing
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.missing().is_empty()
    }
}

impl std::str::FromStr for Credentials {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let raw: Self = toml::from_str(s)?;
        Ok(Self::new(
            raw.client_id.as_deref(),
            raw.client_secret.as_deref(),
            raw.refresh_token.as_deref(),
        ))
    }
}

/// Trims a credential value and strips one pair of surrounding quotes.
///
/// Values pasted into `.env` files often end up quoted. Empty values count
/// as absent.
fn normalize(value: &str) -> Option<String> {
    let mut value = value.trim();
    for quote in ['"', '\''] {
        value = value.strip_prefix(quote).unwrap_or(value);
        value = value.strip_suffix(quote).unwrap_or(value);
    }

    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_owned())
    }
}

/// Delays used by the Start Protocol.
///
/// These are tuned to the remote registry's observed latency, not invariants
/// of the protocol.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct StartDelays {
    /// Wait between transfer and the first `play`.
    pub first: Duration,
    /// Wait between the second transfer and the final `play`.
    pub retry: Duration,
}

impl Default for StartDelays {
    fn default() -> Self {
        Self {
            first: Duration::from_millis(1_200),
            retry: Duration::from_millis(2_000),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub app_name: String,
    pub app_version: String,

    /// Name of the Connect device this engine plays on.
    pub device_name: String,

    pub credentials: Credentials,

    /// Token issuer endpoint.
    pub token_url: Url,

    /// Base of the remote music API. Must end in a slash.
    pub api_url: Url,

    pub user_agent: String,

    /// How often the Presentation Poller re-resolves while visible.
    pub poll_interval: Duration,

    /// How long a device must stay live before it is used for playback.
    pub settle_window: Duration,

    pub start_delays: StartDelays,

    /// How often the Connect device watcher polls the device list.
    pub device_poll_interval: Duration,
}

impl Config {
    pub const TOKEN_URL: &'static str = "https://accounts.spotify.com/api/token";
    pub const API_URL: &'static str = "https://api.spotify.com/v1/";

    const POLL_INTERVAL: Duration = Duration::from_secs(30);
    const SETTLE_WINDOW: Duration = Duration::from_millis(1_500);
    const DEVICE_POLL_INTERVAL: Duration = Duration::from_secs(5);

    /// Creates a configuration with default endpoints and timings.
    ///
    /// # Panics
    ///
    /// Panics if the package name or version contain characters that are not
    /// allowed in a `User-Agent` product token.
    #[must_use]
    pub fn with_credentials(credentials: Credentials) -> Self {
        let app_name = env!("CARGO_PKG_NAME").to_owned();
        let app_version = env!("CARGO_PKG_VERSION").to_owned();

        // Additional `User-Agent` string checks on top of `reqwest::HeaderValue`.
        let illegal_chars = |chr| chr == '/' || chr == ';';
        if app_name.is_empty()
            || app_name.contains(illegal_chars)
            || app_version.is_empty()
            || app_version.contains(illegal_chars)
        {
            panic!("application name and/or version invalid (\"{app_name}\"; \"{app_version}\")");
        }

        let os_name = match std::env::consts::OS {
            "macos" => "osx",
            other => other,
        };
        let user_agent = format!("{app_name}/{app_version} (Rust; {os_name})");
        trace!("user agent: {user_agent}");

        Self {
            device_name: app_name.clone(),
            app_name,
            app_version,
            credentials,
            token_url: Url::parse(Self::TOKEN_URL).expect("invalid token url"),
            api_url: Url::parse(Self::API_URL).expect("invalid api url"),
            user_agent,
            poll_interval: Self::POLL_INTERVAL,
            settle_window: Self::SETTLE_WINDOW,
            start_delays: StartDelays::default(),
            device_poll_interval: Self::DEVICE_POLL_INTERVAL,
        }
    }

    /// Points both remote endpoints at `base`, as a mock server would serve
    /// them: `{base}/api/token` and `{base}/v1/`.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if `base` is not a valid base URL.
    pub fn with_base_url(mut self, base: &str) -> Result<Self> {
        let base = Url::parse(&format!("{}/", base.trim_end_matches('/')))?;
        self.token_url = base.join("api/token")?;
        self.api_url = base.join("v1/")?;
        Ok(self)
    }
}
