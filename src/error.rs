//! Error handling for nowplaying.
//!
//! Every fallible operation returns [`Result`], whose error carries an
//! [`ErrorKind`] plus the underlying error for diagnostics.
//!
//! # Error Categories
//!
//! The first four kinds are the engine's own failure modes:
//! * [`Configuration`](ErrorKind::Configuration) - credentials are missing;
//!   nothing that needs a bearer token can ever succeed
//! * [`TokenExchange`](ErrorKind::TokenExchange) - the token issuer rejected
//!   the refresh credential
//! * [`DeviceUnavailable`](ErrorKind::DeviceUnavailable) - the playback SDK
//!   is absent, failed to load or the device has not settled yet
//! * [`PlaybackProtocol`](ErrorKind::PlaybackProtocol) - transfer and play did
//!   not succeed within the bounded retry
//!
//! The remaining kinds classify transport failures, so that callers can tell
//! a dead network from a malformed response.
//!
//! An empty resolution ("nothing is or was playing") is not an error: the
//! Track Resolver returns `Ok(None)` for it.
//!
//! # Example
//!
//! ```rust
//! use nowplaying::error::{Error, ErrorKind, Result};
//!
//! fn client_id(value: Option<&str>) -> Result<&str> {
//!     value.ok_or_else(|| Error::configuration("client id is not set"))
//! }
//!
//! let err = client_id(None).unwrap_err();
//! assert_eq!(err.kind, ErrorKind::Configuration);
//! ```

use std::fmt;
use thiserror::Error;

/// Main error type combining error kind and details.
#[derive(Debug)]
pub struct Error {
    /// Classification of the error
    pub kind: ErrorKind,

    /// Details of the underlying error
    pub error: Box<dyn std::error::Error + Send + Sync>,
}

/// Standard result type for nowplaying operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories.
#[expect(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Eq, Error, Hash, Ord, PartialEq, PartialOrd)]
pub enum ErrorKind {
    /// One or more credentials are absent. Not retried.
    #[error("configuration error")]
    Configuration,

    /// The token issuer refused to exchange the refresh credential.
    #[error("unable to authenticate")]
    TokenExchange,

    /// No playback device can be used right now.
    #[error("device unavailable")]
    DeviceUnavailable,

    /// Transfer-then-play did not start playback.
    #[error("playback protocol failure")]
    PlaybackProtocol,

    /// HTTP Mapping: 503 Service Unavailable
    #[error("service unavailable")]
    Unavailable,

    /// HTTP Mapping: 504 Gateway Timeout
    #[error("operation timed out")]
    DeadlineExceeded,

    /// HTTP Mapping: 400 Bad Request
    #[error("invalid argument specified")]
    InvalidArgument,

    /// HTTP Mapping: 400 Bad Request
    #[error("invalid state")]
    FailedPrecondition,

    /// HTTP Mapping: 500 Internal Server Error
    #[error("internal error")]
    Internal,

    /// HTTP Mapping: 500 Internal Server Error
    #[error("unknown error")]
    Unknown,
}

impl Error {
    /// Creates a new error with specified kind and details.
    ///
    /// # Examples
    ///
    /// ```rust
    /// let err = Error::new(ErrorKind::Unavailable, "remote API unreachable");
    /// assert_eq!(err.kind, ErrorKind::Unavailable);
    /// ```
    pub fn new<E>(kind: ErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind,
            error: error.into(),
        }
    }

    /// Creates an error for absent or unusable credentials.
    ///
    /// The message must name the missing fields, never their values.
    pub fn configuration<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Configuration, error)
    }

    /// Creates an error for a refused token exchange.
    ///
    /// Carries the issuer's error body for diagnostics.
    pub fn token_exchange<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::TokenExchange, error)
    }

    /// Creates an error for a playback device that cannot be used.
    pub fn device_unavailable<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::DeviceUnavailable, error)
    }

    /// Creates an error for a Start Protocol that gave up.
    pub fn playback_protocol<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::PlaybackProtocol, error)
    }

    /// Creates an error for unreachable services.
    pub fn unavailable<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Unavailable, error)
    }

    /// Creates an error for operations that ran out of time.
    pub fn deadline_exceeded<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::DeadlineExceeded, error)
    }

    /// Creates an error for malformed input, including remote payloads.
    pub fn invalid_argument<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::InvalidArgument, error)
    }

    /// Creates an error for requests the remote side rejected in its
    /// current state.
    pub fn failed_precondition<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::FailedPrecondition, error)
    }

    /// Creates an error for broken invariants on our own side.
    pub fn internal<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Internal, error)
    }

    /// Creates an error that fits no other category.
    pub fn unknown<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Unknown, error)
    }

    /// Whether no amount of retrying can make this error go away.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.kind == ErrorKind::Configuration
    }

    /// Attempts to downcast the underlying error to a concrete type.
    #[must_use]
    pub fn downcast<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.error.downcast_ref::<E>()
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

/// Format: "{kind}: {details}"
impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}: ", self.kind)?;
        self.error.fmt(fmt)
    }
}

/// Converts IO errors into appropriate error kinds.
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            NotFound | PermissionDenied => Self::configuration(err),
            AddrNotAvailable | ConnectionRefused | NotConnected | BrokenPipe
            | ConnectionReset | ConnectionAborted => Self::unavailable(err),
            TimedOut => Self::deadline_exceeded(err),
            InvalidInput | InvalidData | UnexpectedEof => Self::invalid_argument(err),
            _ => Self::unknown(err),
        }
    }
}

/// Converts HTTP client errors into appropriate error kinds.
///
/// * Decode errors -> `InvalidArgument`
/// * Builder errors -> `Internal`
/// * Connect and redirect errors -> `Unavailable`
/// * Status errors -> `FailedPrecondition`
/// * Timeout errors -> `DeadlineExceeded`
impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() || err.is_body() {
            return Self::invalid_argument(err);
        }

        if err.is_builder() {
            return Self::internal(err);
        }

        if err.is_timeout() {
            return Self::deadline_exceeded(err);
        }

        if err.is_connect() || err.is_redirect() {
            return Self::unavailable(err);
        }

        if err.is_status() {
            return Self::failed_precondition(err);
        }

        Self::unknown(err)
    }
}

/// Converts JSON errors to `InvalidArgument`: remote payloads that do not
/// match the expected shape are rejected at the boundary.
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_argument(err)
    }
}

/// Converts TOML errors to `Configuration`.
impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::configuration(err.to_string())
    }
}

/// Converts invalid header errors to `Internal`.
impl From<http::header::InvalidHeaderValue> for Error {
    fn from(e: http::header::InvalidHeaderValue) -> Self {
        Self::internal(e.to_string())
    }
}

/// Converts header size errors to `Internal`.
impl From<http::header::MaxSizeReached> for Error {
    fn from(e: http::header::MaxSizeReached) -> Self {
        Self::internal(e.to_string())
    }
}

/// Converts URL parsing errors to `Internal`.
impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Self::internal(e.to_string())
    }
}

/// Converts timeout errors to `DeadlineExceeded`.
impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Self::deadline_exceeded(e.to_string())
    }
}

#[cfg(feature = "audio")]
impl From<rodio::StreamError> for Error {
    fn from(e: rodio::StreamError) -> Self {
        Self::device_unavailable(e.to_string())
    }
}

#[cfg(feature = "audio")]
impl From<rodio::PlayError> for Error {
    fn from(e: rodio::PlayError) -> Self {
        Self::device_unavailable(e.to_string())
    }
}

#[cfg(feature = "audio")]
impl From<rodio::decoder::DecoderError> for Error {
    fn from(e: rodio::decoder::DecoderError) -> Self {
        Self::invalid_argument(e.to_string())
    }
}
