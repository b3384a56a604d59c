//! Wire types of the token issuer and the remote music-service API.
//!
//! # Submodules
//!
//! * [`auth`] - token issuer answers
//! * [`player`] - player endpoints: currently and recently played tracks,
//!   playback state, devices and command bodies
//!
//! # Usage Example
//!
//! ```
//! use nowplaying::protocol;
//!
//! // Parse and log JSON response
//! let response: protocol::player::Devices = protocol::json(&body, "devices")?;
//!
//! // Response is logged at:
//! // - TRACE level if successful
//! // - ERROR level with details if parsing fails
//! ```

pub mod auth;
pub mod player;

use crate::error::Result;
use serde::Deserialize;
use std::fmt::Debug;

/// Parses and logs a JSON response.
///
/// # Arguments
///
/// * `body` - Response body text to parse
/// * `origin` - Description of the endpoint for logging
///
/// # Errors
///
/// Returns `InvalidArgument` if the body is not valid JSON or does not match
/// the shape of `T`.
///
/// # Logging
///
/// * Success: Logs parsed structure at TRACE level
/// * Parse Error: Logs raw JSON at TRACE level if valid JSON
/// * Invalid JSON: Logs error and raw text at ERROR level
pub fn json<T>(body: &str, origin: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Debug,
{
    match serde_json::from_str(body) {
        Ok(result) => {
            trace!("{origin}: {result:#?}");
            Ok(result)
        }
        Err(e) => {
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
                trace!("{origin}: {json:#?}");
            } else {
                error!("{origin}: failed parsing response ({e:?})");
                trace!("{body}");
            }
            Err(e.into())
        }
    }
}
