//! Remote player API payloads.
//!
//! These mirror the JSON of the remote service loosely: every field that the
//! service may omit is optional here, and unknown fields are ignored. Nothing
//! in this module is trusted beyond the parsing step. The Track Snapshot is
//! built from these types in [`crate::track`], which validates them.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};

/// `GET /me/player/currently-playing`
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct CurrentlyPlaying {
    #[serde(default)]
    pub is_playing: Option<bool>,

    /// Absent for ads, local files without metadata and private sessions.
    #[serde(default)]
    pub item: Option<TrackObject>,
}

/// `GET /me/player/recently-played`
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct RecentlyPlayed {
    #[serde(default)]
    pub items: Vec<PlayHistory>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct PlayHistory {
    pub track: TrackObject,
    #[serde(default)]
    pub played_at: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct TrackObject {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub artists: Vec<ArtistObject>,

    #[serde(default)]
    pub album: Option<AlbumObject>,

    #[serde(default)]
    pub external_urls: ExternalUrls,

    #[serde(default)]
    pub uri: Option<String>,

    /// `null` when the service offers no preview clip.
    #[serde(default)]
    pub preview_url: Option<String>,

    #[serde(default)]
    pub duration_ms: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct ArtistObject {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct AlbumObject {
    #[serde(default)]
    pub name: Option<String>,

    /// Largest variant first.
    #[serde(default)]
    pub images: Vec<ImageObject>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct ImageObject {
    pub url: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct ExternalUrls {
    #[serde(default)]
    pub spotify: Option<String>,
}

/// `GET /me/player`
#[serde_as]
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct PlaybackState {
    #[serde(default)]
    pub device: Option<DeviceObject>,

    #[serde(default)]
    pub is_playing: bool,

    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub progress_ms: Option<Duration>,

    #[serde(default)]
    pub item: Option<TrackObject>,
}

/// `GET /me/player/devices`
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct Devices {
    #[serde(default)]
    pub devices: Vec<DeviceObject>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct DeviceObject {
    /// May be `null` for restricted devices, which cannot be targeted.
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub is_active: bool,

    #[serde(default)]
    pub is_restricted: bool,

    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

/// Body of `PUT /me/player`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TransferPlayback<'a> {
    pub device_ids: [&'a str; 1],
    pub play: bool,
}

impl<'a> TransferPlayback<'a> {
    /// Transfers ownership to `device_id` without starting playback.
    #[must_use]
    pub fn to(device_id: &'a str) -> Self {
        Self {
            device_ids: [device_id],
            play: false,
        }
    }
}

/// Body of `PUT /me/player/play`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StartPlayback<'a> {
    pub uris: [&'a str; 1],
}

impl<'a> StartPlayback<'a> {
    #[must_use]
    pub fn uri(uri: &'a str) -> Self {
        Self { uris: [uri] }
    }
}

/// Error body returned by the player endpoints.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct ApiError {
    pub error: ApiErrorDetail,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct ApiErrorDetail {
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl ApiErrorDetail {
    /// Reason code sent when no device is active for the account.
    pub const NO_ACTIVE_DEVICE: &'static str = "NO_ACTIVE_DEVICE";

    #[must_use]
    pub fn is_no_active_device(&self) -> bool {
        self.reason.as_deref() == Some(Self::NO_ACTIVE_DEVICE)
    }
}
