//! Track Snapshot: the normalized view of a track the listener is or was
//! playing.
//!
//! Remote payloads are validated here and nowhere else. A [`Track`] is
//! immutable once built and is replaced wholesale by the next successful
//! resolution.

use std::{fmt, time::Duration};

use url::Url;

use crate::{
    error::{Error, Result},
    protocol::player::TrackObject,
};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Track {
    title: String,
    artist: String,
    album: String,
    artwork_url: String,
    external_url: String,
    uri: String,
    preview_url: Option<Url>,
    duration: Option<Duration>,
    is_playing: bool,
}

impl Track {
    /// Separator between credited artists.
    const ARTIST_SEPARATOR: &'static str = ", ";

    /// Normalizes a remote track object.
    ///
    /// * artists are joined with `", "` in credited order
    /// * the artwork is the first image variant, or empty
    /// * a missing or unparsable preview URL means "no preview"
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the object has no title or no playback
    /// URI: such a track can be neither shown nor played.
    pub fn from_remote(object: TrackObject, is_playing: bool) -> Result<Self> {
        let title = object
            .name
            .filter(|name| !name.is_empty())
            .ok_or_else(|| Error::invalid_argument("track has no title"))?;

        let uri = object
            .uri
            .filter(|uri| !uri.is_empty())
            .ok_or_else(|| Error::invalid_argument(format!("{title} has no playback uri")))?;

        let artist = object
            .artists
            .into_iter()
            .filter_map(|artist| artist.name)
            .collect::<Vec<_>>()
            .join(Self::ARTIST_SEPARATOR);

        let (album, artwork_url) = match object.album {
            Some(album) => (
                album.name.unwrap_or_default(),
                album
                    .images
                    .into_iter()
                    .next()
                    .map(|image| image.url)
                    .unwrap_or_default(),
            ),
            None => (String::new(), String::new()),
        };

        let preview_url = object.preview_url.and_then(|url| match url.parse() {
            Ok(url) => Some(url),
            Err(e) => {
                warn!("{title}: ignoring preview url {url}: {e}");
                None
            }
        });

        Ok(Self {
            title,
            artist,
            album,
            artwork_url,
            external_url: object.external_urls.spotify.unwrap_or_default(),
            uri,
            preview_url,
            duration: object.duration_ms.map(Duration::from_millis),
            is_playing,
        })
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    /// All credited artists, comma-joined.
    #[must_use]
    pub fn artist(&self) -> &str {
        &self.artist
    }

    #[must_use]
    pub fn album(&self) -> &str {
        &self.album
    }

    /// Empty if the album has no artwork.
    #[must_use]
    pub fn artwork_url(&self) -> &str {
        &self.artwork_url
    }

    #[must_use]
    pub fn external_url(&self) -> &str {
        &self.external_url
    }

    /// URI that the remote API plays.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Short preview clip. `None` means no fallback is available.
    #[must_use]
    pub fn preview_url(&self) -> Option<&Url> {
        self.preview_url.as_ref()
    }

    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    /// Whether the remote service reported this track as playing when it
    /// was resolved.
    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.is_playing
    }
}

/// Formats as "artist - title".
impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.artist.is_empty() {
            write!(f, "{}", self.title)
        } else {
            write!(f, "{} - {}", self.artist, self.title)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::ErrorKind, protocol::player::CurrentlyPlaying};

    fn object(json: &str) -> TrackObject {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn joins_artists_with_comma() {
        let payload: CurrentlyPlaying = serde_json::from_str(
            r#"{
                "is_playing": true,
                "item": {
                    "name": "Song",
                    "artists": [{ "name": "A" }, { "name": "B" }],
                    "album": {
                        "name": "Album",
                        "images": [{ "url": "https://i.scdn.co/large" }, { "url": "https://i.scdn.co/small" }]
                    },
                    "external_urls": { "spotify": "https://open.spotify.com/track/1" },
                    "uri": "spotify:track:1",
                    "preview_url": "https://p.scdn.co/mp3-preview/1",
                    "duration_ms": 200000
                }
            }"#,
        )
        .unwrap();

        let track = Track::from_remote(payload.item.unwrap(), true).unwrap();
        assert_eq!(track.artist(), "A, B");
        assert_eq!(track.artwork_url(), "https://i.scdn.co/large");
        assert_eq!(track.external_url(), "https://open.spotify.com/track/1");
        assert_eq!(track.uri(), "spotify:track:1");
        assert_eq!(
            track.preview_url().map(Url::as_str),
            Some("https://p.scdn.co/mp3-preview/1")
        );
        assert_eq!(track.duration(), Some(Duration::from_secs(200)));
        assert_eq!(track.to_string(), "A, B - Song");
    }

    #[test]
    fn missing_optional_fields_normalize_to_empty() {
        let track = Track::from_remote(
            object(r#"{ "name": "Song", "uri": "spotify:track:1", "preview_url": null, "album": { "name": "X", "images": [] } }"#),
            false,
        )
        .unwrap();
        assert_eq!(track.artist(), "");
        assert_eq!(track.artwork_url(), "");
        assert!(track.preview_url().is_none());
        assert!(!track.is_playing());
        assert_eq!(track.to_string(), "Song");
    }

    #[test]
    fn rejects_tracks_that_cannot_be_played() {
        let err = Track::from_remote(object(r#"{ "name": "Song" }"#), true).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
        let err = Track::from_remote(object(r#"{ "uri": "spotify:track:1" }"#), true).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }
}
