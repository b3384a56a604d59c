//! Track Resolver.
//!
//! Answers "what is this listener playing, or what did they play last?" by
//! asking the remote API in priority order:
//!
//! 1. currently playing; if that yields a track, it is returned as reported
//! 2. most recently played, limit 1; returned with `is_playing == false`
//! 3. otherwise `None`
//!
//! Every failure along the way is logged and treated as "no answer" for that
//! step, so the resolver returns `Ok(None)` rather than an error. Failing to
//! get a token at all ends the resolution right away. The one exception is a
//! configuration error: it cannot go away by itself and is returned to the
//! caller.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    api::WebApi,
    error::{ErrorKind, Result},
    track::Track,
};

/// Source of Track Snapshots.
#[async_trait]
pub trait TrackSource: Send + Sync {
    /// Resolves the current Track Snapshot, or `None` when there is nothing
    /// to show.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if credentials are missing.
    async fn resolve(&self) -> Result<Option<Track>>;
}

pub struct TrackResolver {
    api: Arc<WebApi>,
}

impl TrackResolver {
    #[must_use]
    pub fn new(api: Arc<WebApi>) -> Self {
        Self { api }
    }

    async fn currently_playing(&self) -> Result<Option<Track>> {
        let Some(payload) = self.api.currently_playing().await? else {
            debug!("nothing is playing");
            return Ok(None);
        };

        let Some(item) = payload.item else {
            debug!("currently playing item is not a track");
            return Ok(None);
        };

        // A payload without `is_playing` still describes the live track.
        let is_playing = payload.is_playing.unwrap_or(true);
        Track::from_remote(item, is_playing).map(Some)
    }

    async fn recently_played(&self) -> Result<Option<Track>> {
        let history = self.api.recently_played(1).await?;
        match history.items.into_iter().next() {
            Some(entry) => Track::from_remote(entry.track, false).map(Some),
            None => {
                debug!("nothing was played recently");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl TrackSource for TrackResolver {
    async fn resolve(&self) -> Result<Option<Track>> {
        match self.currently_playing().await {
            Ok(Some(track)) => return Ok(Some(track)),
            Ok(None) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) if e.kind == ErrorKind::TokenExchange => {
                warn!("{e}");
                return Ok(None);
            }
            Err(e) => warn!("unable to get currently playing track: {e}"),
        }

        match self.recently_played().await {
            Ok(track) => Ok(track),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("unable to get recently played track: {e}");
                Ok(None)
            }
        }
    }
}
