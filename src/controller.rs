//! Playback Controller.
//!
//! Toggles playback of the displayed track on one of two paths:
//!
//! 1. **Device**: a live, settled device session. Pausing and resuming go to
//!    the device; starting a track runs the Start Protocol against the
//!    remote API.
//! 2. **Preview**: a local media element playing the track's preview clip,
//!    used when no device is available or the Start Protocol gave up.
//!
//! When neither path is available the toggle is disabled.
//!
//! # Start Protocol
//!
//! The remote registry learns about a device asynchronously, so a single
//! `play` right after registration routinely fails. The protocol is:
//!
//! 1. transfer playback to the device, without playing
//! 2. wait [`StartDelays::first`]
//! 3. `play` the track
//! 4. if that failed: transfer again, wait [`StartDelays::retry`] and `play`
//!    once more before giving up
//!
//! # Audio sources
//!
//! At most one path produces audio at any time. The controller remembers
//! which path it started last; pausing always goes to that path, and a path
//! is only started while nothing is playing.

use std::{fmt, sync::Arc};

use tokio::sync::mpsc;

use crate::{
    api::WebApi,
    config::{Config, StartDelays},
    device::{ReadyDevice, TransportState},
    error::{Error, ErrorKind, Result},
    events::Event,
    preview::{MediaElement, MediaFactory},
    track::Track,
};

/// What a toggle did.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// Paused the path that was playing.
    Paused,
    /// Resumed the same track on the device.
    Resumed,
    /// Started the track on the device.
    Started,
    PreviewPlaying,
    PreviewPaused,
    /// Neither path is available. Nothing happened.
    Disabled,
    /// Every available path failed. Starting leaves the state as it was;
    /// a failed pause hands control back anyway.
    Failed,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Paused => write!(f, "paused"),
            Self::Resumed => write!(f, "resumed"),
            Self::Started => write!(f, "started"),
            Self::PreviewPlaying => write!(f, "playing preview"),
            Self::PreviewPaused => write!(f, "paused preview"),
            Self::Disabled => write!(f, "disabled"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Whether a toggle can do anything for `track`.
///
/// `preview_available` tells whether a preview element can be played at
/// all. The toggle affordance should be disabled when this is `false`.
#[must_use]
pub fn can_toggle(track: Option<&Track>, device_ready: bool, preview_available: bool) -> bool {
    track.is_some_and(|track| {
        device_ready || (preview_available && track.preview_url().is_some())
    })
}

/// Path that controls audio.
enum Path {
    Idle,
    Device {
        device: ReadyDevice,
        transport: Option<TransportState>,
    },
    Preview,
}

pub struct PlaybackController {
    api: Arc<WebApi>,
    delays: StartDelays,

    factory: Option<MediaFactory>,
    preview: Option<Box<dyn MediaElement>>,

    path: Path,
    playing: bool,

    event_tx: Option<mpsc::UnboundedSender<Event>>,
}

impl PlaybackController {
    /// Creates a controller that starts device playback through `api` and
    /// creates its preview element with `factory` on first use.
    ///
    /// Without a factory only the device path is available.
    #[must_use]
    pub fn new(config: &Config, api: Arc<WebApi>, factory: Option<MediaFactory>) -> Self {
        Self {
            api,
            delays: config.start_delays,
            factory,
            preview: None,
            path: Path::Idle,
            playing: false,
            event_tx: None,
        }
    }

    /// Sends [`Event::Play`] and [`Event::Pause`] to `tx`.
    pub fn register(&mut self, tx: mpsc::UnboundedSender<Event>) {
        self.event_tx = Some(tx);
    }

    /// Whether local audio is playing on either path.
    #[must_use]
    pub fn is_playing(&mut self) -> bool {
        self.check_preview_ended();
        self.playing
    }

    /// Whether a preview element exists or can still be created.
    #[must_use]
    pub fn has_preview(&self) -> bool {
        self.preview.is_some() || self.factory.is_some()
    }

    /// Whether [`toggle`](Self::toggle) can do anything for `track`.
    #[must_use]
    pub fn can_toggle(&self, track: Option<&Track>, device_ready: bool) -> bool {
        can_toggle(track, device_ready, self.has_preview())
    }

    /// Toggles playback of `track`, preferring `device` if one is ready.
    ///
    /// Never fails: errors are logged and turned into [`Outcome::Failed`],
    /// leaving the state as it was.
    pub async fn toggle(&mut self, track: Option<&Track>, device: Option<ReadyDevice>) -> Outcome {
        self.check_preview_ended();

        if self.playing {
            return self.pause().await;
        }

        let Some(track) = track else {
            return Outcome::Disabled;
        };

        let mut attempted = false;
        if let Some(device) = device {
            attempted = true;
            match self.play_on_device(track, device).await {
                Ok(outcome) => return outcome,
                Err(e) => warn!("{e}"),
            }
        }

        match track.preview_url() {
            Some(_) if self.has_preview() => match self.play_preview(track).await {
                Ok(()) => Outcome::PreviewPlaying,
                Err(e) => {
                    warn!("unable to play preview of {track}: {e}");
                    Outcome::Failed
                }
            },
            _ if attempted => Outcome::Failed,
            _ => Outcome::Disabled,
        }
    }

    /// Transport state of the path that controls audio.
    ///
    /// While the device plays, this is what the device last pushed. While
    /// the preview plays, it is the element's own clock.
    #[must_use]
    pub fn transport(&mut self) -> Option<TransportState> {
        self.check_preview_ended();
        match &self.path {
            Path::Idle => None,
            Path::Device { transport, .. } => transport.clone(),
            Path::Preview => self.preview.as_ref().map(|element| element.transport()),
        }
    }

    /// Applies transport state pushed by the device session.
    ///
    /// Ignored unless the device path controls audio. `None` means the
    /// device stopped playing for us, which hands control back.
    pub fn apply_device_transport(&mut self, update: Option<TransportState>) {
        let Path::Device { transport, .. } = &mut self.path else {
            return;
        };

        match update {
            Some(state) => {
                let playing = !state.paused;
                *transport = Some(state);
                self.set_playing(playing);
            }
            None => {
                debug!("device no longer plays for us");
                self.path = Path::Idle;
                self.set_playing(false);
            }
        }
    }

    /// Stops the preview and releases it. Device sessions are torn down by
    /// their manager.
    pub fn teardown(&mut self) {
        if let Some(mut element) = self.preview.take() {
            element.pause();
            element.release();
        }
        self.path = Path::Idle;
        self.playing = false;
    }

    async fn pause(&mut self) -> Outcome {
        let outcome = match &self.path {
            Path::Device { device, .. } => match device.device.pause().await {
                Ok(()) => Outcome::Paused,
                Err(e) => {
                    warn!("unable to pause {}: {e}", device.id);
                    self.path = Path::Idle;
                    Outcome::Failed
                }
            },
            Path::Preview => {
                if let Some(element) = self.preview.as_mut() {
                    element.pause();
                }
                Outcome::PreviewPaused
            }
            Path::Idle => Outcome::Paused,
        };

        self.set_playing(false);
        outcome
    }

    async fn play_on_device(&mut self, track: &Track, device: ReadyDevice) -> Result<Outcome> {
        match device.device.current_state().await {
            Ok(Some(state)) if state.paused && state.uri.as_deref() == Some(track.uri()) => {
                match device.device.resume().await {
                    Ok(()) => {
                        debug!("resumed {track} on {}", device.id);
                        self.take_device_path(device, Some(state));
                        return Ok(Outcome::Resumed);
                    }
                    Err(e) => debug!("unable to resume, starting over: {e}"),
                }
            }
            Ok(_) => {}
            Err(e) => debug!("unable to get device state, starting over: {e}"),
        }

        self.start(&device.id, track.uri()).await?;
        info!("playing {track} on {}", device.id);
        self.take_device_path(device, None);
        Ok(Outcome::Started)
    }

    /// Runs the Start Protocol.
    ///
    /// # Errors
    ///
    /// Returns `PlaybackProtocol` when both attempts failed, or the
    /// credential error that made them fail.
    async fn start(&self, device_id: &str, uri: &str) -> Result<()> {
        let mut last_error = None;

        for (attempt, delay) in [self.delays.first, self.delays.retry].into_iter().enumerate() {
            if let Err(e) = self.api.transfer_playback(device_id).await {
                if e.is_fatal() || e.kind == ErrorKind::TokenExchange {
                    return Err(e);
                }
                debug!("transfer to {device_id} failed: {e}");
            }

            tokio::time::sleep(delay).await;

            match self.api.play(uri).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_fatal() || e.kind == ErrorKind::TokenExchange => return Err(e),
                Err(e) => {
                    debug!("play attempt {} failed: {e}", attempt + 1);
                    last_error = Some(e);
                }
            }
        }

        Err(Error::playback_protocol(match last_error {
            Some(e) => format!("unable to start {uri} on {device_id}: {e}"),
            None => format!("unable to start {uri} on {device_id}"),
        }))
    }

    fn take_device_path(&mut self, device: ReadyDevice, transport: Option<TransportState>) {
        if matches!(self.path, Path::Preview) {
            if let Some(element) = self.preview.as_mut() {
                element.pause();
            }
        }

        self.path = Path::Device { device, transport };
        self.set_playing(true);
    }

    async fn play_preview(&mut self, track: &Track) -> Result<()> {
        let url = track
            .preview_url()
            .ok_or_else(|| Error::failed_precondition("track has no preview"))?;

        if self.preview.is_none() {
            let factory = self
                .factory
                .as_ref()
                .ok_or_else(|| Error::device_unavailable("no preview player"))?;

            debug!("creating preview element");
            match factory() {
                Ok(element) => self.preview = Some(element),
                Err(e) => {
                    warn!("disabling previews: {e}");
                    self.factory = None;
                    return Err(e);
                }
            }
        }
        let element = self
            .preview
            .as_mut()
            .ok_or_else(|| Error::internal("preview element missing"))?;

        if element.source() != Some(url) {
            element.set_source(url).await?;
        }
        element.play().await?;

        debug!("playing preview of {track}");
        self.path = Path::Preview;
        self.set_playing(true);
        Ok(())
    }

    /// Flips the playing flag once the preview clip has ended.
    fn check_preview_ended(&mut self) {
        if self.playing
            && matches!(self.path, Path::Preview)
            && self.preview.as_ref().is_some_and(|element| element.ended())
        {
            debug!("preview ended");
            self.set_playing(false);
        }
    }

    fn set_playing(&mut self, playing: bool) {
        if self.playing != playing {
            self.playing = playing;
            self.emit(if playing { Event::Play } else { Event::Pause });
        }
    }

    fn emit(&self, event: Event) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Mutex, PoisonError};

    use super::*;
    use crate::{
        config::Credentials,
        http::Client as HttpClient,
        preview::tests::{FakeElement, Journal},
        protocol::player::TrackObject,
        tokens::{BearerToken, TokenProvider},
    };

    struct NoToken;

    #[async_trait::async_trait]
    impl TokenProvider for NoToken {
        async fn bearer_token(&self) -> Result<BearerToken> {
            Err(Error::configuration("missing client id"))
        }
    }

    fn track(uri: &str, preview: Option<&str>) -> Track {
        Track::from_remote(
            TrackObject {
                name: Some("Song".to_owned()),
                uri: Some(uri.to_owned()),
                preview_url: preview.map(ToOwned::to_owned),
                ..TrackObject::default()
            },
            false,
        )
        .unwrap()
    }

    fn controller(journal: &Arc<Mutex<Journal>>, ended: &Arc<Mutex<bool>>) -> PlaybackController {
        let config = Config::with_credentials(Credentials::default());
        let api = Arc::new(WebApi::new(&config, Arc::new(NoToken), HttpClient::new(&config).unwrap()));
        PlaybackController::new(&config, api, Some(FakeElement::factory(journal, ended)))
    }

    fn journal<T>(journal: &Arc<Mutex<Journal>>, f: impl FnOnce(&Journal) -> T) -> T {
        f(&journal.lock().unwrap_or_else(PoisonError::into_inner))
    }

    #[tokio::test]
    async fn disabled_without_track_or_path() {
        let journal_ = Arc::new(Mutex::new(Journal::default()));
        let ended = Arc::new(Mutex::new(false));
        let mut controller = controller(&journal_, &ended);

        assert_eq!(controller.toggle(None, None).await, Outcome::Disabled);
        let track = track("spotify:track:1", None);
        assert_eq!(controller.toggle(Some(&track), None).await, Outcome::Disabled);
        assert!(!can_toggle(Some(&track), false, true));
        assert!(can_toggle(Some(&track), true, false));
        assert!(!can_toggle(None, true, true));
        assert_eq!(journal(&journal_, |j| j.created), 0);
    }

    #[tokio::test]
    async fn preview_toggles_and_is_created_once() {
        let journal_ = Arc::new(Mutex::new(Journal::default()));
        let ended = Arc::new(Mutex::new(false));
        let mut controller = controller(&journal_, &ended);
        let (tx, mut rx) = mpsc::unbounded_channel();
        controller.register(tx);

        let first = track("spotify:track:1", Some("https://p.scdn.co/mp3-preview/1"));
        assert_eq!(controller.toggle(Some(&first), None).await, Outcome::PreviewPlaying);
        assert!(controller.is_playing());
        assert_eq!(controller.toggle(Some(&first), None).await, Outcome::PreviewPaused);
        assert!(!controller.is_playing());

        let second = track("spotify:track:2", Some("https://p.scdn.co/mp3-preview/2"));
        assert_eq!(controller.toggle(Some(&second), None).await, Outcome::PreviewPlaying);

        journal(&journal_, |j| {
            assert_eq!(j.created, 1);
            assert_eq!(j.sources.len(), 2);
            assert_eq!(j.plays, 2);
        });
        assert_eq!(rx.try_recv().unwrap(), Event::Play);
        assert_eq!(rx.try_recv().unwrap(), Event::Pause);
        assert_eq!(rx.try_recv().unwrap(), Event::Play);
    }

    #[tokio::test]
    async fn ended_preview_stops_playing() {
        let journal_ = Arc::new(Mutex::new(Journal::default()));
        let ended = Arc::new(Mutex::new(false));
        let mut controller = controller(&journal_, &ended);

        let track = track("spotify:track:1", Some("https://p.scdn.co/mp3-preview/1"));
        controller.toggle(Some(&track), None).await;
        *ended.lock().unwrap() = true;

        assert!(!controller.is_playing());
        assert!(controller.transport().unwrap().paused);
        // Plays again from the start rather than pausing.
        assert_eq!(controller.toggle(Some(&track), None).await, Outcome::PreviewPlaying);
        assert_eq!(journal(&journal_, |j| j.sources.len()), 1);
    }

    #[tokio::test]
    async fn teardown_releases_preview() {
        let journal_ = Arc::new(Mutex::new(Journal::default()));
        let ended = Arc::new(Mutex::new(false));
        let mut controller = controller(&journal_, &ended);

        let track = track("spotify:track:1", Some("https://p.scdn.co/mp3-preview/1"));
        controller.toggle(Some(&track), None).await;
        controller.teardown();

        assert!(!controller.is_playing());
        assert!(controller.transport().is_none());
        assert!(journal(&journal_, |j| j.released));
    }

    #[tokio::test]
    async fn disabled_without_preview_player() {
        let config = Config::with_credentials(Credentials::default());
        let api = Arc::new(WebApi::new(&config, Arc::new(NoToken), HttpClient::new(&config).unwrap()));
        let mut controller = PlaybackController::new(&config, api, None);

        let track = track("spotify:track:1", Some("https://p.scdn.co/mp3-preview/1"));
        assert!(!controller.has_preview());
        assert!(!controller.can_toggle(Some(&track), false));
        assert!(controller.can_toggle(Some(&track), true));
        assert_eq!(controller.toggle(Some(&track), None).await, Outcome::Disabled);
    }

    #[tokio::test]
    async fn broken_preview_player_disables_previews() {
        let config = Config::with_credentials(Credentials::default());
        let api = Arc::new(WebApi::new(&config, Arc::new(NoToken), HttpClient::new(&config).unwrap()));
        let factory: MediaFactory = Box::new(|| Err(Error::device_unavailable("no output device")));
        let mut controller = PlaybackController::new(&config, api, Some(factory));

        let track = track("spotify:track:1", Some("https://p.scdn.co/mp3-preview/1"));
        assert!(controller.can_toggle(Some(&track), false));
        assert_eq!(controller.toggle(Some(&track), None).await, Outcome::Failed);
        assert!(!controller.can_toggle(Some(&track), false));
        assert_eq!(controller.toggle(Some(&track), None).await, Outcome::Disabled);
    }
}
