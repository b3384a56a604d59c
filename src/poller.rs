//! Presentation Poller.
//!
//! Keeps the displayed "now playing" state fresh while someone is looking:
//!
//! * resolves once when started
//! * then every poll interval, but only while visible
//! * on becoming visible: resolves right away and restarts the interval
//! * on becoming hidden: stops the interval; missed ticks are not made up
//!
//! The result is published as [`NowPlaying`] through a `watch` channel.
//!
//! # Example
//!
//! ```ignore
//! let (visibility, hidden) = tokio::sync::watch::channel(true);
//! let poller = Poller::new(&config, resolver, hidden);
//! let mut now_playing = poller.subscribe();
//! tokio::spawn(poller.run(cancel));
//!
//! visibility.send(false)?; // stop polling
//! ```

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, watch, Notify},
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config, controller, error::Result, events::Event, resolver::TrackSource, track::Track,
};

/// What the presentation layer shows.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NowPlaying {
    /// `None` when there is nothing to show.
    pub track: Option<Track>,

    /// Only `true` until the first resolution completed.
    pub loading: bool,

    /// The last resolution failed. `track` still holds the previous one.
    pub error: bool,
}

impl Default for NowPlaying {
    fn default() -> Self {
        Self {
            track: None,
            loading: true,
            error: false,
        }
    }
}

impl NowPlaying {
    /// Whether the toggle affordance should be enabled.
    #[must_use]
    pub fn can_toggle(&self, device_ready: bool, preview_available: bool) -> bool {
        controller::can_toggle(self.track.as_ref(), device_ready, preview_available)
    }
}

pub struct Poller {
    source: Arc<dyn TrackSource>,
    interval: Duration,
    visibility: watch::Receiver<bool>,
    state: watch::Sender<NowPlaying>,
    refresh: Arc<Notify>,
    event_tx: Option<mpsc::UnboundedSender<Event>>,
}

impl Poller {
    /// Creates a poller that resolves through `source` while `visibility`
    /// holds `true`.
    #[must_use]
    pub fn new(
        config: &Config,
        source: Arc<dyn TrackSource>,
        visibility: watch::Receiver<bool>,
    ) -> Self {
        Self {
            source,
            interval: config.poll_interval,
            visibility,
            state: watch::channel(NowPlaying::default()).0,
            refresh: Arc::new(Notify::new()),
            event_tx: None,
        }
    }

    /// Sends [`Event::TrackChanged`] to `tx`.
    pub fn register(&mut self, tx: mpsc::UnboundedSender<Event>) {
        self.event_tx = Some(tx);
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<NowPlaying> {
        self.state.subscribe()
    }

    /// Handle to request a resolution right away, visible or not.
    #[must_use]
    pub fn refresh_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.refresh)
    }

    /// Polls until `cancel` is triggered.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if credentials are missing. The error is
    /// published once and polling stops, as no later attempt can succeed.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let mut interval = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut visible = *self.visibility.borrow_and_update();
        let mut watching = true;
        self.resolve().await?;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,

                changed = self.visibility.changed(), if watching => {
                    if changed.is_err() {
                        debug!("visibility source closed");
                        watching = false;
                        continue;
                    }

                    let now_visible = *self.visibility.borrow_and_update();
                    if now_visible == visible {
                        continue;
                    }

                    visible = now_visible;
                    if visible {
                        debug!("visible: resuming polling");
                        self.resolve().await?;
                        interval.reset();
                    } else {
                        debug!("hidden: pausing polling");
                    }
                }

                _ = interval.tick(), if visible => {
                    self.resolve().await?;
                }

                () = self.refresh.notified() => {
                    debug!("refresh requested");
                    self.resolve().await?;
                    if visible {
                        interval.reset();
                    }
                }
            }
        }

        trace!("poller stopped");
        Ok(())
    }

    /// Resolves once and publishes the result.
    async fn resolve(&self) -> Result<()> {
        let result = self.source.resolve().await;
        let mut changed = false;

        self.state.send_modify(|state| {
            state.loading = false;
            match &result {
                Ok(track) => {
                    changed = state.track.as_ref().map(Track::uri) != track.as_ref().map(Track::uri);
                    state.track.clone_from(track);
                    state.error = false;
                }
                Err(_) => state.error = true,
            }
        });

        match result {
            Ok(track) => {
                if changed {
                    match &track {
                        Some(track) if track.is_playing() => info!("now playing: {track}"),
                        Some(track) => info!("last played: {track}"),
                        None => info!("nothing to show"),
                    }
                    if let Some(tx) = &self.event_tx {
                        let _ = tx.send(Event::TrackChanged);
                    }
                }
                Ok(())
            }
            Err(e) if e.is_fatal() => {
                error!("{e}");
                Err(e)
            }
            Err(e) => {
                warn!("unable to resolve track: {e}");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::{
        config::Credentials,
        error::{Error, ErrorKind},
        protocol::player::TrackObject,
    };

    /// Answers from a script and counts calls.
    struct Script {
        answers: Mutex<Vec<Result<Option<Track>>>>,
        calls: watch::Sender<usize>,
    }

    impl Script {
        fn new(mut answers: Vec<Result<Option<Track>>>) -> Arc<Self> {
            answers.reverse();
            Arc::new(Self {
                answers: Mutex::new(answers),
                calls: watch::channel(0).0,
            })
        }

        fn calls(&self) -> usize {
            *self.calls.borrow()
        }
    }

    #[async_trait]
    impl TrackSource for Script {
        async fn resolve(&self) -> Result<Option<Track>> {
            self.calls.send_modify(|calls| *calls += 1);
            self.answers.lock().unwrap().pop().unwrap_or(Ok(None))
        }
    }

    fn track(uri: &str) -> Track {
        Track::from_remote(
            TrackObject {
                name: Some("Song".to_owned()),
                uri: Some(uri.to_owned()),
                ..TrackObject::default()
            },
            true,
        )
        .unwrap()
    }

    fn config() -> Config {
        Config::with_credentials(Credentials::default())
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn polls_only_while_visible() {
        let script = Script::new(vec![]);
        let (visibility, hidden) = watch::channel(true);
        let poller = Poller::new(&config(), Arc::clone(&script) as Arc<dyn TrackSource>, hidden);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(poller.run(cancel.clone()));

        let mut calls = script.calls.subscribe();
        calls.wait_for(|calls| *calls == 1).await.unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        calls.wait_for(|calls| *calls == 2).await.unwrap();

        visibility.send(false).unwrap();
        settle().await;
        tokio::time::advance(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(script.calls(), 2);

        visibility.send(true).unwrap();
        calls.wait_for(|calls| *calls == 3).await.unwrap();
        settle().await;
        assert_eq!(script.calls(), 3);

        // The interval restarted on becoming visible.
        tokio::time::advance(Duration::from_secs(29)).await;
        settle().await;
        assert_eq!(script.calls(), 3);
        tokio::time::advance(Duration::from_secs(1)).await;
        calls.wait_for(|calls| *calls == 4).await.unwrap();

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_previous_track_on_error() {
        let script = Script::new(vec![
            Ok(Some(track("spotify:track:1"))),
            Err(Error::unavailable("connection reset")),
            Ok(None),
        ]);
        let (_visibility, hidden) = watch::channel(true);
        let mut poller = Poller::new(&config(), Arc::clone(&script) as Arc<dyn TrackSource>, hidden);
        let (tx, mut events) = mpsc::unbounded_channel();
        poller.register(tx);
        let mut state = poller.subscribe();
        assert!(state.borrow().loading);

        let refresh = poller.refresh_handle();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(poller.run(cancel.clone()));

        let now = state.wait_for(|state| !state.loading).await.unwrap().clone();
        assert_eq!(now.track.as_ref().map(Track::uri), Some("spotify:track:1"));
        assert!(now.can_toggle(true, false));
        assert!(!now.can_toggle(false, true));
        assert_eq!(events.recv().await, Some(Event::TrackChanged));

        refresh.notify_one();
        let now = state.wait_for(|state| state.error).await.unwrap().clone();
        assert!(!now.loading);
        assert_eq!(now.track.as_ref().map(Track::uri), Some("spotify:track:1"));

        refresh.notify_one();
        let now = state.wait_for(|state| !state.error).await.unwrap().clone();
        assert!(now.track.is_none());
        assert_eq!(events.recv().await, Some(Event::TrackChanged));

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_configuration_error() {
        let script = Script::new(vec![Err(Error::configuration("missing refresh token"))]);
        let (_visibility, hidden) = watch::channel(true);
        let poller = Poller::new(&config(), Arc::clone(&script) as Arc<dyn TrackSource>, hidden);
        let state = poller.subscribe();

        let err = poller.run(CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);
        assert!(state.borrow().error);
        assert_eq!(script.calls(), 1);
    }
}
