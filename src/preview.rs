//! Local preview audio.
//!
//! The degraded playback path plays the track's short preview clip through a
//! local media element. The element is owned by the Playback Controller,
//! created lazily once and released on teardown. Its own clock is the
//! authoritative transport state while it is the one producing audio.
//!
//! With the `audio` feature, [`AudioElement`] plays previews through the
//! default output device with `rodio`.

use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::{device::TransportState, error::Result};

/// A native media element, like an HTML `<audio>` element.
#[async_trait]
pub trait MediaElement: Send + Sync {
    /// The loaded source, if any.
    fn source(&self) -> Option<&Url>;

    /// Loads `url` and rewinds. Playback is paused afterwards.
    ///
    /// # Errors
    ///
    /// Returns error if the source cannot be fetched or decoded.
    async fn set_source(&mut self, url: &Url) -> Result<()>;

    /// Starts or resumes playback, rewinding first if the clip had ended.
    ///
    /// # Errors
    ///
    /// Returns error if no source is loaded or the output fails.
    async fn play(&mut self) -> Result<()>;

    fn pause(&mut self);

    fn paused(&self) -> bool;

    /// Whether the clip played to its end.
    fn ended(&self) -> bool;

    fn position(&self) -> Duration;

    fn duration(&self) -> Option<Duration>;

    /// Stops playback and frees the output.
    fn release(&mut self);

    /// Transport state as seen by this element's clock.
    fn transport(&self) -> TransportState {
        TransportState {
            uri: self.source().map(ToString::to_string),
            position: self.position(),
            duration: self.duration().unwrap_or_default(),
            paused: self.paused() || self.ended(),
        }
    }
}

/// Creates the preview element on first use.
pub type MediaFactory = Box<dyn Fn() -> Result<Box<dyn MediaElement>> + Send + Sync>;

#[cfg(feature = "audio")]
pub use self::audio::AudioElement;

#[cfg(feature = "audio")]
mod audio {
    use std::{
        io::Cursor,
        sync::{mpsc as std_mpsc, Arc},
        thread,
        time::Duration,
    };

    use async_trait::async_trait;
    use rodio::{Decoder, OutputStream, Sink, Source};
    use url::Url;

    use super::MediaElement;
    use crate::{
        error::{Error, Result},
        http::Client as HttpClient,
    };

    /// Preview element playing through the default output device.
    ///
    /// The output stream is not `Send`, so it lives on a dedicated thread
    /// for as long as the element does. The element only holds the sink.
    pub struct AudioElement {
        http_client: HttpClient,
        sink: Arc<Sink>,
        source: Option<Url>,
        clip: Option<Vec<u8>>,
        duration: Option<Duration>,
        shutdown: Option<std_mpsc::Sender<()>>,
    }

    impl AudioElement {
        /// Opens the default output device. Clips are downloaded with
        /// `http_client`.
        ///
        /// # Errors
        ///
        /// Returns `DeviceUnavailable` if no output device can be opened.
        pub fn new(http_client: HttpClient) -> Result<Self> {
            let (sink_tx, sink_rx) = std_mpsc::sync_channel(1);
            let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

            thread::Builder::new()
                .name("preview audio".to_owned())
                .spawn(move || {
                    let opened = OutputStream::try_default()
                        .map_err(Error::from)
                        .and_then(|(stream, handle)| {
                            Sink::try_new(&handle)
                                .map(|sink| (stream, Arc::new(sink)))
                                .map_err(Error::from)
                        });

                    match opened {
                        Ok((stream, sink)) => {
                            let _ = sink_tx.send(Ok(sink));
                            // Keep the stream open until released.
                            let _ = shutdown_rx.recv();
                            drop(stream);
                        }
                        Err(e) => {
                            let _ = sink_tx.send(Err(e));
                        }
                    }
                    trace!("preview audio thread stopped");
                })?;

            let sink = sink_rx
                .recv()
                .map_err(|e| Error::device_unavailable(e.to_string()))??;
            sink.pause();

            Ok(Self {
                http_client,
                sink,
                source: None,
                clip: None,
                duration: None,
                shutdown: Some(shutdown_tx),
            })
        }

        fn enqueue(&mut self) -> Result<()> {
            let clip = self
                .clip
                .clone()
                .ok_or_else(|| Error::failed_precondition("no preview loaded"))?;
            let decoder = Decoder::new(Cursor::new(clip))?;
            self.duration = decoder.total_duration();

            self.sink.clear();
            self.sink.append(decoder);
            Ok(())
        }
    }

    #[async_trait]
    impl MediaElement for AudioElement {
        fn source(&self) -> Option<&Url> {
            self.source.as_ref()
        }

        async fn set_source(&mut self, url: &Url) -> Result<()> {
            let request = self.http_client.get(url.clone());
            let response = self.http_client.execute(request).await?;
            let clip = response.error_for_status()?.bytes().await?;
            debug!("loaded preview of {} bytes", clip.len());

            self.clip = Some(clip.to_vec());
            self.source = Some(url.clone());
            self.enqueue()
        }

        async fn play(&mut self) -> Result<()> {
            if self.ended() {
                self.enqueue()?;
            }
            self.sink.play();
            Ok(())
        }

        fn pause(&mut self) {
            self.sink.pause();
        }

        fn paused(&self) -> bool {
            self.sink.is_paused()
        }

        fn ended(&self) -> bool {
            self.source.is_some() && self.sink.empty()
        }

        fn position(&self) -> Duration {
            self.sink.get_pos()
        }

        fn duration(&self) -> Option<Duration> {
            self.duration
        }

        fn release(&mut self) {
            self.sink.stop();
            self.source = None;
            self.clip = None;
            if let Some(shutdown) = self.shutdown.take() {
                let _ = shutdown.send(());
            }
        }
    }

    impl Drop for AudioElement {
        fn drop(&mut self) {
            self.release();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex, PoisonError};

    use super::*;

    /// What a [`FakeElement`] was asked to do.
    #[derive(Debug, Default)]
    pub(crate) struct Journal {
        pub created: usize,
        pub sources: Vec<Url>,
        pub plays: usize,
        pub pauses: usize,
        pub released: bool,
    }

    /// In-memory element whose clip ends when told to.
    pub(crate) struct FakeElement {
        journal: Arc<Mutex<Journal>>,
        source: Option<Url>,
        paused: bool,
        ended: Arc<Mutex<bool>>,
    }

    impl FakeElement {
        pub(crate) fn factory(journal: &Arc<Mutex<Journal>>, ended: &Arc<Mutex<bool>>) -> MediaFactory {
            let journal = Arc::clone(journal);
            let ended = Arc::clone(ended);
            Box::new(move || {
                journal.lock().unwrap_or_else(PoisonError::into_inner).created += 1;
                Ok(Box::new(FakeElement {
                    journal: Arc::clone(&journal),
                    source: None,
                    paused: true,
                    ended: Arc::clone(&ended),
                }) as Box<dyn MediaElement>)
            })
        }

        fn journal(&self) -> std::sync::MutexGuard<'_, Journal> {
            self.journal.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    #[async_trait]
    impl MediaElement for FakeElement {
        fn source(&self) -> Option<&Url> {
            self.source.as_ref()
        }

        async fn set_source(&mut self, url: &Url) -> Result<()> {
            self.journal().sources.push(url.clone());
            self.source = Some(url.clone());
            self.paused = true;
            *self.ended.lock().unwrap_or_else(PoisonError::into_inner) = false;
            Ok(())
        }

        async fn play(&mut self) -> Result<()> {
            self.journal().plays += 1;
            self.paused = false;
            *self.ended.lock().unwrap_or_else(PoisonError::into_inner) = false;
            Ok(())
        }

        fn pause(&mut self) {
            self.journal().pauses += 1;
            self.paused = true;
        }

        fn paused(&self) -> bool {
            self.paused
        }

        fn ended(&self) -> bool {
            *self.ended.lock().unwrap_or_else(PoisonError::into_inner)
        }

        fn position(&self) -> Duration {
            Duration::ZERO
        }

        fn duration(&self) -> Option<Duration> {
            Some(Duration::from_secs(30))
        }

        fn release(&mut self) {
            self.journal().released = true;
            self.source = None;
            self.paused = true;
        }
    }

    #[test]
    fn ended_clip_reports_paused_transport() {
        let journal = Arc::new(Mutex::new(Journal::default()));
        let ended = Arc::new(Mutex::new(true));
        let element = FakeElement::factory(&journal, &ended)().unwrap();
        let transport = element.transport();
        assert!(transport.paused);
        assert_eq!(transport.duration, Duration::from_secs(30));
        assert!(transport.uri.is_none());
    }
}
