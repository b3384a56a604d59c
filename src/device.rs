//! Device Lifecycle Manager.
//!
//! Loads the playback SDK once per process, creates a device session bound
//! to a [`TokenProvider`] and tracks its lifecycle as an explicit state
//! machine:
//!
//! ```text
//! Unloaded -> SdkLoading -> SdkReady -> Connecting -> Live(id) <-> NotReady
//!                                                        |           |
//!                                                        +-----+-----+
//!                                                              v
//!                                                        Disconnected
//! ```
//!
//! A `Live` session is not usable for playback right away: the remote
//! service's device registry lags the SDK's own "ready" event. Only after
//! the settle window has passed does [`DeviceManager::ready_device`] hand
//! it out.
//!
//! # SDK seam
//!
//! The SDK is abstracted by the [`Sdk`] and [`Device`] traits. Devices
//! report their lifecycle through [`DeviceEvent`]s on a channel handed to
//! them at creation, which is what tests use to simulate the SDK.

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    sync::{mpsc, watch, OnceCell},
    task::JoinHandle,
    time::Instant,
};

use crate::{
    config::Config,
    error::{Error, Result},
    events::Event,
    tokens::TokenProvider,
};

/// Observed transport state of whatever is producing audio.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct TransportState {
    /// Playback URI of the loaded track, if known.
    pub uri: Option<String>,
    pub position: Duration,
    pub duration: Duration,
    pub paused: bool,
}

/// Events a device reports to its manager.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DeviceEvent {
    /// The remote service acknowledged the device.
    Ready { device_id: String },
    /// The device went offline.
    NotReady { device_id: String },
    /// Transport state changed. `None` when the device is no longer the
    /// one playing.
    StateChanged(Option<TransportState>),
}

/// A device session created by an [`Sdk`].
#[async_trait]
pub trait Device: Send + Sync {
    /// Registers the device with the remote service.
    ///
    /// Success means the request was accepted. The device is usable once it
    /// has sent [`DeviceEvent::Ready`].
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    async fn pause(&self) -> Result<()>;

    async fn resume(&self) -> Result<()>;

    /// Transport state of this device, or `None` if it is not playing
    /// anything.
    async fn current_state(&self) -> Result<Option<TransportState>>;
}

/// A playback SDK.
#[async_trait]
pub trait Sdk: Send + Sync {
    /// Loads the SDK. Called at most once per process by [`SdkLoader`].
    async fn load(&self) -> Result<()>;

    /// Creates a device called `name`. The device must call `tokens` for
    /// every request it authorizes, and report its lifecycle on `events`.
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be created.
    fn create_device(
        &self,
        name: &str,
        tokens: Arc<dyn TokenProvider>,
        events: mpsc::UnboundedSender<DeviceEvent>,
    ) -> Result<Arc<dyn Device>>;
}

/// Loads an [`Sdk`] exactly once.
///
/// Share one loader per process between all managers. Concurrent callers of
/// [`load`](Self::load) wait for the one load in flight. A failed load is
/// not remembered, so the next caller tries again.
pub struct SdkLoader {
    sdk: Arc<dyn Sdk>,
    loaded: OnceCell<()>,
}

impl SdkLoader {
    #[must_use]
    pub fn new(sdk: Arc<dyn Sdk>) -> Self {
        Self {
            sdk,
            loaded: OnceCell::new(),
        }
    }

    /// Loads the SDK unless it already is.
    ///
    /// # Errors
    ///
    /// Returns the error of the SDK load.
    pub async fn load(&self) -> Result<&Arc<dyn Sdk>> {
        self.loaded
            .get_or_try_init(|| async {
                info!("loading playback sdk");
                self.sdk.load().await
            })
            .await?;
        Ok(&self.sdk)
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.loaded.initialized()
    }
}

/// Lifecycle state of the device session.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum DeviceState {
    #[default]
    Unloaded,
    SdkLoading,
    SdkReady,
    Connecting,
    Live {
        device_id: String,
        since: Instant,
    },
    NotReady,
    Disconnected,
}

impl DeviceState {
    /// Whether a teardown has happened or nothing was started yet.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Unloaded | Self::Disconnected)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unloaded => write!(f, "unloaded"),
            Self::SdkLoading => write!(f, "loading sdk"),
            Self::SdkReady => write!(f, "sdk ready"),
            Self::Connecting => write!(f, "connecting"),
            Self::Live { device_id, .. } => write!(f, "live ({device_id})"),
            Self::NotReady => write!(f, "not ready"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// A live device that has passed its settle window.
#[derive(Clone)]
pub struct ReadyDevice {
    pub id: String,
    pub device: Arc<dyn Device>,
}

impl fmt::Debug for ReadyDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadyDevice").field("id", &self.id).finish_non_exhaustive()
    }
}

pub struct DeviceManager {
    loader: Arc<SdkLoader>,
    name: String,
    tokens: Arc<dyn TokenProvider>,
    settle_window: Duration,

    state: Arc<watch::Sender<DeviceState>>,
    transport: Arc<watch::Sender<Option<TransportState>>>,
    event_tx: Option<mpsc::UnboundedSender<Event>>,

    device: Mutex<Option<Arc<dyn Device>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceManager {
    #[must_use]
    pub fn new(config: &Config, loader: Arc<SdkLoader>, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            loader,
            name: config.device_name.clone(),
            tokens,
            settle_window: config.settle_window,
            state: Arc::new(watch::channel(DeviceState::Unloaded).0),
            transport: Arc::new(watch::channel(None).0),
            event_tx: None,
            device: Mutex::new(None),
            pump: Mutex::new(None),
        }
    }

    /// Sends [`Event::DeviceReady`] and [`Event::DeviceLost`] to `tx`.
    pub fn register(&mut self, tx: mpsc::UnboundedSender<Event>) {
        self.event_tx = Some(tx);
    }

    /// Loads the SDK if needed, creates the device session and connects it.
    ///
    /// Does nothing if a session is already running.
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if the SDK cannot be loaded or the device
    /// cannot be created or connected. The manager is back in `Unloaded`
    /// afterwards.
    pub async fn start(&self) -> Result<()> {
        let claimed = self.state.send_if_modified(|state| {
            if state.is_stopped() {
                *state = DeviceState::SdkLoading;
                true
            } else {
                false
            }
        });
        if !claimed {
            debug!("device session already started");
            return Ok(());
        }

        let sdk = match self.loader.load().await {
            Ok(sdk) => Arc::clone(sdk),
            Err(e) => {
                self.state.send_replace(DeviceState::Unloaded);
                return Err(Error::device_unavailable(format!(
                    "unable to load playback sdk: {e}"
                )));
            }
        };
        self.state.send_replace(DeviceState::SdkReady);

        let (tx, rx) = mpsc::unbounded_channel();
        let device = match sdk.create_device(&self.name, Arc::clone(&self.tokens), tx) {
            Ok(device) => device,
            Err(e) => {
                self.state.send_replace(DeviceState::Unloaded);
                return Err(Error::device_unavailable(format!(
                    "unable to create device: {e}"
                )));
            }
        };

        self.state.send_replace(DeviceState::Connecting);
        let pump = tokio::spawn(Self::pump(
            rx,
            self.settle_window,
            Arc::clone(&self.state),
            Arc::clone(&self.transport),
            self.event_tx.clone(),
        ));
        *self.pump.lock().unwrap_or_else(PoisonError::into_inner) = Some(pump);

        if let Err(e) = device.connect().await {
            self.stop_pump();
            self.state.send_replace(DeviceState::Unloaded);
            return Err(Error::device_unavailable(format!(
                "unable to connect {}: {e}",
                self.name
            )));
        }

        info!("connecting as {}", self.name);
        *self.device.lock().unwrap_or_else(PoisonError::into_inner) = Some(device);
        Ok(())
    }

    /// Disconnects the device session.
    ///
    /// Errors while disconnecting are logged and otherwise ignored. Events
    /// the device sends afterwards are dropped.
    pub async fn teardown(&self) {
        self.stop_pump();

        let device = self
            .device
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(device) = device {
            if let Err(e) = device.disconnect().await {
                debug!("ignoring error while disconnecting: {e}");
            }
        }

        self.transport.send_replace(None);
        let previous = self.state.send_replace(DeviceState::Disconnected);
        if matches!(previous, DeviceState::Live { .. }) {
            self.emit(Event::DeviceLost);
        }
        debug!("device session torn down");
    }

    /// Whether a device is live and has been for the settle window.
    #[must_use]
    pub fn device_ready(&self) -> bool {
        self.ready_device().is_some()
    }

    /// The live device, once it has settled.
    #[must_use]
    pub fn ready_device(&self) -> Option<ReadyDevice> {
        let device_id = match &*self.state.borrow() {
            DeviceState::Live { device_id, since } if since.elapsed() >= self.settle_window => {
                device_id.clone()
            }
            _ => return None,
        };

        let device = self
            .device
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()?;

        Some(ReadyDevice {
            id: device_id,
            device,
        })
    }

    #[must_use]
    pub fn state(&self) -> DeviceState {
        self.state.borrow().clone()
    }

    /// Watches the lifecycle state.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<DeviceState> {
        self.state.subscribe()
    }

    /// Watches the transport state pushed by the device.
    #[must_use]
    pub fn transport(&self) -> watch::Receiver<Option<TransportState>> {
        self.transport.subscribe()
    }

    fn stop_pump(&self) {
        if let Some(pump) = self.pump.lock().unwrap_or_else(PoisonError::into_inner).take() {
            pump.abort();
        }
    }

    fn emit(&self, event: Event) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Applies device events to the lifecycle and transport state until the
    /// device drops its sender or the pump is aborted.
    ///
    /// [`Event::DeviceReady`] is sent once a live device has settled.
    async fn pump(
        mut rx: mpsc::UnboundedReceiver<DeviceEvent>,
        settle_window: Duration,
        state: Arc<watch::Sender<DeviceState>>,
        transport: Arc<watch::Sender<Option<TransportState>>>,
        event_tx: Option<mpsc::UnboundedSender<Event>>,
    ) {
        let emit = |event| {
            if let Some(tx) = &event_tx {
                let _ = tx.send(event);
            }
        };

        let mut settles_at: Option<Instant> = None;

        loop {
            let event = tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },

                () = tokio::time::sleep_until(settles_at.unwrap_or_else(Instant::now)),
                    if settles_at.is_some() =>
                {
                    settles_at = None;
                    debug!("device settled");
                    emit(Event::DeviceReady);
                    continue;
                }
            };

            match event {
                DeviceEvent::Ready { device_id } => {
                    info!("device live: {device_id}");
                    let since = Instant::now();
                    settles_at = Some(since + settle_window);
                    state.send_replace(DeviceState::Live { device_id, since });
                }
                DeviceEvent::NotReady { device_id } => {
                    warn!("device went offline: {device_id}");
                    settles_at = None;
                    let previous = state.send_replace(DeviceState::NotReady);
                    transport.send_replace(None);
                    if matches!(previous, DeviceState::Live { .. }) {
                        emit(Event::DeviceLost);
                    }
                }
                DeviceEvent::StateChanged(update) => {
                    trace!("transport state: {update:?}");
                    transport.send_replace(update);
                }
            }
        }

        trace!("device event channel closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Credentials, tokens::BearerToken};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticToken;

    #[async_trait]
    impl TokenProvider for StaticToken {
        async fn bearer_token(&self) -> Result<BearerToken> {
            Ok(BearerToken::new("token", None))
        }
    }

    #[derive(Default)]
    struct FakeSdk {
        loads: AtomicUsize,
        fail_load: bool,
        events: Mutex<Option<mpsc::UnboundedSender<DeviceEvent>>>,
        disconnects: Arc<AtomicUsize>,
    }

    struct FakeDevice {
        disconnects: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Device for FakeDevice {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Err(Error::unavailable("already gone"))
        }

        async fn pause(&self) -> Result<()> {
            Ok(())
        }

        async fn resume(&self) -> Result<()> {
            Ok(())
        }

        async fn current_state(&self) -> Result<Option<TransportState>> {
            Ok(None)
        }
    }

    #[async_trait]
    impl Sdk for FakeSdk {
        async fn load(&self) -> Result<()> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self.fail_load {
                return Err(Error::unavailable("script blocked"));
            }
            Ok(())
        }

        fn create_device(
            &self,
            _name: &str,
            _tokens: Arc<dyn TokenProvider>,
            events: mpsc::UnboundedSender<DeviceEvent>,
        ) -> Result<Arc<dyn Device>> {
            *self.events.lock().unwrap() = Some(events);
            Ok(Arc::new(FakeDevice {
                disconnects: Arc::clone(&self.disconnects),
            }))
        }
    }

    impl FakeSdk {
        fn send(&self, event: DeviceEvent) {
            self.events.lock().unwrap().as_ref().unwrap().send(event).unwrap();
        }
    }

    fn manager(sdk: &Arc<FakeSdk>) -> DeviceManager {
        let config = Config::with_credentials(Credentials::default());
        let loader = Arc::new(SdkLoader::new(Arc::clone(sdk) as Arc<dyn Sdk>));
        DeviceManager::new(&config, loader, Arc::new(StaticToken))
    }

    #[tokio::test(start_paused = true)]
    async fn ready_only_after_settle_window() {
        let sdk = Arc::new(FakeSdk::default());
        let manager = manager(&sdk);
        manager.start().await.unwrap();
        assert_eq!(manager.state(), DeviceState::Connecting);

        sdk.send(DeviceEvent::Ready {
            device_id: "abc".to_owned(),
        });
        let mut state = manager.subscribe();
        state
            .wait_for(|state| matches!(state, DeviceState::Live { .. }))
            .await
            .unwrap();
        assert!(!manager.device_ready());

        tokio::time::advance(Duration::from_millis(1_400)).await;
        assert!(!manager.device_ready());

        tokio::time::advance(Duration::from_millis(200)).await;
        let ready = manager.ready_device().unwrap();
        assert_eq!(ready.id, "abc");
    }

    #[tokio::test(start_paused = true)]
    async fn ready_event_waits_for_settle_window() {
        let sdk = Arc::new(FakeSdk::default());
        let mut manager = manager(&sdk);
        let (tx, mut events) = mpsc::unbounded_channel();
        manager.register(tx);
        manager.start().await.unwrap();

        sdk.send(DeviceEvent::Ready {
            device_id: "abc".to_owned(),
        });
        let mut state = manager.subscribe();
        state
            .wait_for(|state| matches!(state, DeviceState::Live { .. }))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_millis(1_400)).await;
        tokio::task::yield_now().await;
        assert!(events.try_recv().is_err());

        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(events.recv().await, Some(Event::DeviceReady));
        assert!(manager.device_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn device_lost_before_settling_is_never_ready() {
        let sdk = Arc::new(FakeSdk::default());
        let mut manager = manager(&sdk);
        let (tx, mut events) = mpsc::unbounded_channel();
        manager.register(tx);
        manager.start().await.unwrap();

        sdk.send(DeviceEvent::Ready {
            device_id: "abc".to_owned(),
        });
        sdk.send(DeviceEvent::NotReady {
            device_id: "abc".to_owned(),
        });
        assert_eq!(events.recv().await, Some(Event::DeviceLost));

        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn not_ready_clears_the_device() {
        let sdk = Arc::new(FakeSdk::default());
        let manager = manager(&sdk);
        manager.start().await.unwrap();

        let mut state = manager.subscribe();
        sdk.send(DeviceEvent::Ready {
            device_id: "abc".to_owned(),
        });
        sdk.send(DeviceEvent::NotReady {
            device_id: "abc".to_owned(),
        });
        state
            .wait_for(|state| *state == DeviceState::NotReady)
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!manager.device_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn sdk_loads_once_for_concurrent_starts() {
        let sdk = Arc::new(FakeSdk::default());
        let loader = Arc::new(SdkLoader::new(Arc::clone(&sdk) as Arc<dyn Sdk>));
        let config = Config::with_credentials(Credentials::default());
        let first = DeviceManager::new(&config, Arc::clone(&loader), Arc::new(StaticToken));
        let second = DeviceManager::new(&config, Arc::clone(&loader), Arc::new(StaticToken));

        let (a, b) = tokio::join!(first.start(), second.start());
        a.unwrap();
        b.unwrap();
        assert_eq!(sdk.loads.load(Ordering::SeqCst), 1);
        assert!(loader.is_loaded());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_load_is_device_unavailable() {
        let sdk = Arc::new(FakeSdk {
            fail_load: true,
            ..FakeSdk::default()
        });
        let manager = manager(&sdk);
        let err = manager.start().await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::DeviceUnavailable);
        assert_eq!(manager.state(), DeviceState::Unloaded);
        assert!(!manager.device_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_swallows_disconnect_errors() {
        let sdk = Arc::new(FakeSdk::default());
        let manager = manager(&sdk);
        manager.start().await.unwrap();

        manager.teardown().await;
        assert_eq!(manager.state(), DeviceState::Disconnected);
        assert_eq!(sdk.disconnects.load(Ordering::SeqCst), 1);

        // Late events are ignored.
        let _ = sdk
            .events
            .lock()
            .unwrap()
            .as_ref()
            .unwrap()
            .send(DeviceEvent::Ready {
                device_id: "late".to_owned(),
            });
        tokio::task::yield_now().await;
        assert_eq!(manager.state(), DeviceState::Disconnected);
    }
}
