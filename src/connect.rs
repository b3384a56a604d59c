//! Playback SDK backed by the remote API's Connect device registry.
//!
//! The local audio endpoint is a Connect receiver running on this machine
//! (for example a headless player daemon) that registers with the remote
//! service under a known name. This SDK finds that device in
//! `GET /me/player/devices` and reports it through the [`DeviceEvent`]s the
//! Device Lifecycle Manager expects:
//!
//! * `Ready` when the named device appears, or its id changes
//! * `NotReady` when it disappears
//! * `StateChanged` with the transport state while it is the active device
//!
//! The device list is polled on an interval with a little jitter, so that
//! several instances do not hit the service in lockstep.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    api::WebApi,
    config::Config,
    device::{Device, DeviceEvent, Sdk, TransportState},
    error::{Error, Result},
    http::Client as HttpClient,
    protocol::player::{DeviceObject, PlaybackState},
    tokens::TokenProvider,
};

pub struct WebConnect {
    config: Config,
    tokens: Arc<dyn TokenProvider>,
    http_client: HttpClient,
}

impl WebConnect {
    #[must_use]
    pub fn new(config: &Config, tokens: Arc<dyn TokenProvider>, http_client: HttpClient) -> Self {
        Self {
            config: config.clone(),
            tokens,
            http_client,
        }
    }
}

#[async_trait]
impl Sdk for WebConnect {
    /// Verifies that the remote API can be authorized at all.
    async fn load(&self) -> Result<()> {
        self.tokens.bearer_token().await.map(|_| ())
    }

    fn create_device(
        &self,
        name: &str,
        tokens: Arc<dyn TokenProvider>,
        events: mpsc::UnboundedSender<DeviceEvent>,
    ) -> Result<Arc<dyn Device>> {
        let api = WebApi::new(&self.config, tokens, self.http_client.clone());
        Ok(Arc::new(ConnectDevice {
            name: name.to_owned(),
            api: Arc::new(api),
            events,
            poll_interval: self.config.device_poll_interval,
            device_id: Arc::new(Mutex::new(None)),
            watcher: Mutex::new(None),
        }))
    }
}

pub struct ConnectDevice {
    name: String,
    api: Arc<WebApi>,
    events: mpsc::UnboundedSender<DeviceEvent>,
    poll_interval: Duration,
    device_id: Arc<Mutex<Option<String>>>,
    watcher: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
}

impl ConnectDevice {
    fn device_id(&self) -> Option<String> {
        self.device_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Device for ConnectDevice {
    async fn connect(&self) -> Result<()> {
        let mut watcher = self.watcher.lock().unwrap_or_else(PoisonError::into_inner);
        if watcher.is_some() {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let task = Watcher {
            name: self.name.clone(),
            api: Arc::clone(&self.api),
            events: self.events.clone(),
            poll_interval: self.poll_interval,
            device_id: Arc::clone(&self.device_id),
            transport: None,
        };
        let handle = tokio::spawn(task.run(cancel.clone()));
        *watcher = Some((handle, cancel));

        debug!("watching for connect device \"{}\"", self.name);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let watcher = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((handle, cancel)) = watcher {
            cancel.cancel();
            handle.await.map_err(Error::internal)?;
        }

        self.device_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        self.api.pause(self.device_id().as_deref()).await
    }

    async fn resume(&self) -> Result<()> {
        self.api.resume(self.device_id().as_deref()).await
    }

    async fn current_state(&self) -> Result<Option<TransportState>> {
        let Some(device_id) = self.device_id() else {
            return Ok(None);
        };

        let state = self.api.playback_state().await?;
        Ok(state.and_then(|state| transport_of(&state, &device_id)))
    }
}

/// Background task polling the device registry.
struct Watcher {
    name: String,
    api: Arc<WebApi>,
    events: mpsc::UnboundedSender<DeviceEvent>,
    poll_interval: Duration,
    device_id: Arc<Mutex<Option<String>>>,
    transport: Option<TransportState>,
}

impl Watcher {
    async fn run(mut self, cancel: CancellationToken) {
        let mut delay = Duration::ZERO;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }

            if let Err(e) = self.poll().await {
                if e.is_fatal() {
                    error!("stopped watching for \"{}\": {e}", self.name);
                    break;
                }
                warn!("unable to list connect devices: {e}");
            }

            // Jitter up to a tenth of the interval.
            let jitter = self.poll_interval.as_millis() / 10;
            let jitter = u64::try_from(jitter).unwrap_or(u64::MAX);
            delay = self.poll_interval + Duration::from_millis(fastrand::u64(..=jitter));
        }

        trace!("device watcher stopped");
    }

    async fn poll(&mut self) -> Result<()> {
        let devices = self.api.devices().await?;
        let found = devices.into_iter().find(|device| self.matches(device));

        let current = self
            .device_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match (current, &found) {
            (Some(old), Some(DeviceObject { id: Some(new), .. })) if old == *new => {}
            (old, Some(DeviceObject { id: Some(new), .. })) => {
                if let Some(device_id) = old {
                    self.send(DeviceEvent::NotReady { device_id });
                }
                self.set_device_id(Some(new.clone()));
                self.send(DeviceEvent::Ready {
                    device_id: new.clone(),
                });
            }
            (Some(device_id), _) => {
                self.set_device_id(None);
                self.send(DeviceEvent::NotReady { device_id });
                self.update_transport(None);
                return Ok(());
            }
            (None, _) => return Ok(()),
        }

        let transport = match found {
            Some(DeviceObject {
                id: Some(device_id),
                is_active: true,
                ..
            }) => self
                .api
                .playback_state()
                .await?
                .and_then(|state| transport_of(&state, &device_id)),
            _ => None,
        };
        self.update_transport(transport);

        Ok(())
    }

    fn matches(&self, device: &DeviceObject) -> bool {
        device.id.is_some() && !device.is_restricted && device.name == self.name
    }

    fn set_device_id(&self, device_id: Option<String>) {
        *self.device_id.lock().unwrap_or_else(PoisonError::into_inner) = device_id;
    }

    fn update_transport(&mut self, transport: Option<TransportState>) {
        if self.transport != transport {
            self.transport.clone_from(&transport);
            self.send(DeviceEvent::StateChanged(transport));
        }
    }

    fn send(&self, event: DeviceEvent) {
        if self.events.send(event).is_err() {
            trace!("device events dropped: manager is gone");
        }
    }
}

/// Transport state of `device_id`, if it is the device `state` describes.
fn transport_of(state: &PlaybackState, device_id: &str) -> Option<TransportState> {
    let device = state.device.as_ref()?;
    if device.id.as_deref() != Some(device_id) {
        return None;
    }

    let item = state.item.as_ref();
    Some(TransportState {
        uri: item.and_then(|item| item.uri.clone()),
        position: state.progress_ms.unwrap_or_default(),
        duration: item
            .and_then(|item| item.duration_ms)
            .map(Duration::from_millis)
            .unwrap_or_default(),
        paused: !state.is_playing,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_only_for_own_device() {
        let state: PlaybackState = serde_json::from_str(
            r#"{
                "device": { "id": "mine", "name": "nowplaying", "is_active": true },
                "is_playing": true,
                "progress_ms": 1000,
                "item": { "name": "Song", "uri": "spotify:track:1", "duration_ms": 180000 }
            }"#,
        )
        .unwrap();

        let transport = transport_of(&state, "mine").unwrap();
        assert_eq!(transport.uri.as_deref(), Some("spotify:track:1"));
        assert_eq!(transport.position, Duration::from_secs(1));
        assert_eq!(transport.duration, Duration::from_secs(180));
        assert!(!transport.paused);

        assert!(transport_of(&state, "other").is_none());
    }
}
