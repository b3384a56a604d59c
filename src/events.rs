//! Events published to the presentation layer.
//!
//! Components that emit events take an optional
//! `tokio::sync::mpsc::UnboundedSender<Event>`. Nobody listening is fine:
//! events are then dropped.
//!
//! # Example
//!
//! ```rust
//! use nowplaying::events::Event;
//!
//! fn handle_event(event: Event) {
//!     match event {
//!         Event::Play => println!("Playback started"),
//!         Event::TrackChanged => println!("Now playing something else"),
//!         Event::DeviceReady => println!("Device registered"),
//!         // ... handle other events ...
//!     }
//! }
//! ```

/// Significant state changes of the engine.
///
/// # Events
///
/// Playback Events:
/// * [`Play`](Self::Play) - audio started on either path
/// * [`Pause`](Self::Pause) - audio paused or the preview clip ended
/// * [`TrackChanged`](Self::TrackChanged) - the displayed track changed
///
/// Device Events:
/// * [`DeviceReady`](Self::DeviceReady) - a live device has settled and can
///   be used for playback
/// * [`DeviceLost`](Self::DeviceLost) - a live device went offline or was
///   torn down
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Event {
    /// Playback has started.
    Play,

    /// Playback has paused.
    Pause,

    /// A different track is displayed, or none at all.
    TrackChanged,

    /// A device session went live and its settle window has passed.
    DeviceReady,

    /// A live device session ended.
    DeviceLost,
}
