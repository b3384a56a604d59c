//! Headless now-playing and playback control engine.
//!
//! Keeps an up-to-date view of the track a listener is or was playing, and
//! toggles playback of that track on a remote Connect device, falling back
//! to a local preview clip when no device is available.
//!
//! # Components
//!
//! * [`broker`] - exchanges the refresh credential for bearer tokens
//! * [`resolver`] - resolves the current or last played track
//! * [`device`] - device session lifecycle, with [`connect`] as the SDK
//! * [`controller`] - play/pause with the Start Protocol and preview fallback
//! * [`poller`] - keeps the displayed state fresh while visible
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]

#[macro_use]
extern crate log;

pub mod api;
pub mod broker;
pub mod config;
pub mod connect;
pub mod controller;
pub mod device;
pub mod error;
pub mod events;
pub mod http;
pub mod poller;
pub mod preview;
pub mod protocol;
pub mod resolver;
pub mod signal;
pub mod tokens;
pub mod track;
