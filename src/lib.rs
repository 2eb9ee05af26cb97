//! Threaded controller for a music playback daemon.
//!
//! Commands from any thread are serialized onto one daemon connection by the
//! `CommandBridge`; a `ChangeDetector` long-polls a second connection and
//! publishes `ChangeEvent`s. `PlaybackController` ties both together.

pub mod artwork_cache;
pub mod change_detector;
pub mod command_bridge;
pub mod command_transport;
pub mod config;
pub mod daemon;
pub mod playback_controller;
pub mod protocol;
pub mod state_mirror;

#[cfg(test)]
mod testing;

pub use command_bridge::{CommandBridge, CommandError};
pub use config::Config;
pub use playback_controller::{ControllerError, PlaybackController};
pub use protocol::{ChangeEvent, PlaybackState, StatusSnapshot};
