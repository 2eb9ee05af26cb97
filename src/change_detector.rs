//! Long-poll loop that turns daemon subsystem notifications into
//! `ChangeEvent`s.
//!
//! The detector owns its own connection and parks in `idle` on it. When the
//! daemon reports a change it re-reads `status`, swaps the result into the
//! `StateMirror`, and only then publishes events computed from the diff.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::broadcast;

use crate::command_transport::CommandTransport;
use crate::daemon::ProtocolError;
use crate::protocol::{ChangeEvent, PlaybackState, Reply, Request, StatusSnapshot, Subsystem};
use crate::state_mirror::StateMirror;

const WATCHED: [Subsystem; 3] = [Subsystem::Player, Subsystem::Options, Subsystem::Playlist];

/// Why the detector loop returned normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorExit {
    /// The stop flag was observed.
    Stopped,
    /// The track changed while quit-after-current was armed.
    QuitAfterCurrent,
}

pub struct ChangeDetector {
    transport: CommandTransport,
    mirror: StateMirror,
    events: broadcast::Sender<ChangeEvent>,
    stop: Arc<AtomicBool>,
    quit_after_current: Arc<AtomicBool>,
    retry_pause: Duration,
    /// Track and state last seen on a player wake-up. Options wake-ups also
    /// refresh the mirror, so player diffs are taken against this instead.
    player: (Option<u32>, PlaybackState),
}

impl ChangeDetector {
    pub fn new(
        transport: CommandTransport,
        mirror: StateMirror,
        events: broadcast::Sender<ChangeEvent>,
        stop: Arc<AtomicBool>,
        quit_after_current: Arc<AtomicBool>,
        retry_pause: Duration,
    ) -> Self {
        Self {
            transport,
            mirror,
            events,
            stop,
            quit_after_current,
            retry_pause,
            player: (None, PlaybackState::Stopped),
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Runs until stopped, until quit-after-current fires, or until a
    /// non-connection error. Connection errors are retried forever.
    pub fn run(mut self) -> Result<DetectorExit, ProtocolError> {
        info!("ChangeDetector: started");
        let exit = self.watch();
        self.transport.disconnect();
        match &exit {
            Ok(reason) => info!("ChangeDetector: exiting ({:?})", reason),
            Err(err) => error!("ChangeDetector: terminated by daemon error: {}", err),
        }
        exit
    }

    fn watch(&mut self) -> Result<DetectorExit, ProtocolError> {
        if !self.prime()? {
            return Ok(DetectorExit::Stopped);
        }
        let idle = Request::Idle(WATCHED.to_vec());
        loop {
            if self.stopped() {
                return Ok(DetectorExit::Stopped);
            }
            let subsystems = match self.transport.execute_once(&idle) {
                Ok(Reply::Subsystems(subsystems)) => subsystems,
                Ok(other) => {
                    return Err(ProtocolError::Malformed(format!(
                        "idle returned a {} reply",
                        other.kind()
                    )))
                }
                // Quiet daemon: re-arm on a fresh connection without pausing.
                Err(err) if err.is_timeout() => {
                    debug!("ChangeDetector: idle timed out, re-arming");
                    continue;
                }
                Err(err) if err.is_connection_error() => {
                    self.pause(&err);
                    continue;
                }
                Err(err) => return Err(err),
            };
            if self.stopped() {
                return Ok(DetectorExit::Stopped);
            }
            match self.process(&subsystems) {
                Ok(Some(exit)) => return Ok(exit),
                Ok(None) => {}
                Err(err) if err.is_connection_error() => self.pause(&err),
                Err(err) => return Err(err),
            }
        }
    }

    /// Seeds the mirror without emitting anything. Returns false when the
    /// stop flag was raised first.
    fn prime(&mut self) -> Result<bool, ProtocolError> {
        loop {
            if self.stopped() {
                return Ok(false);
            }
            match self.fetch_status() {
                Ok(status) => {
                    self.player = (status.track_id, status.state);
                    self.mirror.replace(status);
                    return Ok(true);
                }
                Err(err) if err.is_connection_error() => self.pause(&err),
                Err(err) => return Err(err),
            }
        }
    }

    fn pause(&self, err: &ProtocolError) {
        warn!(
            "ChangeDetector: connection problem ({}), retrying in {:?}",
            err, self.retry_pause
        );
        thread::sleep(self.retry_pause);
    }

    fn fetch_status(&mut self) -> Result<StatusSnapshot, ProtocolError> {
        match self.transport.execute_once(&Request::Status)? {
            Reply::Status(status) => Ok(status),
            other => Err(ProtocolError::Malformed(format!(
                "status returned a {} reply",
                other.kind()
            ))),
        }
    }

    fn process(&mut self, subsystems: &[Subsystem]) -> Result<Option<DetectorExit>, ProtocolError> {
        for subsystem in subsystems {
            match subsystem {
                Subsystem::Player => {
                    if let Some(exit) = self.on_player()? {
                        return Ok(Some(exit));
                    }
                }
                Subsystem::Options => self.on_options()?,
                other => debug!("ChangeDetector: ignoring `{}` change", other.as_str()),
            }
        }
        Ok(None)
    }

    fn on_player(&mut self) -> Result<Option<DetectorExit>, ProtocolError> {
        let status = self.fetch_status()?;
        self.mirror.replace(status.clone());
        let (previous_track, previous_state) =
            std::mem::replace(&mut self.player, (status.track_id, status.state));

        if previous_track != status.track_id {
            if self.quit_after_current.swap(false, Ordering::SeqCst) {
                info!("ChangeDetector: current track ended, quitting as requested");
                return Ok(Some(DetectorExit::QuitAfterCurrent));
            }
            self.emit(ChangeEvent::TrackChanged);
        }
        if previous_state != status.state {
            self.emit(ChangeEvent::PlaybackStateChanged(status.state));
        }
        Ok(None)
    }

    // Re-announced even when nothing differs; consumers rely on every
    // notification producing a full set.
    fn on_options(&mut self) -> Result<(), ProtocolError> {
        let status = self.fetch_status()?;
        self.mirror.replace(status.clone());
        self.emit(ChangeEvent::ShuffleChanged(status.shuffle));
        self.emit(ChangeEvent::LoopChanged(status.repeat));
        self.emit(ChangeEvent::CrossfadeChanged(status.crossfade_seconds > 0));
        Ok(())
    }

    fn emit(&self, event: ChangeEvent) {
        debug!("ChangeDetector: {:?}", event);
        let _ = self.events.send(event);
    }
}
