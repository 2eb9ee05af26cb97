//! Consumer-facing facade over the command bridge and change detector.
//!
//! A `PlaybackController` owns two daemon connections: one behind the
//! `CommandBridge` for intents and queries, and one private to the
//! `ChangeDetector` thread. Consumers subscribe to `ChangeEvent`s through a
//! broadcast channel. The handle is cheap to clone and every clone drives the
//! same controller.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::artwork_cache::ArtworkCache;
use crate::change_detector::{ChangeDetector, DetectorExit};
use crate::command_bridge::{CommandBridge, CommandError};
use crate::command_transport::CommandTransport;
use crate::config::{Config, DaemonConfig, PlaybackConfig};
use crate::daemon::socket::{Endpoint, SocketConnector};
use crate::daemon::{Connector, ProtocolError};
use crate::protocol::{Capabilities, ChangeEvent, Mount, PlaybackState, Song, StatusSnapshot};
use crate::state_mirror::StateMirror;

const EVENT_CHANNEL_CAPACITY: usize = 256;
/// Queue priority that makes an entry play next.
const PLAY_NEXT_PRIORITY: u8 = 255;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("change detector failed: {0}")]
    Detector(#[source] ProtocolError),
    #[error("change detector panicked")]
    DetectorPanicked,
    #[error("failed to start controller thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("{} is outside the daemon's music directories", .0.display())]
    OutsideMusicRoots(PathBuf),
    #[error("`{0}` is not in the queue")]
    NotQueued(String),
    #[error("queue has no entry at position {0}")]
    NoSuchIndex(u32),
    #[error("nothing was queued from `{0}`")]
    EmptyQueue(String),
    #[error("artwork cache i/o failed: {0}")]
    Artwork(#[from] io::Error),
}

type DetectorHandle = JoinHandle<Result<DetectorExit, ProtocolError>>;

struct ControllerInner {
    bridge: CommandBridge,
    mirror: StateMirror,
    events: broadcast::Sender<ChangeEvent>,
    detector_stop: Arc<AtomicBool>,
    quit_after_current: Arc<AtomicBool>,
    detector: Mutex<Option<DetectorHandle>>,
    /// Set once the shutdown barrier has completed. Also serializes
    /// concurrent shutdown callers.
    finished: Mutex<bool>,
    settings: PlaybackConfig,
    artwork: Mutex<ArtworkCache>,
    mounts: Mutex<Option<Vec<Mount>>>,
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        // The bridge joins its worker on drop; the detector exits at its next
        // wake-up.
        self.detector_stop.store(true, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct PlaybackController {
    inner: Arc<ControllerInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn tcp_endpoint(daemon: &DaemonConfig) -> Endpoint {
    Endpoint::Tcp {
        host: daemon.host.clone(),
        port: daemon.port,
    }
}

#[cfg(unix)]
fn endpoint_for(daemon: &DaemonConfig) -> Endpoint {
    match &daemon.socket_path {
        Some(path) => Endpoint::Unix(PathBuf::from(path)),
        None => tcp_endpoint(daemon),
    }
}

#[cfg(not(unix))]
fn endpoint_for(daemon: &DaemonConfig) -> Endpoint {
    if daemon.socket_path.is_some() {
        warn!("PlaybackController: socket_path is only supported on unix, using host/port");
    }
    tcp_endpoint(daemon)
}

impl PlaybackController {
    /// Connects to the daemon described by `config` over sockets.
    pub fn connect(config: &Config) -> Result<Self, ControllerError> {
        let endpoint = endpoint_for(&config.daemon);
        let command: Arc<dyn Connector> = Arc::new(SocketConnector::new(
            endpoint.clone(),
            Some(config.daemon.timeout()),
        ));
        let idle: Arc<dyn Connector> = Arc::new(SocketConnector::new(
            endpoint,
            Some(config.daemon.idle_timeout()),
        ));
        Self::with_connectors(config, command, idle)
    }

    /// Builds the controller over arbitrary connectors, one for commands
    /// and one for the change detector.
    pub fn with_connectors(
        config: &Config,
        command: Arc<dyn Connector>,
        idle: Arc<dyn Connector>,
    ) -> Result<Self, ControllerError> {
        let bridge = CommandBridge::spawn(CommandTransport::new("command", command))
            .map_err(ControllerError::Spawn)?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let mirror = StateMirror::new();
        let detector_stop = Arc::new(AtomicBool::new(false));
        let quit_after_current = Arc::new(AtomicBool::new(false));
        let artwork_dir = config
            .artwork
            .cache_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(ArtworkCache::default_dir);

        let inner = Arc::new(ControllerInner {
            bridge,
            mirror: mirror.clone(),
            events: events.clone(),
            detector_stop: Arc::clone(&detector_stop),
            quit_after_current: Arc::clone(&quit_after_current),
            detector: Mutex::new(None),
            finished: Mutex::new(false),
            settings: config.playback.clone(),
            artwork: Mutex::new(ArtworkCache::new(artwork_dir, config.artwork.max_entries)),
            mounts: Mutex::new(None),
        });

        let detector = ChangeDetector::new(
            CommandTransport::new("idle", idle),
            mirror,
            events,
            detector_stop,
            quit_after_current,
            config.detector.retry_delay(),
        );
        let weak = Arc::downgrade(&inner);
        let handle = thread::Builder::new()
            .name("change-detector".to_string())
            .spawn(move || run_detector(detector, weak))
            .map_err(ControllerError::Spawn)?;
        *lock(&inner.detector) = Some(handle);

        info!("PlaybackController: started");
        Ok(Self { inner })
    }

    /// Receiver for every `ChangeEvent` published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.events.subscribe()
    }

    fn bridge(&self) -> &CommandBridge {
        &self.inner.bridge
    }

    /// Rescans the library, replaces the queue with `source` and starts
    /// playback on a random entry of it.
    pub fn start(&self, source: &str) -> Result<(), ControllerError> {
        let settings = &self.inner.settings;
        let bridge = self.bridge();
        let job = bridge.update()?;
        debug!("PlaybackController: library update job {}", job);
        let mounts = self.refresh_mounts()?;
        let uri = to_daemon_uri(source, &mounts)?;

        bridge.clear()?;
        bridge.consume(false)?;
        bridge.random(settings.shuffle)?;
        bridge.repeat(settings.repeat)?;
        bridge.crossfade(if settings.crossfade {
            settings.crossfade_seconds
        } else {
            0
        })?;
        bridge.add(&uri)?;

        let ids: Vec<u32> = bridge
            .playlist_info()?
            .iter()
            .filter_map(|song| song.id)
            .collect();
        if ids.is_empty() {
            return Err(ControllerError::EmptyQueue(source.to_string()));
        }
        let id = ids[random_index(ids.len())];
        info!(
            "PlaybackController: queued {} entries from `{}`, starting with id {}",
            ids.len(),
            source,
            id
        );
        bridge.play_id(id)?;
        Ok(())
    }

    pub fn play(&self) -> Result<(), ControllerError> {
        Ok(self.bridge().play(None)?)
    }

    pub fn pause(&self) -> Result<(), ControllerError> {
        Ok(self.bridge().pause(true)?)
    }

    pub fn stop(&self) -> Result<(), ControllerError> {
        Ok(self.bridge().stop()?)
    }

    pub fn next(&self) -> Result<(), ControllerError> {
        Ok(self.bridge().next()?)
    }

    pub fn previous(&self) -> Result<(), ControllerError> {
        Ok(self.bridge().previous()?)
    }

    /// Seeks within the current track.
    pub fn seek(&self, position: Duration) -> Result<(), ControllerError> {
        Ok(self.bridge().seek_current(position)?)
    }

    pub fn set_shuffle(&self, enabled: bool) -> Result<(), ControllerError> {
        Ok(self.bridge().random(enabled)?)
    }

    pub fn set_loop(&self, enabled: bool) -> Result<(), ControllerError> {
        Ok(self.bridge().repeat(enabled)?)
    }

    /// `true` applies the configured crossfade length, `false` disables it.
    pub fn set_crossfade(&self, enabled: bool) -> Result<(), ControllerError> {
        let seconds = if enabled {
            self.inner.settings.crossfade_seconds
        } else {
            0
        };
        Ok(self.bridge().crossfade(seconds)?)
    }

    /// Pauses when playing, resumes when paused, starts when stopped.
    pub fn toggle_playing(&self) -> Result<(), ControllerError> {
        match self.bridge().status()?.state {
            PlaybackState::Playing => self.pause(),
            PlaybackState::Paused => Ok(self.bridge().pause(false)?),
            PlaybackState::Stopped => self.play(),
        }
    }

    pub fn set_playing(&self, playing: bool) -> Result<(), ControllerError> {
        if !playing {
            return self.pause();
        }
        if self.bridge().status()?.state == PlaybackState::Stopped {
            self.play()
        } else {
            Ok(self.bridge().pause(false)?)
        }
    }

    pub fn set_stopped(&self, stopped: bool) -> Result<(), ControllerError> {
        if stopped {
            self.stop()
        } else {
            self.play()
        }
    }

    /// Jumps playback to queue position `index`.
    pub fn play_index(&self, index: u32) -> Result<(), ControllerError> {
        Ok(self.bridge().play(Some(index))?)
    }

    /// Jumps playback to the queued entry for `path`.
    pub fn play_path(&self, path: &str) -> Result<(), ControllerError> {
        let uri = to_daemon_uri(path, &self.mounts()?)?;
        let position = self
            .bridge()
            .playlist_find("file", &uri)?
            .first()
            .and_then(|song| song.pos)
            .ok_or(ControllerError::NotQueued(uri))?;
        self.play_index(position)
    }

    /// Makes the entry at queue position `index` play next.
    pub fn enqueue_by_index(&self, index: u32) -> Result<(), ControllerError> {
        let id = self
            .bridge()
            .playlist_info()?
            .iter()
            .find(|song| song.pos == Some(index))
            .and_then(|song| song.id)
            .ok_or(ControllerError::NoSuchIndex(index))?;
        Ok(self.bridge().prio_id(PLAY_NEXT_PRIORITY, id)?)
    }

    /// Makes `path` play next, adding it to the queue first if needed.
    pub fn enqueue_by_path(&self, path: &str) -> Result<(), ControllerError> {
        let uri = to_daemon_uri(path, &self.mounts()?)?;
        let bridge = self.bridge();
        let mut queued = bridge.playlist_find("file", &uri)?;
        if queued.is_empty() {
            bridge.add(&uri)?;
            queued = bridge.playlist_find("file", &uri)?;
        }
        let id = queued
            .first()
            .and_then(|song| song.id)
            .ok_or(ControllerError::NotQueued(uri))?;
        Ok(bridge.prio_id(PLAY_NEXT_PRIORITY, id)?)
    }

    /// Stops playback at the next track change and shuts the controller
    /// down. One-shot.
    pub fn quit_after_current(&self) {
        info!("PlaybackController: will quit after the current track");
        self.inner.quit_after_current.store(true, Ordering::SeqCst);
    }

    pub fn status(&self) -> Result<StatusSnapshot, ControllerError> {
        Ok(self.bridge().status()?)
    }

    pub fn current_song(&self) -> Result<Option<Song>, ControllerError> {
        Ok(self.bridge().current_song()?)
    }

    pub fn queue_songs(&self) -> Result<Vec<Song>, ControllerError> {
        Ok(self.bridge().playlist_info()?)
    }

    /// Queue entries as local filesystem paths.
    pub fn queue(&self) -> Result<Vec<PathBuf>, ControllerError> {
        let mounts = self.mounts()?;
        Ok(self
            .queue_songs()?
            .iter()
            .map(|song| to_local_path(&song.file, &mounts))
            .collect())
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            repeat: true,
            shuffle: true,
            crossfade: true,
        }
    }

    /// Last status seen by the change detector, without a daemon round trip.
    pub fn mirror(&self) -> Option<StatusSnapshot> {
        self.inner.mirror.snapshot()
    }

    /// Cover art file of the current song, fetched on first request.
    pub fn current_artwork(&self) -> Result<Option<PathBuf>, ControllerError> {
        let Some(song) = self.current_song()? else {
            return Ok(None);
        };
        let Some(id) = song.id else {
            return Ok(None);
        };
        let bridge = self.bridge();
        let mut artwork = lock(&self.inner.artwork);
        artwork.get_or_fetch(id, &song.file, || {
            bridge
                .read_picture(&song.file)
                .map_err(ControllerError::from)
        })
    }

    pub fn is_detector_running(&self) -> bool {
        lock(&self.inner.detector)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn is_finished(&self) -> bool {
        *lock(&self.inner.finished)
    }

    fn mounts(&self) -> Result<Vec<Mount>, ControllerError> {
        if let Some(mounts) = lock(&self.inner.mounts).as_ref() {
            return Ok(mounts.clone());
        }
        self.refresh_mounts()
    }

    fn refresh_mounts(&self) -> Result<Vec<Mount>, ControllerError> {
        let mounts = self.bridge().list_mounts()?;
        *lock(&self.inner.mounts) = Some(mounts.clone());
        Ok(mounts)
    }

    /// Stops playback, clears the daemon queue, then shuts down the command
    /// worker and the change detector and waits for both. Publishes
    /// `Finished` once done. Later calls return immediately.
    pub fn shutdown(&self) -> Result<(), ControllerError> {
        let mut finished = lock(&self.inner.finished);
        if *finished {
            return Ok(());
        }
        info!("PlaybackController: shutting down");
        self.inner.detector_stop.store(true, Ordering::SeqCst);

        // Both also wake the detector out of its long-poll.
        if let Err(err) = self.bridge().stop() {
            warn!("PlaybackController: stop during shutdown failed: {}", err);
        }
        if let Err(err) = self.bridge().clear() {
            warn!("PlaybackController: clear during shutdown failed: {}", err);
        }

        let bridge_result = self.bridge().shutdown();
        let detector_result = self.join_detector();
        lock(&self.inner.artwork).clear();

        *finished = true;
        let _ = self.inner.events.send(ChangeEvent::Finished);
        info!("PlaybackController: finished");

        bridge_result?;
        detector_result
    }

    fn join_detector(&self) -> Result<(), ControllerError> {
        let Some(handle) = lock(&self.inner.detector).take() else {
            return Ok(());
        };
        if handle.thread().id() == thread::current().id() {
            return Ok(());
        }
        match handle.join() {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => Err(ControllerError::Detector(err)),
            Err(_) => Err(ControllerError::DetectorPanicked),
        }
    }
}

fn run_detector(
    detector: ChangeDetector,
    controller: Weak<ControllerInner>,
) -> Result<DetectorExit, ProtocolError> {
    let exit = detector.run();
    if matches!(exit, Ok(DetectorExit::QuitAfterCurrent)) {
        if let Some(inner) = controller.upgrade() {
            // The detector thread must not join itself.
            let controller = PlaybackController { inner };
            let spawned = thread::Builder::new()
                .name("quit-after-current".to_string())
                .spawn(move || {
                    if let Err(err) = controller.shutdown() {
                        error!("PlaybackController: quit-after-current shutdown failed: {}", err);
                    }
                });
            if let Err(err) = spawned {
                error!("PlaybackController: failed to spawn shutdown thread: {}", err);
            }
        }
    }
    exit
}

fn random_index(len: usize) -> usize {
    let mut bytes = [0u8; 8];
    if getrandom::fill(&mut bytes).is_err() {
        return 0;
    }
    (u64::from_le_bytes(bytes) % len as u64) as usize
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

/// Maps a local path to a daemon URI through the mount table. Relative
/// paths are taken to be daemon URIs already. The music root itself maps to
/// the empty URI.
fn to_daemon_uri(source: &str, mounts: &[Mount]) -> Result<String, ControllerError> {
    let path = expand_home(source.trim());
    if !path.is_absolute() {
        return Ok(source.trim().trim_end_matches('/').to_string());
    }

    let mut best: Option<(usize, String)> = None;
    for mount in mounts {
        let Some(storage) = mount.storage_path() else {
            continue;
        };
        let Ok(relative) = path.strip_prefix(&storage) else {
            continue;
        };
        let depth = storage.components().count();
        if best.as_ref().is_some_and(|(best_depth, _)| *best_depth >= depth) {
            continue;
        }
        let mut parts: Vec<String> = Vec::new();
        let mount_point = mount.mount.trim_matches('/');
        if !mount_point.is_empty() {
            parts.push(mount_point.to_string());
        }
        parts.extend(
            relative
                .components()
                .map(|component| component.as_os_str().to_string_lossy().into_owned()),
        );
        best = Some((depth, parts.join("/")));
    }
    best.map(|(_, uri)| uri)
        .ok_or(ControllerError::OutsideMusicRoots(path))
}

/// Inverse of `to_daemon_uri`; URIs outside every local mount are returned
/// unchanged.
fn to_local_path(uri: &str, mounts: &[Mount]) -> PathBuf {
    let nested = mounts.iter().filter(|mount| !mount.mount.is_empty()).find_map(|mount| {
        let rest = uri.strip_prefix(mount.mount.trim_matches('/'))?;
        let rest = rest.strip_prefix('/')?;
        Some(mount.storage_path()?.join(rest))
    });
    if let Some(path) = nested {
        return path;
    }
    mounts
        .iter()
        .find(|mount| mount.mount.is_empty())
        .and_then(Mount::storage_path)
        .map(|root| root.join(uri))
        .unwrap_or_else(|| Path::new(uri).to_path_buf())
}
