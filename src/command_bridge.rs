//! Thread-safe front end over a single `CommandTransport`.
//!
//! Any thread may `submit`; commands go onto one FIFO queue drained by one
//! worker thread that owns the transport. Each command carries a fresh
//! correlation id and its caller sleeps on a condition variable until the
//! worker files the reply under that id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;
use uuid::Uuid;

use crate::command_transport::CommandTransport;
use crate::daemon::ProtocolError;
use crate::protocol::{Mount, Picture, Reply, Request, Song, StatusSnapshot};

/// Failure of a submitted command, as seen by its caller.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("command bridge is shutting down")]
    ShuttingDown,
    #[error("command worker exited before replying")]
    WorkerGone,
    #[error("command worker panicked")]
    WorkerPanicked,
    #[error("`{command}` returned a {actual} reply, expected {expected}")]
    UnexpectedReply {
        command: &'static str,
        expected: &'static str,
        actual: &'static str,
    },
}

impl CommandError {
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Protocol(err) if err.is_connection_error())
    }
}

/// A queued request with its correlation id. Immutable once submitted.
#[derive(Debug)]
struct Command {
    id: Uuid,
    request: Request,
}

enum Envelope {
    Run(Command),
    Shutdown,
}

struct ReplyTable {
    entries: HashMap<Uuid, Result<Reply, ProtocolError>>,
    worker_alive: bool,
}

/// Correlation id to result map. Written once by the worker, taken once by
/// the caller that owns the id.
struct PendingReplies {
    table: Mutex<ReplyTable>,
    ready: Condvar,
}

impl PendingReplies {
    fn new() -> Self {
        Self {
            table: Mutex::new(ReplyTable {
                entries: HashMap::new(),
                worker_alive: true,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReplyTable> {
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn store(&self, id: Uuid, result: Result<Reply, ProtocolError>) {
        self.lock().entries.insert(id, result);
        self.ready.notify_all();
    }

    fn wait_for(&self, id: Uuid) -> Result<Reply, CommandError> {
        let mut table = self.lock();
        loop {
            if let Some(result) = table.entries.remove(&id) {
                return result.map_err(CommandError::from);
            }
            if !table.worker_alive {
                return Err(CommandError::WorkerGone);
            }
            table = self
                .ready
                .wait(table)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn len(&self) -> usize {
        self.lock().entries.len()
    }
}

/// Marks the worker dead when its thread ends, including by panic, so no
/// caller is left waiting.
struct WorkerExit(Arc<PendingReplies>);

impl Drop for WorkerExit {
    fn drop(&mut self) {
        self.0.lock().worker_alive = false;
        self.0.ready.notify_all();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct CommandBridge {
    sender: Mutex<Option<Sender<Envelope>>>,
    replies: Arc<PendingReplies>,
    worker: Mutex<Option<JoinHandle<()>>>,
    queued: Arc<AtomicUsize>,
    reconnects: Arc<AtomicU64>,
}

impl CommandBridge {
    /// Moves `transport` onto a new worker thread and returns the bridge.
    pub fn spawn(transport: CommandTransport) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let replies = Arc::new(PendingReplies::new());
        let queued = Arc::new(AtomicUsize::new(0));
        let reconnects = Arc::new(AtomicU64::new(0));

        let worker = {
            let replies = Arc::clone(&replies);
            let queued = Arc::clone(&queued);
            let reconnects = Arc::clone(&reconnects);
            thread::Builder::new()
                .name("command-worker".to_string())
                .spawn(move || run_worker(transport, receiver, replies, queued, reconnects))?
        };

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            replies,
            worker: Mutex::new(Some(worker)),
            queued,
            reconnects,
        })
    }

    /// Enqueues `request` and blocks until the worker has answered it.
    pub fn submit(&self, request: Request) -> Result<Reply, CommandError> {
        let id = Uuid::new_v4();
        {
            // Held across the send so nothing lands behind the sentinel.
            let sender = lock(&self.sender);
            let Some(sender) = sender.as_ref() else {
                return Err(CommandError::ShuttingDown);
            };
            self.queued.fetch_add(1, Ordering::SeqCst);
            if sender.send(Envelope::Run(Command { id, request })).is_err() {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                return Err(CommandError::WorkerGone);
            }
        }
        self.replies.wait_for(id)
    }

    /// Commands submitted but not yet picked up by the worker.
    pub fn queue_depth(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Replies filed but not yet collected by their callers.
    pub fn pending_replies(&self) -> usize {
        self.replies.len()
    }

    /// Reconnects performed by the worker's transport so far.
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn is_accepting(&self) -> bool {
        lock(&self.sender).is_some()
    }

    /// Stops accepting commands, lets everything already queued run, and
    /// joins the worker. Safe to call more than once and from several
    /// threads; every caller returns only after the worker has exited.
    pub fn shutdown(&self) -> Result<(), CommandError> {
        if let Some(sender) = lock(&self.sender).take() {
            info!("CommandBridge: shutting down");
            let _ = sender.send(Envelope::Shutdown);
        }
        let mut worker = lock(&self.worker);
        if let Some(handle) = worker.take() {
            handle.join().map_err(|_| CommandError::WorkerPanicked)?;
            debug!("CommandBridge: worker joined");
        }
        Ok(())
    }

    fn expect_ok(&self, request: Request) -> Result<(), CommandError> {
        let command = request.name();
        match self.submit(request)? {
            Reply::Ok => Ok(()),
            other => Err(unexpected(command, "ok", &other)),
        }
    }

    fn expect_songs(&self, request: Request) -> Result<Vec<Song>, CommandError> {
        let command = request.name();
        match self.submit(request)? {
            Reply::Songs(songs) => Ok(songs),
            other => Err(unexpected(command, "song list", &other)),
        }
    }

    pub fn ping(&self) -> Result<(), CommandError> {
        self.expect_ok(Request::Ping)
    }

    /// Starts a library rescan and returns the daemon's job id.
    pub fn update(&self) -> Result<u32, CommandError> {
        match self.submit(Request::Update)? {
            Reply::UpdateJob(job) => Ok(job),
            other => Err(unexpected("update", "update job", &other)),
        }
    }

    pub fn clear(&self) -> Result<(), CommandError> {
        self.expect_ok(Request::Clear)
    }

    pub fn consume(&self, enabled: bool) -> Result<(), CommandError> {
        self.expect_ok(Request::Consume(enabled))
    }

    pub fn random(&self, enabled: bool) -> Result<(), CommandError> {
        self.expect_ok(Request::Random(enabled))
    }

    pub fn repeat(&self, enabled: bool) -> Result<(), CommandError> {
        self.expect_ok(Request::Repeat(enabled))
    }

    pub fn crossfade(&self, seconds: u32) -> Result<(), CommandError> {
        self.expect_ok(Request::Crossfade(seconds))
    }

    pub fn add(&self, uri: &str) -> Result<(), CommandError> {
        self.expect_ok(Request::Add(uri.to_string()))
    }

    pub fn play(&self, position: Option<u32>) -> Result<(), CommandError> {
        self.expect_ok(Request::Play(position))
    }

    pub fn play_id(&self, id: u32) -> Result<(), CommandError> {
        self.expect_ok(Request::PlayId(id))
    }

    pub fn pause(&self, paused: bool) -> Result<(), CommandError> {
        self.expect_ok(Request::Pause(paused))
    }

    pub fn stop(&self) -> Result<(), CommandError> {
        self.expect_ok(Request::Stop)
    }

    pub fn next(&self) -> Result<(), CommandError> {
        self.expect_ok(Request::Next)
    }

    pub fn previous(&self) -> Result<(), CommandError> {
        self.expect_ok(Request::Previous)
    }

    pub fn seek_current(&self, position: Duration) -> Result<(), CommandError> {
        self.expect_ok(Request::SeekCur(position))
    }

    pub fn status(&self) -> Result<StatusSnapshot, CommandError> {
        match self.submit(Request::Status)? {
            Reply::Status(status) => Ok(status),
            other => Err(unexpected("status", "status", &other)),
        }
    }

    pub fn current_song(&self) -> Result<Option<Song>, CommandError> {
        match self.submit(Request::CurrentSong)? {
            Reply::Song(song) => Ok(song),
            other => Err(unexpected("currentsong", "song", &other)),
        }
    }

    pub fn playlist_info(&self) -> Result<Vec<Song>, CommandError> {
        self.expect_songs(Request::PlaylistInfo)
    }

    /// Exact-match search over the queue.
    pub fn playlist_find(&self, tag: &str, needle: &str) -> Result<Vec<Song>, CommandError> {
        self.expect_songs(Request::PlaylistFind {
            tag: tag.to_string(),
            needle: needle.to_string(),
        })
    }

    /// Exact-match search over the library.
    pub fn find(&self, tag: &str, needle: &str) -> Result<Vec<Song>, CommandError> {
        self.expect_songs(Request::Find {
            tag: tag.to_string(),
            needle: needle.to_string(),
        })
    }

    pub fn list_mounts(&self) -> Result<Vec<Mount>, CommandError> {
        match self.submit(Request::ListMounts)? {
            Reply::Mounts(mounts) => Ok(mounts),
            other => Err(unexpected("listmounts", "mount list", &other)),
        }
    }

    pub fn read_picture(&self, uri: &str) -> Result<Option<Picture>, CommandError> {
        match self.submit(Request::ReadPicture(uri.to_string()))? {
            Reply::Picture(picture) => Ok(picture),
            other => Err(unexpected("readpicture", "picture", &other)),
        }
    }

    pub fn prio_id(&self, priority: u8, id: u32) -> Result<(), CommandError> {
        self.expect_ok(Request::PrioId { priority, id })
    }
}

impl Drop for CommandBridge {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!("CommandBridge: shutdown on drop failed: {}", err);
        }
    }
}

fn unexpected(command: &'static str, expected: &'static str, actual: &Reply) -> CommandError {
    CommandError::UnexpectedReply {
        command,
        expected,
        actual: actual.kind(),
    }
}

fn run_worker(
    mut transport: CommandTransport,
    receiver: Receiver<Envelope>,
    replies: Arc<PendingReplies>,
    queued: Arc<AtomicUsize>,
    reconnects: Arc<AtomicU64>,
) {
    let _exit = WorkerExit(Arc::clone(&replies));
    while let Ok(envelope) = receiver.recv() {
        let command = match envelope {
            Envelope::Run(command) => command,
            Envelope::Shutdown => break,
        };
        queued.fetch_sub(1, Ordering::SeqCst);
        debug!("CommandBridge: running `{}` ({})", command.request.name(), command.id);
        let result = transport.execute(&command.request);
        if let Err(err) = &result {
            debug!("CommandBridge: `{}` failed: {}", command.request.name(), err);
        }
        reconnects.store(transport.reconnect_count(), Ordering::SeqCst);
        replies.store(command.id, result);
    }
    transport.disconnect();
    debug!("CommandBridge: worker exiting");
}

#[cfg(test)]
mod tests {
    use super::{CommandBridge, CommandError};
    use crate::command_transport::CommandTransport;
    use crate::daemon::ProtocolError;
    use crate::protocol::{PlaybackState, Request};
    use crate::testing::FakeDaemon;
    use std::sync::Arc;
    use std::thread;

    fn bridge_for(daemon: &FakeDaemon) -> Arc<CommandBridge> {
        let transport = CommandTransport::new("command", daemon.connector());
        Arc::new(CommandBridge::spawn(transport).expect("worker thread should start"))
    }

    #[test]
    fn test_concurrent_submits_get_their_own_replies() {
        let daemon = FakeDaemon::new();
        let bridge = bridge_for(&daemon);

        let callers: Vec<_> = (0..100)
            .map(|index| {
                let bridge = Arc::clone(&bridge);
                thread::spawn(move || {
                    let needle = format!("needle-{index}");
                    let songs = bridge.find("artist", &needle).expect("find should succeed");
                    assert_eq!(songs.len(), 1);
                    assert_eq!(songs[0].file, format!("artist/{needle}"));
                })
            })
            .collect();
        for caller in callers {
            caller.join().expect("caller thread should not panic");
        }

        assert_eq!(bridge.pending_replies(), 0);
        assert_eq!(bridge.queue_depth(), 0);
        assert_eq!(daemon.executed().len(), 100);
    }

    #[test]
    fn test_commands_execute_in_submission_order() {
        let daemon = FakeDaemon::new();
        let bridge = bridge_for(&daemon);
        daemon.hold();

        let first = {
            let bridge = Arc::clone(&bridge);
            thread::spawn(move || bridge.random(true))
        };
        daemon.wait_until(|daemon| daemon.executed().len() == 1);

        let second = {
            let bridge = Arc::clone(&bridge);
            thread::spawn(move || bridge.repeat(true))
        };
        daemon.wait_until(|_| bridge.queue_depth() == 1);

        let third = {
            let bridge = Arc::clone(&bridge);
            thread::spawn(move || bridge.crossfade(3))
        };
        daemon.wait_until(|_| bridge.queue_depth() == 2);

        daemon.release();
        for caller in [first, second, third] {
            caller
                .join()
                .expect("caller thread should not panic")
                .expect("command should succeed");
        }

        assert_eq!(
            daemon.executed(),
            vec![Request::Random(true), Request::Repeat(true), Request::Crossfade(3)]
        );
    }

    #[test]
    fn test_daemon_restart_is_invisible_to_callers() {
        let daemon = FakeDaemon::new();
        daemon.set_queue(&["a.flac", "b.flac"]);
        let bridge = bridge_for(&daemon);
        bridge.play(Some(0)).expect("play should succeed");

        daemon.restart();
        bridge.next().expect("next should succeed across the restart");

        assert_eq!(bridge.reconnect_count(), 1);
        assert_eq!(daemon.connects(), 2);
        let status = bridge.status().expect("status should succeed");
        assert_eq!(status.track_pos, Some(1));
        assert_eq!(status.state, PlaybackState::Playing);
        assert_eq!(bridge.reconnect_count(), 1);
    }

    #[test]
    fn test_server_error_reaches_only_its_caller() {
        let daemon = FakeDaemon::new();
        let bridge = bridge_for(&daemon);

        let err = bridge
            .play(Some(7))
            .expect_err("out-of-range play should be rejected");
        assert!(matches!(
            err,
            CommandError::Protocol(ProtocolError::Server { code: 2, .. })
        ));
        assert!(!err.is_connection_error());

        bridge.status().expect("next caller should be unaffected");
        assert_eq!(bridge.pending_replies(), 0);
    }

    #[test]
    fn test_already_connected_probe_is_swallowed() {
        let daemon = FakeDaemon::new();
        let bridge = bridge_for(&daemon);
        bridge.stop().expect("stop should succeed");

        daemon.answer_pings_already_connected(1);
        bridge.stop().expect("already-connected race should not surface");
        assert_eq!(bridge.reconnect_count(), 0);
    }

    #[test]
    fn test_shutdown_drains_queue_and_rejects_late_submits() {
        let daemon = FakeDaemon::new();
        let bridge = bridge_for(&daemon);
        daemon.hold();

        let first = {
            let bridge = Arc::clone(&bridge);
            thread::spawn(move || bridge.random(true))
        };
        daemon.wait_until(|daemon| daemon.executed().len() == 1);
        let second = {
            let bridge = Arc::clone(&bridge);
            thread::spawn(move || bridge.repeat(true))
        };
        daemon.wait_until(|_| bridge.queue_depth() == 1);

        let closer = {
            let bridge = Arc::clone(&bridge);
            thread::spawn(move || bridge.shutdown())
        };
        daemon.wait_until(|_| !bridge.is_accepting());

        let late = bridge.stop().expect_err("late submit should be rejected");
        assert!(matches!(late, CommandError::ShuttingDown));

        daemon.release();
        closer
            .join()
            .expect("shutdown thread should not panic")
            .expect("shutdown should succeed");
        for caller in [first, second] {
            caller
                .join()
                .expect("caller thread should not panic")
                .expect("queued command should still be answered");
        }

        assert_eq!(
            daemon.executed(),
            vec![Request::Random(true), Request::Repeat(true)]
        );
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let daemon = FakeDaemon::new();
        let bridge = bridge_for(&daemon);
        bridge.ping().expect("ping should succeed");

        bridge.shutdown().expect("first shutdown should succeed");
        bridge.shutdown().expect("second shutdown should be a no-op");
        assert!(matches!(bridge.ping(), Err(CommandError::ShuttingDown)));
    }
}
