//! In-memory daemon used by unit tests.
//!
//! `FakeDaemon` is a `Connector`; every connection it hands out shares one
//! state table. Mutating requests queue idle notifications the way the real
//! daemon does, and tests can script extra idle results, inject failures,
//! simulate restarts, or hold execution to observe queueing.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::broadcast::{self, error::TryRecvError};

use crate::daemon::{Connection, Connector, ProtocolError};
use crate::protocol::{
    ChangeEvent, Mount, PlaybackState, Picture, Reply, Request, Song, StatusSnapshot, Subsystem,
};

/// Next published event, failing the test after a generous deadline.
pub fn next_event(receiver: &mut broadcast::Receiver<ChangeEvent>) -> ChangeEvent {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match receiver.try_recv() {
            Ok(event) => return event,
            Err(TryRecvError::Empty) => {
                assert!(Instant::now() < deadline, "no change event arrived");
                std::thread::sleep(Duration::from_millis(2));
            }
            Err(err) => panic!("event channel failed: {err}"),
        }
    }
}

/// Skips events until `expected` arrives.
pub fn wait_for_event(receiver: &mut broadcast::Receiver<ChangeEvent>, expected: ChangeEvent) {
    while next_event(receiver) != expected {}
}

/// Scripted result for one `idle` call.
#[derive(Debug, Clone)]
pub enum IdleStep {
    Changed(Vec<Subsystem>),
    ConnectionLost,
    ServerError,
}

#[derive(Default)]
struct FakeState {
    status: StatusSnapshot,
    queue: Vec<Song>,
    mounts: Vec<Mount>,
    pictures: HashMap<String, Picture>,
    next_song_id: u32,
    executed: Vec<Request>,
    connects: usize,
    generation: u64,
    refuse_connects: usize,
    fail_next_executes: usize,
    already_connected_pings: usize,
    held: bool,
    idle_script: VecDeque<IdleStep>,
    pending_changes: Vec<Subsystem>,
    auto_notify: bool,
}

struct Shared {
    state: Mutex<FakeState>,
    changed: Condvar,
}

#[derive(Clone)]
pub struct FakeDaemon {
    shared: Arc<Shared>,
}

fn broken_pipe() -> ProtocolError {
    ProtocolError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "fake daemon went away",
    ))
}

impl FakeDaemon {
    pub fn new() -> Self {
        let state = FakeState {
            next_song_id: 1,
            auto_notify: true,
            mounts: vec![Mount {
                mount: String::new(),
                storage: "/music".to_string(),
            }],
            ..FakeState::default()
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                changed: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    pub fn set_status(&self, status: StatusSnapshot) {
        self.lock().status = status;
    }

    pub fn status(&self) -> StatusSnapshot {
        self.lock().status.clone()
    }

    pub fn set_queue(&self, files: &[&str]) {
        let mut state = self.lock();
        state.queue.clear();
        for file in files {
            let id = state.next_song_id;
            state.next_song_id += 1;
            let pos = state.queue.len() as u32;
            state.queue.push(Song {
                file: (*file).to_string(),
                id: Some(id),
                pos: Some(pos),
                ..Song::default()
            });
        }
        state.status.queue_length = state.queue.len() as u32;
    }

    pub fn queue(&self) -> Vec<Song> {
        self.lock().queue.clone()
    }

    pub fn set_picture(&self, file: &str, picture: Picture) {
        self.lock().pictures.insert(file.to_string(), picture);
    }

    pub fn set_auto_notify(&self, enabled: bool) {
        self.lock().auto_notify = enabled;
    }

    /// Requests executed so far (pings excluded), in execution order.
    pub fn executed(&self) -> Vec<Request> {
        self.lock().executed.clone()
    }

    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    pub fn push_idle(&self, step: IdleStep) {
        self.lock().idle_script.push_back(step);
        self.shared.changed.notify_all();
    }

    /// Kills every open connection, as a daemon restart would.
    pub fn restart(&self) {
        self.lock().generation += 1;
        self.shared.changed.notify_all();
    }

    pub fn refuse_next_connects(&self, count: usize) {
        self.lock().refuse_connects = count;
    }

    pub fn fail_next_executes(&self, count: usize) {
        self.lock().fail_next_executes = count;
    }

    pub fn answer_pings_already_connected(&self, count: usize) {
        self.lock().already_connected_pings = count;
    }

    /// Makes every non-idle request block until `release`.
    pub fn hold(&self) {
        self.lock().held = true;
    }

    pub fn release(&self) {
        self.lock().held = false;
        self.shared.changed.notify_all();
    }

    /// Blocks the test until `predicate` holds, failing after a generous
    /// deadline instead of hanging the suite.
    pub fn wait_until<F>(&self, mut predicate: F)
    where
        F: FnMut(&FakeDaemon) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !predicate(self) {
            assert!(
                Instant::now() < deadline,
                "fake daemon condition not reached in time"
            );
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn notify(state: &mut FakeState, subsystem: Subsystem) {
        if state.auto_notify && !state.pending_changes.contains(&subsystem) {
            state.pending_changes.push(subsystem);
        }
    }

    fn select(state: &mut FakeState, index: usize) {
        let Some(song) = state.queue.get(index) else {
            return;
        };
        state.status.track_id = song.id;
        state.status.track_pos = song.pos;
        state.status.state = PlaybackState::Playing;
        state.status.elapsed = Some(Duration::ZERO);
        Self::notify(state, Subsystem::Player);
    }

    fn current_index(state: &FakeState) -> Option<usize> {
        let id = state.status.track_id?;
        state.queue.iter().position(|song| song.id == Some(id))
    }

    fn renumber(state: &mut FakeState) {
        for (pos, song) in state.queue.iter_mut().enumerate() {
            song.pos = Some(pos as u32);
        }
        state.status.queue_length = state.queue.len() as u32;
    }

    fn bad_index(command: &str) -> ProtocolError {
        ProtocolError::Server {
            code: 2,
            index: 0,
            command: command.to_string(),
            message: "Bad song index".to_string(),
        }
    }

    fn apply(state: &mut FakeState, request: &Request) -> Result<Reply, ProtocolError> {
        match request {
            Request::Ping => Ok(Reply::Ok),
            Request::Update => Ok(Reply::UpdateJob(1)),
            Request::Clear => {
                state.queue.clear();
                state.status.track_id = None;
                state.status.track_pos = None;
                state.status.state = PlaybackState::Stopped;
                Self::renumber(state);
                Self::notify(state, Subsystem::Playlist);
                Self::notify(state, Subsystem::Player);
                Ok(Reply::Ok)
            }
            Request::Consume(_) => {
                Self::notify(state, Subsystem::Options);
                Ok(Reply::Ok)
            }
            Request::Random(value) => {
                state.status.shuffle = *value;
                Self::notify(state, Subsystem::Options);
                Ok(Reply::Ok)
            }
            Request::Repeat(value) => {
                state.status.repeat = *value;
                Self::notify(state, Subsystem::Options);
                Ok(Reply::Ok)
            }
            Request::Crossfade(seconds) => {
                state.status.crossfade_seconds = *seconds;
                Self::notify(state, Subsystem::Options);
                Ok(Reply::Ok)
            }
            Request::Add(uri) => {
                let id = state.next_song_id;
                state.next_song_id += 1;
                let file = if uri.is_empty() {
                    "root/track.flac".to_string()
                } else {
                    uri.clone()
                };
                state.queue.push(Song {
                    file,
                    id: Some(id),
                    ..Song::default()
                });
                Self::renumber(state);
                Self::notify(state, Subsystem::Playlist);
                Ok(Reply::Ok)
            }
            Request::Play(Some(pos)) => {
                if *pos as usize >= state.queue.len() {
                    return Err(Self::bad_index("play"));
                }
                Self::select(state, *pos as usize);
                Ok(Reply::Ok)
            }
            Request::Play(None) => {
                if state.status.track_id.is_none() {
                    Self::select(state, 0);
                } else {
                    state.status.state = PlaybackState::Playing;
                    Self::notify(state, Subsystem::Player);
                }
                Ok(Reply::Ok)
            }
            Request::PlayId(id) => {
                let Some(index) = state.queue.iter().position(|song| song.id == Some(*id)) else {
                    return Err(Self::bad_index("playid"));
                };
                Self::select(state, index);
                Ok(Reply::Ok)
            }
            Request::Pause(paused) => {
                if state.status.state != PlaybackState::Stopped {
                    state.status.state = if *paused {
                        PlaybackState::Paused
                    } else {
                        PlaybackState::Playing
                    };
                    Self::notify(state, Subsystem::Player);
                }
                Ok(Reply::Ok)
            }
            Request::Stop => {
                state.status.state = PlaybackState::Stopped;
                Self::notify(state, Subsystem::Player);
                Ok(Reply::Ok)
            }
            Request::Next | Request::Previous => {
                let current = Self::current_index(state).unwrap_or(0);
                let target = if matches!(request, Request::Next) {
                    current + 1
                } else {
                    current.saturating_sub(1)
                };
                if target < state.queue.len() {
                    Self::select(state, target);
                } else {
                    state.status.track_id = None;
                    state.status.track_pos = None;
                    state.status.state = PlaybackState::Stopped;
                    Self::notify(state, Subsystem::Player);
                }
                Ok(Reply::Ok)
            }
            Request::SeekCur(position) => {
                state.status.elapsed = Some(*position);
                Self::notify(state, Subsystem::Player);
                Ok(Reply::Ok)
            }
            Request::Status => Ok(Reply::Status(state.status.clone())),
            Request::CurrentSong => {
                let song = Self::current_index(state).map(|index| state.queue[index].clone());
                Ok(Reply::Song(song))
            }
            Request::PlaylistInfo => Ok(Reply::Songs(state.queue.clone())),
            Request::PlaylistFind { tag, needle } => {
                let songs = state
                    .queue
                    .iter()
                    .filter(|song| tag == "file" && &song.file == needle)
                    .cloned()
                    .collect();
                Ok(Reply::Songs(songs))
            }
            // Echoes the needle back so concurrent callers get distinguishable replies.
            Request::Find { tag, needle } => Ok(Reply::Songs(vec![Song {
                file: format!("{tag}/{needle}"),
                ..Song::default()
            }])),
            Request::ListMounts => Ok(Reply::Mounts(state.mounts.clone())),
            Request::ReadPicture(uri) => Ok(Reply::Picture(state.pictures.get(uri).cloned())),
            Request::PrioId { priority, id } => {
                let Some(song) = state.queue.iter_mut().find(|song| song.id == Some(*id)) else {
                    return Err(Self::bad_index("prioid"));
                };
                song.priority = *priority;
                Self::notify(state, Subsystem::Playlist);
                Ok(Reply::Ok)
            }
            Request::Idle(_) => Err(ProtocolError::Malformed(
                "idle is handled by the connection".to_string(),
            )),
        }
    }
}

impl Connector for FakeDaemon {
    fn connect(&self) -> Result<Box<dyn Connection>, ProtocolError> {
        let mut state = self.lock();
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "fake daemon refused the connection",
            )));
        }
        state.connects += 1;
        Ok(Box::new(FakeConnection {
            daemon: self.clone(),
            generation: state.generation,
            closed: false,
        }))
    }

    fn describe(&self) -> String {
        "fake daemon".to_string()
    }
}

struct FakeConnection {
    daemon: FakeDaemon,
    generation: u64,
    closed: bool,
}

impl FakeConnection {
    fn check_alive(&self, state: &FakeState) -> Result<(), ProtocolError> {
        if self.closed {
            return Err(ProtocolError::NotConnected);
        }
        if state.generation != self.generation {
            return Err(broken_pipe());
        }
        Ok(())
    }

    fn idle(&mut self) -> Result<Reply, ProtocolError> {
        let shared = Arc::clone(&self.daemon.shared);
        let mut state = self.daemon.lock();
        loop {
            self.check_alive(&state)?;
            if let Some(step) = state.idle_script.pop_front() {
                return match step {
                    IdleStep::Changed(subsystems) => Ok(Reply::Subsystems(subsystems)),
                    IdleStep::ConnectionLost => {
                        self.closed = true;
                        Err(broken_pipe())
                    }
                    IdleStep::ServerError => Err(ProtocolError::Server {
                        code: 5,
                        index: 0,
                        command: "idle".to_string(),
                        message: "unknown command".to_string(),
                    }),
                };
            }
            if !state.pending_changes.is_empty() {
                return Ok(Reply::Subsystems(std::mem::take(&mut state.pending_changes)));
            }
            state = shared
                .changed
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}

impl Connection for FakeConnection {
    fn ping(&mut self) -> Result<(), ProtocolError> {
        let mut state = self.daemon.lock();
        self.check_alive(&state)?;
        if state.already_connected_pings > 0 {
            state.already_connected_pings -= 1;
            return Err(ProtocolError::AlreadyConnected);
        }
        Ok(())
    }

    fn execute(&mut self, request: &Request) -> Result<Reply, ProtocolError> {
        if let Request::Idle(_) = request {
            return self.idle();
        }
        let shared = Arc::clone(&self.daemon.shared);
        let mut state = self.daemon.lock();
        self.check_alive(&state)?;
        state.executed.push(request.clone());
        while state.held {
            state = shared
                .changed
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        self.check_alive(&state)?;
        if state.fail_next_executes > 0 {
            state.fail_next_executes -= 1;
            self.closed = true;
            return Err(broken_pipe());
        }
        let result = FakeDaemon::apply(&mut state, request);
        drop(state);
        shared.changed.notify_all();
        result
    }

    fn close(&mut self) -> Result<(), ProtocolError> {
        if self.closed {
            return Err(broken_pipe());
        }
        self.closed = true;
        Ok(())
    }
}
