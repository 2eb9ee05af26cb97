//! Message and value types shared by the daemon client, the command bridge and
//! the change detector.
//!
//! `Request` is the closed set of daemon operations the controller issues and
//! `Reply` the matching set of decoded results. `ChangeEvent` is what the
//! detector publishes to consumers.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon transport state as reported by `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    Playing,
    Paused,
    #[default]
    Stopped,
}

impl PlaybackState {
    /// Parses the protocol spelling (`play`, `pause`, `stop`).
    pub fn from_protocol(value: &str) -> Option<Self> {
        match value {
            "play" => Some(Self::Playing),
            "pause" => Some(Self::Paused),
            "stop" => Some(Self::Stopped),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last-known daemon status. Replaced wholesale on every successful query.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StatusSnapshot {
    pub state: PlaybackState,
    pub shuffle: bool,
    pub repeat: bool,
    pub crossfade_seconds: u32,
    /// Queue id of the current song, `None` when nothing is selected.
    pub track_id: Option<u32>,
    /// Queue position of the current song.
    pub track_pos: Option<u32>,
    pub elapsed: Option<Duration>,
    pub duration: Option<Duration>,
    pub queue_length: u32,
}

/// High-level notification published by the change detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
    TrackChanged,
    PlaybackStateChanged(PlaybackState),
    ShuffleChanged(bool),
    LoopChanged(bool),
    CrossfadeChanged(bool),
    /// The controller completed its shutdown barrier.
    Finished,
}

/// Daemon subsystem names returned by `idle`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subsystem {
    Player,
    Options,
    Playlist,
    Mixer,
    Database,
    Update,
    Other(String),
}

impl Subsystem {
    pub fn from_protocol(value: &str) -> Self {
        match value {
            "player" => Self::Player,
            "options" => Self::Options,
            "playlist" => Self::Playlist,
            "mixer" => Self::Mixer,
            "database" => Self::Database,
            "update" => Self::Update,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Player => "player",
            Self::Options => "options",
            Self::Playlist => "playlist",
            Self::Mixer => "mixer",
            Self::Database => "database",
            Self::Update => "update",
            Self::Other(name) => name.as_str(),
        }
    }
}

/// Queue or database entry.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Song {
    /// URI relative to the daemon's music directory.
    pub file: String,
    pub id: Option<u32>,
    pub pos: Option<u32>,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub duration: Option<Duration>,
    pub priority: u8,
}

/// Storage mounted into the daemon's virtual music tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// Mount point inside the music tree; empty for the root.
    pub mount: String,
    pub storage: String,
}

impl Mount {
    /// Local filesystem path of the storage, when it is one.
    pub fn storage_path(&self) -> Option<PathBuf> {
        let storage = self.storage.strip_prefix("file://").unwrap_or(&self.storage);
        if storage.contains("://") {
            return None;
        }
        Some(PathBuf::from(storage))
    }
}

/// Embedded cover art returned by `readpicture`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Picture {
    pub mime_type: Option<String>,
    pub data: Vec<u8>,
}

/// Daemon protocol version from the connection greeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerVersion(pub u32, pub u32, pub u32);

/// Feature switches a player backend supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub repeat: bool,
    pub shuffle: bool,
    pub crossfade: bool,
}

/// Closed set of daemon operations.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Ping,
    Update,
    Clear,
    Consume(bool),
    Random(bool),
    Repeat(bool),
    Crossfade(u32),
    Add(String),
    Play(Option<u32>),
    PlayId(u32),
    Pause(bool),
    Stop,
    Next,
    Previous,
    SeekCur(Duration),
    Status,
    CurrentSong,
    PlaylistInfo,
    PlaylistFind { tag: String, needle: String },
    Find { tag: String, needle: String },
    ListMounts,
    ReadPicture(String),
    PrioId { priority: u8, id: u32 },
    Idle(Vec<Subsystem>),
}

impl Request {
    /// Protocol command name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Update => "update",
            Self::Clear => "clear",
            Self::Consume(_) => "consume",
            Self::Random(_) => "random",
            Self::Repeat(_) => "repeat",
            Self::Crossfade(_) => "crossfade",
            Self::Add(_) => "add",
            Self::Play(_) => "play",
            Self::PlayId(_) => "playid",
            Self::Pause(_) => "pause",
            Self::Stop => "stop",
            Self::Next => "next",
            Self::Previous => "previous",
            Self::SeekCur(_) => "seekcur",
            Self::Status => "status",
            Self::CurrentSong => "currentsong",
            Self::PlaylistInfo => "playlistinfo",
            Self::PlaylistFind { .. } => "playlistfind",
            Self::Find { .. } => "find",
            Self::ListMounts => "listmounts",
            Self::ReadPicture(_) => "readpicture",
            Self::PrioId { .. } => "prioid",
            Self::Idle(_) => "idle",
        }
    }

    /// Positional protocol arguments, unquoted.
    pub fn arguments(&self) -> Vec<String> {
        fn flag(value: bool) -> String {
            if value { "1" } else { "0" }.to_string()
        }
        match self {
            Self::Consume(value) | Self::Random(value) | Self::Repeat(value) | Self::Pause(value) => {
                vec![flag(*value)]
            }
            Self::Crossfade(seconds) => vec![seconds.to_string()],
            Self::Add(uri) => vec![uri.clone()],
            Self::Play(Some(pos)) => vec![pos.to_string()],
            Self::PlayId(id) => vec![id.to_string()],
            Self::SeekCur(position) => vec![format!("{:.3}", position.as_secs_f64())],
            Self::PlaylistFind { tag, needle } | Self::Find { tag, needle } => {
                vec![tag.clone(), needle.clone()]
            }
            Self::PrioId { priority, id } => vec![priority.to_string(), id.to_string()],
            Self::Idle(subsystems) => subsystems
                .iter()
                .map(|subsystem| subsystem.as_str().to_string())
                .collect(),
            // readpicture carries a chunk offset managed by the connection.
            Self::ReadPicture(uri) => vec![uri.clone()],
            Self::Ping
            | Self::Update
            | Self::Clear
            | Self::Play(None)
            | Self::Stop
            | Self::Next
            | Self::Previous
            | Self::Status
            | Self::CurrentSong
            | Self::PlaylistInfo
            | Self::ListMounts => Vec::new(),
        }
    }
}

/// Decoded daemon result, one variant per reply shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok,
    UpdateJob(u32),
    Status(StatusSnapshot),
    Song(Option<Song>),
    Songs(Vec<Song>),
    Mounts(Vec<Mount>),
    Picture(Option<Picture>),
    Subsystems(Vec<Subsystem>),
}

impl Reply {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::UpdateJob(_) => "update job",
            Self::Status(_) => "status",
            Self::Song(_) => "song",
            Self::Songs(_) => "song list",
            Self::Mounts(_) => "mount list",
            Self::Picture(_) => "picture",
            Self::Subsystems(_) => "subsystem list",
        }
    }
}
