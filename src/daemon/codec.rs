//! Framing for the daemon's text protocol.
//!
//! Requests are one line each. Replies are `key: value` lines closed by `OK`
//! or by an `ACK [code@index] {command} message` line. A `binary: <n>` pair is
//! followed by `n` raw bytes and a newline.

use std::borrow::Cow;
use std::io::{BufRead, Read, Write};
use std::time::Duration;

use super::ProtocolError;
use crate::protocol::{
    Mount, PlaybackState, Reply, Request, ServerVersion, Song, StatusSnapshot, Subsystem,
};

const GREETING_PREFIX: &str = "OK MPD ";

/// Pairs and optional binary payload of one reply.
#[derive(Debug, Default, PartialEq)]
pub struct Response {
    pub pairs: Vec<(String, String)>,
    pub binary: Option<Vec<u8>>,
}

impl Response {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }
}

fn read_raw_line<R: BufRead>(reader: &mut R) -> Result<String, ProtocolError> {
    let mut buf = Vec::new();
    let read = reader.read_until(b'\n', &mut buf)?;
    if read == 0 {
        return Err(ProtocolError::Closed);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Reads the `OK MPD x.y.z` banner sent on connect.
pub fn read_greeting<R: BufRead>(reader: &mut R) -> Result<ServerVersion, ProtocolError> {
    let line = read_raw_line(reader)?;
    let Some(version) = line.strip_prefix(GREETING_PREFIX) else {
        return Err(ProtocolError::Greeting(line));
    };
    let mut parts = version.trim().split('.').map(str::parse::<u32>);
    match (parts.next(), parts.next(), parts.next()) {
        (Some(Ok(major)), Some(Ok(minor)), patch) => Ok(ServerVersion(
            major,
            minor,
            patch.and_then(Result::ok).unwrap_or(0),
        )),
        _ => Err(ProtocolError::Greeting(line)),
    }
}

/// Quotes an argument when the daemon would otherwise split or misread it.
pub fn quote_argument(argument: &str) -> Cow<'_, str> {
    let needs_quotes = argument.is_empty()
        || argument
            .chars()
            .any(|c| c.is_whitespace() || c == '"' || c == '\\' || c == '\'');
    if !needs_quotes {
        return Cow::Borrowed(argument);
    }
    let mut quoted = String::with_capacity(argument.len() + 2);
    quoted.push('"');
    for c in argument.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    Cow::Owned(quoted)
}

/// Builds a request line including the trailing newline.
pub fn encode_command(name: &str, arguments: &[String]) -> String {
    let mut line = String::from(name);
    for argument in arguments {
        line.push(' ');
        line.push_str(&quote_argument(argument));
    }
    line.push('\n');
    line
}

pub fn write_command<W: Write>(
    writer: &mut W,
    name: &str,
    arguments: &[String],
) -> Result<(), ProtocolError> {
    writer.write_all(encode_command(name, arguments).as_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Parses `ACK [code@index] {command} message`.
pub fn parse_ack(line: &str) -> ProtocolError {
    let malformed = || ProtocolError::Malformed(line.to_string());
    let Some(rest) = line.strip_prefix("ACK [") else {
        return malformed();
    };
    let Some((location, rest)) = rest.split_once(']') else {
        return malformed();
    };
    let Some((code, index)) = location.split_once('@') else {
        return malformed();
    };
    let (Ok(code), Ok(index)) = (code.parse::<u32>(), index.parse::<u32>()) else {
        return malformed();
    };
    let rest = rest.trim_start();
    let (command, message) = match rest.strip_prefix('{').and_then(|r| r.split_once('}')) {
        Some((command, message)) => (command.to_string(), message.trim().to_string()),
        None => (String::new(), rest.to_string()),
    };
    ProtocolError::Server {
        code,
        index,
        command,
        message,
    }
}

/// Largest `binary` payload accepted in one reply. Daemons send pictures in
/// chunks far below this.
pub const MAX_BINARY_CHUNK: usize = 16 * 1024 * 1024;

/// Reads one complete reply up to its `OK` / `ACK` terminator.
pub fn read_response<R: BufRead>(reader: &mut R) -> Result<Response, ProtocolError> {
    let mut response = Response::default();
    loop {
        let line = read_raw_line(reader)?;
        if line == "OK" {
            return Ok(response);
        }
        if line.starts_with("ACK ") {
            return Err(parse_ack(&line));
        }
        let Some((key, value)) = line.split_once(": ") else {
            return Err(ProtocolError::Malformed(line));
        };
        if key == "binary" {
            let length: usize = value
                .parse()
                .map_err(|_| ProtocolError::Malformed(line.clone()))?;
            if length > MAX_BINARY_CHUNK {
                return Err(ProtocolError::Malformed(format!(
                    "binary chunk of {length} bytes exceeds {MAX_BINARY_CHUNK}"
                )));
            }
            let mut payload = vec![0u8; length];
            reader.read_exact(&mut payload)?;
            let mut newline = [0u8; 1];
            reader.read_exact(&mut newline)?;
            if newline[0] != b'\n' {
                return Err(ProtocolError::Malformed(
                    "binary payload not followed by newline".to_string(),
                ));
            }
            response.binary = Some(payload);
            continue;
        }
        response.pairs.push((key.to_string(), value.to_string()));
    }
}

fn parse_seconds(value: &str) -> Option<Duration> {
    value
        .parse::<f64>()
        .ok()
        .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
        .map(Duration::from_secs_f64)
}

fn parse_flag(response: &Response, key: &str) -> bool {
    response.get(key).is_some_and(|value| value == "1")
}

pub fn decode_status(response: &Response) -> Result<StatusSnapshot, ProtocolError> {
    let state = response
        .get("state")
        .and_then(PlaybackState::from_protocol)
        .ok_or_else(|| ProtocolError::Malformed("status without a valid state".to_string()))?;

    // Older daemons only report `time: elapsed:total` in whole seconds.
    let legacy_time = response.get("time").and_then(|value| {
        let (elapsed, total) = value.split_once(':')?;
        Some((parse_seconds(elapsed), parse_seconds(total)))
    });

    Ok(StatusSnapshot {
        state,
        shuffle: parse_flag(response, "random"),
        repeat: parse_flag(response, "repeat"),
        crossfade_seconds: response
            .get("xfade")
            .and_then(|value| value.parse().ok())
            .unwrap_or(0),
        track_id: response.get("songid").and_then(|value| value.parse().ok()),
        track_pos: response.get("song").and_then(|value| value.parse().ok()),
        elapsed: response
            .get("elapsed")
            .and_then(parse_seconds)
            .or_else(|| legacy_time.and_then(|(elapsed, _)| elapsed)),
        duration: response
            .get("duration")
            .and_then(parse_seconds)
            .or_else(|| legacy_time.and_then(|(_, total)| total)),
        queue_length: response
            .get("playlistlength")
            .and_then(|value| value.parse().ok())
            .unwrap_or(0),
    })
}

fn apply_song_pair(song: &mut Song, key: &str, value: &str) {
    match key.to_ascii_lowercase().as_str() {
        "id" => song.id = value.parse().ok(),
        "pos" => song.pos = value.parse().ok(),
        "title" => song.title = Some(value.to_string()),
        "artist" => song.artist = Some(value.to_string()),
        "album" => song.album = Some(value.to_string()),
        "duration" => song.duration = parse_seconds(value),
        "time" => {
            if song.duration.is_none() {
                song.duration = parse_seconds(value);
            }
        }
        "prio" => song.priority = value.parse().unwrap_or(0),
        _ => {}
    }
}

/// Splits a song listing into records; each record starts at a `file` key.
pub fn decode_songs(response: &Response) -> Vec<Song> {
    let mut songs = Vec::new();
    let mut current: Option<Song> = None;
    for (key, value) in &response.pairs {
        if key == "file" {
            if let Some(song) = current.take() {
                songs.push(song);
            }
            current = Some(Song {
                file: value.clone(),
                ..Song::default()
            });
            continue;
        }
        if let Some(song) = current.as_mut() {
            apply_song_pair(song, key, value);
        }
    }
    songs.extend(current);
    songs
}

pub fn decode_mounts(response: &Response) -> Vec<Mount> {
    let mut mounts = Vec::new();
    let mut current: Option<Mount> = None;
    for (key, value) in &response.pairs {
        match key.as_str() {
            "mount" => {
                mounts.extend(current.take());
                current = Some(Mount {
                    mount: value.clone(),
                    storage: String::new(),
                });
            }
            "storage" => {
                if let Some(mount) = current.as_mut() {
                    mount.storage = value.clone();
                }
            }
            _ => {}
        }
    }
    mounts.extend(current);
    mounts
}

pub fn decode_subsystems(response: &Response) -> Vec<Subsystem> {
    response
        .pairs
        .iter()
        .filter(|(key, _)| key == "changed")
        .map(|(_, value)| Subsystem::from_protocol(value))
        .collect()
}

/// Maps a reply onto the shape `request` expects. `readpicture` is assembled
/// chunk by chunk by the connection and never reaches this function.
pub fn decode_reply(request: &Request, response: &Response) -> Result<Reply, ProtocolError> {
    match request {
        Request::Status => decode_status(response).map(Reply::Status),
        Request::CurrentSong => Ok(Reply::Song(decode_songs(response).into_iter().next())),
        Request::PlaylistInfo | Request::PlaylistFind { .. } | Request::Find { .. } => {
            Ok(Reply::Songs(decode_songs(response)))
        }
        Request::ListMounts => Ok(Reply::Mounts(decode_mounts(response))),
        Request::Idle(_) => Ok(Reply::Subsystems(decode_subsystems(response))),
        Request::Update => response
            .get("updating_db")
            .and_then(|value| value.parse().ok())
            .map(Reply::UpdateJob)
            .ok_or_else(|| ProtocolError::Malformed("update without job id".to_string())),
        Request::ReadPicture(_) => Err(ProtocolError::Malformed(
            "readpicture must be read in chunks".to_string(),
        )),
        _ => Ok(Reply::Ok),
    }
}
