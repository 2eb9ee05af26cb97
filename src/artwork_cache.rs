//! On-disk cache of daemon-provided cover art, keyed by queue track id.
//!
//! Track ids are reused after a daemon restart or a queue clear, so each entry
//! also remembers the song URI it was fetched for.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::protocol::Picture;

pub struct ArtworkCache {
    dir: PathBuf,
    max_entries: usize,
    /// Cached files, oldest first.
    entries: VecDeque<CachedArtwork>,
}

struct CachedArtwork {
    track_id: u32,
    uri: String,
    path: PathBuf,
}

impl ArtworkCache {
    /// `max_entries` below one is treated as one.
    pub fn new(dir: impl Into<PathBuf>, max_entries: usize) -> Self {
        Self {
            dir: dir.into(),
            max_entries: max_entries.max(1),
            entries: VecDeque::new(),
        }
    }

    /// Default location under the user's cache directory.
    pub fn default_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("playctl")
            .join("artwork")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cached_path(&self, track_id: u32, uri: &str) -> Option<&Path> {
        self.entries
            .iter()
            .find(|entry| entry.track_id == track_id && entry.uri == uri)
            .map(|entry| entry.path.as_path())
    }

    /// Returns the cached art for `track_id` playing `uri`, calling `fetch`
    /// on a miss. A fetch that yields no picture caches nothing.
    pub fn get_or_fetch<F, E>(
        &mut self,
        track_id: u32,
        uri: &str,
        fetch: F,
    ) -> Result<Option<PathBuf>, E>
    where
        F: FnOnce() -> Result<Option<Picture>, E>,
        E: From<io::Error>,
    {
        if let Some(path) = self.cached_path(track_id, uri) {
            if path.exists() {
                return Ok(Some(path.to_path_buf()));
            }
        }
        self.forget(track_id);

        let Some(picture) = fetch()? else {
            debug!("ArtworkCache: no artwork for track {}", track_id);
            return Ok(None);
        };
        if picture.data.is_empty() {
            return Ok(None);
        }

        fs::create_dir_all(&self.dir)?;
        let extension = picture
            .mime_type
            .as_deref()
            .and_then(extension_for_mime)
            .or_else(|| detect_image_extension(&picture.data))
            .unwrap_or("bin");
        let path = self.dir.join(format!("{track_id}.{extension}"));
        fs::write(&path, &picture.data)?;
        debug!("ArtworkCache: wrote {}", path.display());

        self.entries.push_back(CachedArtwork {
            track_id,
            uri: uri.to_string(),
            path: path.clone(),
        });
        self.evict();
        Ok(Some(path))
    }

    /// Drops a stale entry for `track_id`, if any, along with its file.
    fn forget(&mut self, track_id: u32) {
        let Some(index) = self
            .entries
            .iter()
            .position(|entry| entry.track_id == track_id)
        else {
            return;
        };
        if let Some(entry) = self.entries.remove(index) {
            debug!(
                "ArtworkCache: dropping art of track {} ({})",
                track_id, entry.uri
            );
            remove_file(&entry.path);
        }
    }

    fn evict(&mut self) {
        while self.entries.len() > self.max_entries {
            let Some(entry) = self.entries.pop_front() else {
                break;
            };
            remove_file(&entry.path);
        }
    }

    /// Deletes every cached file.
    pub fn clear(&mut self) {
        while let Some(entry) = self.entries.pop_front() {
            let _ = fs::remove_file(entry.path);
        }
    }
}

fn remove_file(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != io::ErrorKind::NotFound {
            warn!("ArtworkCache: failed to remove {}: {}", path.display(), err);
        }
    }
}

fn extension_for_mime(mime_type: &str) -> Option<&'static str> {
    match mime_type.trim().to_ascii_lowercase().as_str() {
        "image/png" => Some("png"),
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        "image/bmp" => Some("bmp"),
        _ => None,
    }
}

fn detect_image_extension(bytes: &[u8]) -> Option<&'static str> {
    if bytes.len() >= 8 && bytes[0..8] == [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A] {
        return Some("png");
    }
    if bytes.len() >= 3 && bytes[0] == 0xFF && bytes[1] == 0xD8 && bytes[2] == 0xFF {
        return Some("jpg");
    }
    if bytes.len() >= 6 && (&bytes[0..6] == b"GIF87a" || &bytes[0..6] == b"GIF89a") {
        return Some("gif");
    }
    if bytes.len() >= 12 && bytes[0..4] == *b"RIFF" && bytes[8..12] == *b"WEBP" {
        return Some("webp");
    }
    None
}
