//! Persistent controller configuration model, defaults and loading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;
use thiserror::Error;

/// Root configuration persisted to `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    #[serde(default)]
    /// Where and how to reach the playback daemon.
    pub daemon: DaemonConfig,
    #[serde(default)]
    /// Playback options applied when a source is started.
    pub playback: PlaybackConfig,
    #[serde(default)]
    /// Change detector tuning.
    pub detector: DetectorConfig,
    #[serde(default)]
    /// Cover art cache.
    pub artwork: ArtworkConfig,
}

/// Daemon endpoint and socket timeouts.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct DaemonConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Unix socket path; takes precedence over host/port when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<String>,
    /// Read/write timeout of the command connection.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Read timeout of the idle connection. Also bounds how long shutdown can
    /// wait for the detector when the daemon is unreachable.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct PlaybackConfig {
    /// File, directory or music root to play on startup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default)]
    pub shuffle: bool,
    #[serde(default, rename = "loop")]
    pub repeat: bool,
    /// Crossfade length used when crossfade is switched on.
    #[serde(default = "default_crossfade_seconds")]
    pub crossfade_seconds: u32,
    /// Whether crossfade is on when a source is started.
    #[serde(default)]
    pub crossfade: bool,
    #[serde(default)]
    pub quit_after_current: bool,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct DetectorConfig {
    /// Constant pause between reconnect attempts of the idle connection.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ArtworkConfig {
    /// Defaults to the user cache directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<String>,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            socket_path: None,
            timeout_secs: default_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            source: None,
            shuffle: false,
            repeat: false,
            crossfade_seconds: default_crossfade_seconds(),
            crossfade: false,
            quit_after_current: false,
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Default for ArtworkConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            max_entries: default_max_entries(),
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    6600
}

fn default_timeout_secs() -> u64 {
    5
}

fn default_idle_timeout_secs() -> u64 {
    30
}

fn default_crossfade_seconds() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    250
}

fn default_max_entries() -> usize {
    1
}

impl DaemonConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl DetectorConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no user config directory available")]
    NoConfigDir,
    #[error("config i/o failed for {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to serialize default config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Clamps values into ranges the controller can work with.
pub fn sanitize_config(config: Config) -> Config {
    let timeout_secs = config.daemon.timeout_secs.clamp(1, 300);
    let idle_timeout_secs = config.daemon.idle_timeout_secs.clamp(timeout_secs, 3_600);
    let host = if config.daemon.host.trim().is_empty() {
        default_host()
    } else {
        config.daemon.host.trim().to_string()
    };
    let socket_path = config
        .daemon
        .socket_path
        .filter(|path| !path.trim().is_empty());
    let source = config
        .playback
        .source
        .filter(|source| !source.trim().is_empty());

    Config {
        daemon: DaemonConfig {
            host,
            port: if config.daemon.port == 0 {
                default_port()
            } else {
                config.daemon.port
            },
            socket_path,
            timeout_secs,
            idle_timeout_secs,
        },
        playback: PlaybackConfig {
            source,
            crossfade_seconds: config.playback.crossfade_seconds.clamp(1, 30),
            ..config.playback
        },
        detector: DetectorConfig {
            retry_delay_ms: config.detector.retry_delay_ms.clamp(10, 60_000),
        },
        artwork: ArtworkConfig {
            cache_dir: config.artwork.cache_dir,
            max_entries: config.artwork.max_entries.clamp(1, 1_000),
        },
    }
}

pub fn system_config_template_text() -> &'static str {
    include_str!("../config/config.system.toml")
}

/// `<user config dir>/playctl/config.toml`.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let config_root = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
    Ok(config_root.join("playctl").join("config.toml"))
}

/// Reads the config at `path`, writing the defaults there first when the
/// file does not exist yet.
pub fn load_or_create(path: &Path) -> Result<Config, ConfigError> {
    let io_error = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };
    if !path.exists() {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }
        info!(
            "Config file not found. Creating default config. path={}",
            path.display()
        );
        let default_config = sanitize_config(Config::default());
        std::fs::write(path, toml::to_string(&default_config)?).map_err(io_error)?;
    }

    let config_content = std::fs::read_to_string(path).map_err(io_error)?;
    let config = toml::from_str::<Config>(&config_content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(sanitize_config(config))
}
