//! Settings management
//!
//! Stores engine preferences in ~/.config/zipaccess/settings.json

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::backend::BackendKind;

/// Default copy buffer: 8 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Default grace period for `abort()`.
pub const DEFAULT_ABORT_WAIT_MS: u64 = 100;

/// Default deflate level for archives written by the zip-crate backends.
pub const DEFAULT_COMPRESSION_LEVEL: i64 = 5;

/// User settings for the archive engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Copy buffer size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// How long `abort()` waits for the running operation to leave its copy loop
    #[serde(default = "default_abort_wait_ms")]
    pub abort_wait_ms: u64,

    /// Deflate level 0-9 (None = codec default)
    #[serde(default = "default_compression_level")]
    pub compression_level: Option<i64>,

    /// Explicit 7-Zip binary (None = search next to the executable, then PATH)
    #[serde(default)]
    pub sevenzip_path: Option<PathBuf>,

    /// Backend used when none is requested explicitly
    #[serde(default)]
    pub backend: BackendKind,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_abort_wait_ms() -> u64 {
    DEFAULT_ABORT_WAIT_MS
}

fn default_compression_level() -> Option<i64> {
    Some(DEFAULT_COMPRESSION_LEVEL)
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            abort_wait_ms: DEFAULT_ABORT_WAIT_MS,
            compression_level: default_compression_level(),
            sevenzip_path: None,
            backend: BackendKind::default(),
        }
    }
}

impl Settings {
    /// Get the config directory path (~/.config/zipaccess)
    fn config_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|dir| dir.join("zipaccess"))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Get the settings file path
    pub fn settings_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()?.join("settings.json"))
    }

    /// Load settings from disk, or return defaults if not found
    pub fn load() -> Self {
        let loaded = Self::settings_path().and_then(|path| Self::load_from(&path));
        match loaded {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Could not load settings: {}. Using defaults.", e);
                Self::default()
            }
        }
    }

    /// Load settings from a specific file. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let settings: Self =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        settings.validate()?;
        Ok(settings)
    }

    /// Save settings to the default location
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::settings_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| ConfigError::Write {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let content = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::InvalidChunkSize);
        }

        if let Some(level) = self.compression_level {
            if !(0..=9).contains(&level) {
                return Err(ConfigError::InvalidCompressionLevel(level));
            }
        }

        if let Some(path) = &self.sevenzip_path {
            if !path.is_file() {
                return Err(ConfigError::SevenZipNotFound(path.clone()));
            }
        }

        Ok(())
    }

    /// Chunk size after the `ZIPACCESS_CHUNK_SIZE` environment override.
    pub fn effective_chunk_size(&self) -> usize {
        chunk_size_override().unwrap_or(self.chunk_size).max(1)
    }
}

/// Chunk size from `ZIPACCESS_CHUNK_SIZE`, read once per process.
fn chunk_size_override() -> Option<usize> {
    static OVERRIDE: OnceLock<Option<usize>> = OnceLock::new();
    *OVERRIDE.get_or_init(|| parse_chunk_size(std::env::var("ZIPACCESS_CHUNK_SIZE").ok().as_deref()))
}

fn parse_chunk_size(value: Option<&str>) -> Option<usize> {
    value
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|&v| v > 0)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not determine config directory")]
    NoConfigDir,

    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,

    #[error("compression level {0} is outside 0..=9")]
    InvalidCompressionLevel(i64),

    #[error("7-Zip binary not found: {0}")]
    SevenZipNotFound(PathBuf),
}
