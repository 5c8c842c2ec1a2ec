//! Core types for the cache system.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Cache-related errors.
#[derive(Debug, Error)]
pub enum CacheError {
    /// I/O error during cache operations
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Atomic write could not be finalized (temp file rename failed)
    #[error("failed to persist cache file {path}: {source}")]
    Persist {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Janitor (disk reclamation) configuration.
#[derive(Debug, Clone)]
pub struct JanitorConfig {
    /// Delete tiles not accessed for this long (default: 180 days)
    pub retention: Duration,
    /// Skip a tileset swept more recently than this (default: 30 days)
    pub scan_interval: Duration,
    /// Pause between directories so live downloads are not starved
    pub dir_pause: Duration,
    /// Pause between tilesets
    pub tileset_pause: Duration,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(180 * 86400),
            scan_interval: Duration::from_secs(30 * 86400),
            dir_pause: Duration::from_millis(200),
            tileset_pause: Duration::from_secs(1200),
        }
    }
}

/// Default cache root under the platform cache directory.
pub fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("slippytile")
}
