//! Background reclamation of aged disk-cache tiles.
//!
//! The janitor walks each tileset directory on a slow, independent cycle
//! and deletes tiles whose last *access* time exceeds the retention
//! threshold, pruning now-empty directories bottom-up. A hidden marker
//! file per tileset records the last sweep via its own mtime, so a
//! tileset swept recently is skipped entirely. Sweeping never sits in the
//! tile-serving path; small per-directory pauses keep it from starving
//! live downloads sharing the process.

use crate::cache::types::JanitorConfig;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Name of the per-tileset sweep marker file.
pub const MARKER_FILE: &str = ".last-cleaned";

/// Counters from one tileset sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Files examined
    pub scanned: usize,
    /// Files deleted
    pub deleted: usize,
}

/// Sweeps aged tiles out of a cache root.
pub struct CacheJanitor {
    root: PathBuf,
    config: JanitorConfig,
}

impl CacheJanitor {
    /// Create a janitor for the given cache root with default policy
    /// (180-day retention, 30-day scan interval).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            config: JanitorConfig::default(),
        }
    }

    /// Replace the whole policy.
    pub fn with_config(mut self, config: JanitorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the retention threshold.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.config.retention = retention;
        self
    }

    /// Set the minimum interval between sweeps of one tileset.
    pub fn with_scan_interval(mut self, scan_interval: Duration) -> Self {
        self.config.scan_interval = scan_interval;
        self
    }

    /// Whether the tileset is due for a sweep (no marker, or the marker
    /// is older than the scan interval).
    pub fn due_for_sweep(&self, tileset_dir: &Path) -> bool {
        let marker = tileset_dir.join(MARKER_FILE);
        match fs::metadata(&marker).and_then(|m| m.modified()) {
            Ok(swept_at) => match SystemTime::now().duration_since(swept_at) {
                Ok(age) => age >= self.config.scan_interval,
                Err(_) => false,
            },
            Err(_) => true,
        }
    }

    /// Run one full pass over every tileset under the root, then return.
    ///
    /// Honors `shutdown` between directories so the task stops promptly.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            root = %self.root.display(),
            retention_days = self.config.retention.as_secs() / 86400,
            "cache janitor starting"
        );

        let tilesets = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(root = %self.root.display(), error = %e, "cannot read cache root");
                return;
            }
        };

        for entry in tilesets.flatten() {
            if shutdown.is_cancelled() {
                info!("cache janitor shutting down");
                return;
            }
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if !self.due_for_sweep(&path) {
                debug!(tileset = %path.display(), "swept too recently, skipping");
                continue;
            }
            let stats = self.sweep_tileset(&path, &shutdown).await;
            info!(
                tileset = %path.display(),
                deleted = stats.deleted,
                scanned = stats.scanned,
                "tileset swept"
            );

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("cache janitor shutting down");
                    return;
                }
                _ = tokio::time::sleep(self.config.tileset_pause) => {}
            }
        }
        info!("cache janitor finished");
    }

    /// Sweep a single tileset directory.
    ///
    /// Directories are visited bottom-up so emptied subtrees can be
    /// removed on the way out. The marker is rewritten only if the
    /// tileset directory survived the sweep; a tileset that emptied out
    /// completely disappears without leaving a marker behind.
    pub async fn sweep_tileset(&self, tileset_dir: &Path, shutdown: &CancellationToken) -> SweepStats {
        // Remove the old marker first: it must not survive a sweep that
        // empties the directory, and it is itself just an aged file.
        let _ = fs::remove_file(tileset_dir.join(MARKER_FILE));

        let cutoff = SystemTime::now() - self.config.retention;
        let mut stats = SweepStats::default();

        for dir in postorder_dirs(tileset_dir) {
            if shutdown.is_cancelled() {
                return stats;
            }
            clean_directory(&dir, cutoff, &mut stats);
            // Succeeds only once the directory is empty.
            let _ = fs::remove_dir(&dir);
            if !self.config.dir_pause.is_zero() {
                tokio::time::sleep(self.config.dir_pause).await;
            }
        }

        if tileset_dir.exists() {
            if let Err(e) = fs::write(tileset_dir.join(MARKER_FILE), b"") {
                warn!(tileset = %tileset_dir.display(), error = %e, "cannot write sweep marker");
            }
        }
        stats
    }
}

/// All directories under (and including) `dir`, children before parents.
fn postorder_dirs(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    collect_postorder(dir, &mut out);
    out
}

fn collect_postorder(dir: &Path, out: &mut Vec<PathBuf>) {
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                collect_postorder(&path, out);
            }
        }
    }
    out.push(dir.to_path_buf());
}

/// Delete files in `dir` whose last access is older than `cutoff`.
fn clean_directory(dir: &Path, cutoff: SystemTime, stats: &mut SweepStats) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        if last_access(&metadata) < cutoff {
            stats.deleted += 1;
            if let Err(e) = fs::remove_file(&path) {
                debug!(path = %path.display(), error = %e, "could not delete aged tile");
            }
        }
        stats.scanned += 1;
    }
}

/// Last access time, falling back to mtime on filesystems that do not
/// track atime.
fn last_access(metadata: &fs::Metadata) -> SystemTime {
    metadata
        .accessed()
        .or_else(|_| metadata.modified())
        .unwrap_or(UNIX_EPOCH)
}
