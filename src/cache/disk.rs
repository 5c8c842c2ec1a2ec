//! Persistent tile cache on disk.
//!
//! One file per tile at `{root}/{tileset}/{zoom}/{x}/{y}`, raw tile bytes,
//! no extension. Writes go through a temp-file-then-rename so a concurrent
//! reader (or another process sharing the same cache root) never observes
//! a partially written tile. Freshness is judged by file modification
//! time; a not-modified refetch only `touch`es the file.

use crate::cache::types::CacheError;
use crate::coord::TileKey;
use filetime::FileTime;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::debug;

/// Handle on one cache directory tree.
///
/// Cheap to clone; every consumer gets its root injected rather than
/// reaching for a process-wide singleton, so tests run against isolated
/// roots.
#[derive(Debug, Clone)]
pub struct DiskCacheStore {
    root: PathBuf,
}

impl DiskCacheStore {
    /// Open (creating if needed) a cache tree rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic path for a tile: `{root}/{tileset}/{zoom}/{x}/{y}`.
    pub fn path_for(&self, key: &TileKey) -> PathBuf {
        self.root
            .join(&key.tileset)
            .join(key.tile.zoom.to_string())
            .join(key.tile.x.to_string())
            .join(key.tile.y.to_string())
    }

    /// Modification time of the cached tile, or `None` if absent.
    pub fn stat(&self, key: &TileKey) -> Option<SystemTime> {
        fs::metadata(self.path_for(key))
            .and_then(|m| m.modified())
            .ok()
    }

    /// Whether the tile exists and its age is below `max_age`.
    pub fn is_fresh(&self, key: &TileKey, max_age: Duration) -> bool {
        match self.stat(key) {
            Some(mtime) => match SystemTime::now().duration_since(mtime) {
                Ok(age) => age < max_age,
                // mtime in the future: clock skew, treat as fresh
                Err(_) => true,
            },
            None => false,
        }
    }

    /// Read a cached tile's raw bytes. Read errors are reported as a miss.
    pub fn read(&self, key: &TileKey) -> Option<Vec<u8>> {
        let path = self.path_for(key);
        match fs::read(&path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                debug!(key = %key, error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    /// Write a tile atomically: temp sibling file, then rename over the
    /// target.
    ///
    /// Creating the parent directory is idempotent, so losing a mkdir
    /// race with another writer is not an error. Any other storage error
    /// is fatal to this one write only.
    pub fn write_atomic(&self, key: &TileKey, bytes: &[u8]) -> Result<(), CacheError> {
        let path = self.path_for(key);
        let parent = path.parent().expect("tile paths always have a parent");
        fs::create_dir_all(parent)?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(bytes)?;
        tmp.persist(&path).map_err(|e| CacheError::Persist {
            path: path.clone(),
            source: e.error,
        })?;
        Ok(())
    }

    /// Delete a cached tile. Deleting an absent tile is not an error.
    pub fn remove(&self, key: &TileKey) -> Result<(), CacheError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::Io(e)),
        }
    }

    /// Refresh the tile's modification time without rewriting its
    /// content. Used on a "not modified" response so freshness resets
    /// without a re-download.
    pub fn touch(&self, key: &TileKey) -> Result<(), CacheError> {
        let path = self.path_for(key);
        filetime::set_file_mtime(&path, FileTime::now()).map_err(CacheError::Io)
    }
}
