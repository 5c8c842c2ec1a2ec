//! Where tile bytes come from.
//!
//! The layer asks a [`TileResolver`] for tiles and never knows whether
//! the answer came off the network, a warm disk cache, or a read-only
//! local archive. Swapping the resolver is how offline mode works: the
//! layer's render loop is identical either way.

use crate::cache::DiskCacheStore;
use crate::coord::{TileId, TileKey};
use crate::fetch::TileDownloader;
use crate::tileset::TilesetDescriptor;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

/// Answer to one tile request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TileLookup {
    /// Usable tile bytes, current as far as this resolver knows
    Ready(Vec<u8>),
    /// Usable but aged bytes; a refresh is underway
    Stale(Vec<u8>),
    /// Nothing to show yet; a fetch is underway
    Pending,
    /// Not available from this resolver, and no fetch will happen
    Missing,
}

impl TileLookup {
    /// Bytes to draw right now, if any.
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            TileLookup::Ready(b) | TileLookup::Stale(b) => Some(b),
            TileLookup::Pending | TileLookup::Missing => None,
        }
    }
}

/// Source of tile bytes.
///
/// `may_fetch` distinguishes tiles the caller wants rendered at full
/// quality (schedule network work for them) from opportunistic lookups
/// like ancestor fallbacks, which must never generate traffic.
pub trait TileResolver: Send + Sync {
    fn resolve(&self, tile: TileId, may_fetch: bool) -> TileLookup;
}

impl TileResolver for TileDownloader {
    fn resolve(&self, tile: TileId, may_fetch: bool) -> TileLookup {
        self.lookup(tile, may_fetch)
    }
}

/// Serves only what is already in the disk cache. Staleness is ignored:
/// with no network an old tile beats no tile.
pub struct CacheOnlyResolver {
    tileset: Arc<TilesetDescriptor>,
    store: DiskCacheStore,
}

impl CacheOnlyResolver {
    pub fn new(tileset: Arc<TilesetDescriptor>, store: DiskCacheStore) -> Self {
        Self { tileset, store }
    }
}

impl TileResolver for CacheOnlyResolver {
    fn resolve(&self, tile: TileId, _may_fetch: bool) -> TileLookup {
        let key = TileKey::new(self.tileset.id.clone(), tile);
        match self.store.read(&key) {
            Some(bytes) => TileLookup::Ready(bytes),
            None => TileLookup::Missing,
        }
    }
}

/// Serves a read-only local tile tree laid out as `{root}/{z}/{x}/{y}`,
/// with an optional file extension. Never writes, never fetches.
pub struct ArchiveResolver {
    root: PathBuf,
    extension: Option<String>,
}

impl ArchiveResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extension: None,
        }
    }

    /// Set the filename extension the archive uses (e.g. `png`).
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }

    fn path_for(&self, tile: TileId) -> PathBuf {
        let name = match &self.extension {
            Some(ext) => format!("{}.{}", tile.y, ext),
            None => tile.y.to_string(),
        };
        self.root
            .join(tile.zoom.to_string())
            .join(tile.x.to_string())
            .join(name)
    }
}

impl TileResolver for ArchiveResolver {
    fn resolve(&self, tile: TileId, _may_fetch: bool) -> TileLookup {
        match fs::read(self.path_for(tile)) {
            Ok(bytes) => TileLookup::Ready(bytes),
            Err(_) => TileLookup::Missing,
        }
    }
}
