//! Bounded in-memory tile cache.
//!
//! A pure accelerator in front of the disk cache: recency-ordered, capped
//! at a fixed number of entries, and never touching disk or network. The
//! layer stores decoded surfaces here so a pan that revisits tiles does
//! not re-decode them from disk.

use crate::coord::TileId;
use lru::LruCache;
use std::num::NonZeroUsize;

/// Default capacity in entries.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Recency-ordered map of decoded tiles, capped at N entries.
///
/// `get` promotes the entry to most-recently-used; `put` evicts the
/// least-recently-touched entry once the cache exceeds capacity. All
/// operations are O(1) amortized.
pub struct BoundedMemoryCache<V> {
    inner: LruCache<TileId, V>,
}

impl<V: Clone> BoundedMemoryCache<V> {
    /// Create a cache holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            inner: LruCache::new(capacity),
        }
    }

    /// Look up a tile, marking it most-recently-used on a hit.
    pub fn get(&mut self, tile: &TileId) -> Option<V> {
        self.inner.get(tile).cloned()
    }

    /// Insert a tile, evicting the least-recently-used entry if the cache
    /// is full.
    pub fn put(&mut self, tile: TileId, value: V) {
        self.inner.put(tile, value);
    }

    /// Remove a tile if present. Not an error if it is absent.
    pub fn invalidate(&mut self, tile: &TileId) {
        self.inner.pop(tile);
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.cap().get()
    }
}

impl<V: Clone> Default for BoundedMemoryCache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
