//! Two-level tile cache: a bounded in-memory surface cache in front of a
//! persistent on-disk store, plus a background janitor that reclaims
//! disk space on an aging policy.
//!
//! The two levels have distinct staleness rules: memory entries are valid
//! until explicitly invalidated by a content-modifying fetch, while disk
//! entries age out of freshness after the tileset's `max_age` (stale
//! tiles remain usable as placeholders until refreshed or swept).

mod disk;
mod janitor;
mod memory;
mod types;

pub use disk::DiskCacheStore;
pub use janitor::{CacheJanitor, SweepStats, MARKER_FILE};
pub use memory::{BoundedMemoryCache, DEFAULT_CAPACITY};
pub use types::{default_cache_root, CacheError, JanitorConfig};
