//! slippytile: a slippy-map tile cache and concurrent fetch manager.
//!
//! Supplies pre-rendered raster map tiles for a viewport, downloading
//! missing ones over HTTP through a bounded worker pool, caching them on
//! disk and in a bounded in-memory cache, and reclaiming disk space on an
//! aging policy.
//!
//! # Architecture
//!
//! - [`coord`]: tile coordinates, wrap/clamp rules, projection math
//! - [`tileset`]: descriptors for remote tile sources
//! - [`cache`]: two-level cache (memory + disk) and the disk janitor
//! - [`fetch`]: fetch queue, worker pool, conditional HTTP client
//! - [`source`]: the resolver seam for live, cache-only, or local-archive tiles
//! - [`layer`]: viewport rendering, redraw coalescing, precache
//! - [`logging`]: optional tracing setup for embedders
//!
//! # Example
//!
//! ```no_run
//! use slippytile::cache::DiskCacheStore;
//! use slippytile::coord::LatLonBounds;
//! use slippytile::layer::{LayerConfig, TileLayer, Viewport};
//! use slippytile::tileset::TilesetDescriptor;
//! use std::sync::Arc;
//! use std::time::Instant;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let tileset = Arc::new(TilesetDescriptor::new(
//!     "osm-default",
//!     "tile.example.org",
//!     "/{z}/{x}/{y}.png",
//! ));
//! let store = DiskCacheStore::new("/var/cache/tiles")?;
//! let mut layer = TileLayer::new(tileset, store, LayerConfig::default())?;
//!
//! let view = Viewport::new(LatLonBounds::new(44.0, -69.0, 44.5, -68.5), 10.0);
//! layer.set_viewport(&view, false);
//! let (surface, stats) = layer.render();
//! println!("drawn {} requested {}", stats.drawn, stats.requested);
//!
//! // Consumer loop: repaint when arriving tiles justify it.
//! if layer.poll_redraw(Instant::now()) {
//!     let (surface, _) = layer.render();
//!     # let _ = surface;
//! }
//! # let _ = surface;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod coord;
pub mod fetch;
pub mod layer;
pub mod logging;
pub mod source;
pub mod tileset;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
