//! Tile coordinate types and slippy-map projection math.
//!
//! Tiles subdivide the Web Mercator plane into a power-of-two grid per zoom
//! level. Columns wrap around the antimeridian; rows are clamped at the
//! poles, so there is never a tile above row 0 or below row `2^zoom - 1`.

use std::fmt;

/// Web Mercator valid latitude range
pub const MIN_LAT: f64 = -85.05112878;
pub const MAX_LAT: f64 = 85.05112878;

/// Tile edge length in pixels.
pub const TILE_SIZE: u32 = 256;

/// Identity of one tile within a single tileset's grid.
///
/// Invariant: `x < 2^zoom` and `y < 2^zoom`. Use [`TileId::normalized`]
/// to build one from unconstrained coordinates; it wraps x around the
/// grid and clamps y to the grid edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileId {
    /// Zoom level (0 = whole world in one tile)
    pub zoom: u8,
    /// Column, 0 at the antimeridian, increasing east
    pub x: u32,
    /// Row, 0 at the north edge, increasing south
    pub y: u32,
}

impl TileId {
    /// Number of tiles along one axis at the given zoom level.
    #[inline]
    pub fn grid_size(zoom: u8) -> i64 {
        1i64 << zoom
    }

    /// Create a tile id, wrapping the column and clamping the row.
    ///
    /// Columns wrap modulo `2^zoom` (the map tiles the globe horizontally),
    /// so `x = 2^zoom + 3` names the same tile as `x = 3`. Rows do not
    /// wrap; out-of-range rows are clamped to the nearest edge row.
    pub fn normalized(zoom: u8, x: i64, y: i64) -> Self {
        let n = Self::grid_size(zoom);
        Self {
            zoom,
            x: x.rem_euclid(n) as u32,
            y: y.clamp(0, n - 1) as u32,
        }
    }

    /// The ancestor tile `levels` zoom steps up, whose footprint contains
    /// this tile. Returns `None` when asked to go above zoom 0.
    pub fn ancestor(&self, levels: u8) -> Option<TileId> {
        if levels > self.zoom {
            return None;
        }
        Some(TileId {
            zoom: self.zoom - levels,
            x: self.x >> levels,
            y: self.y >> levels,
        })
    }

    /// Position of this tile within its ancestor `levels` steps up,
    /// as `(column, row)` offsets in `[0, 2^levels)`.
    pub fn quadrant(&self, levels: u8) -> (u32, u32) {
        let mask = (1u32 << levels) - 1;
        (self.x & mask, self.y & mask)
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.zoom, self.x, self.y)
    }
}

/// Full identity of a cached tile: which tileset it belongs to plus its
/// grid coordinates. This is the key the disk cache is addressed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileKey {
    /// Stable tileset id (directory name under the cache root)
    pub tileset: String,
    /// Tile coordinates
    pub tile: TileId,
}

impl TileKey {
    pub fn new(tileset: impl Into<String>, tile: TileId) -> Self {
        Self {
            tileset: tileset.into(),
            tile,
        }
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tileset, self.tile)
    }
}

/// Geographic bounding box in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatLonBounds {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

impl LatLonBounds {
    pub fn new(min_lat: f64, min_lon: f64, max_lat: f64, max_lon: f64) -> Self {
        Self {
            min_lat,
            min_lon,
            max_lat,
            max_lon,
        }
    }

    /// Center point as `(lat, lon)`.
    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lon + self.max_lon) / 2.0,
        )
    }
}

/// Project a geographic point into fractional tile coordinates at the
/// given (possibly fractional) zoom level.
///
/// Returns `(x, y)` where the integer parts are tile column/row and the
/// fractional parts are the position within that tile. Latitude is
/// clamped to the Web Mercator range first.
pub fn project_to_tilespace(lat: f64, lon: f64, zoom: f64) -> (f64, f64) {
    let n = 2f64.powf(zoom);
    let lat = lat.clamp(MIN_LAT, MAX_LAT);
    let lat_rad = lat.to_radians();
    let x = (lon + 180.0) / 360.0 * n;
    let y = (1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / std::f64::consts::PI) / 2.0 * n;
    (x, y)
}
