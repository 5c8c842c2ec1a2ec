//! Viewport to tile-grid computation.
//!
//! A viewport is a geographic box plus a fractional zoom. Tiles only
//! exist at integer zooms, so the grid picks the nearest integer zoom and
//! carries a fractional scale factor the compositor applies to tile draw
//! sizes and offsets. Columns wrap around the antimeridian; rows clamp at
//! the poles, repeating the edge row rather than leaving gaps.

use crate::coord::{project_to_tilespace, LatLonBounds, TileId, TILE_SIZE};
use crate::tileset::TilesetDescriptor;

/// One consumer-supplied view of the map.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub bounds: LatLonBounds,
    /// Fractional zoom level
    pub zoom: f64,
}

impl Viewport {
    pub fn new(bounds: LatLonBounds, zoom: f64) -> Self {
        Self { bounds, zoom }
    }

    /// Integer zoom the grid snaps to: nearest level.
    pub fn int_zoom(&self) -> u8 {
        (self.zoom + 0.5).floor().max(0.0).min(30.0) as u8
    }
}

/// One tile and where it lands on the output surface, in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TilePlacement {
    pub tile: TileId,
    pub screen_x: f64,
    pub screen_y: f64,
    /// Draw edge length; `TILE_SIZE * scale`
    pub size: f64,
}

/// Computed set of visible tiles for one viewport snapshot.
#[derive(Debug, Clone)]
pub struct ViewportGrid {
    int_zoom: u8,
    scale: f64,
    /// Inclusive unwrapped column range; may extend past `2^zoom`
    col_range: (i64, i64),
    /// Inclusive clamped row range
    row_range: (i64, i64),
    placements: Vec<TilePlacement>,
    extent_px: (f64, f64),
}

impl ViewportGrid {
    /// Compute the grid of tiles covering `viewport` for `tileset`.
    ///
    /// Print mode renders one zoom level deeper at half scale, for output
    /// devices whose pixels are much smaller than a screen's. A zoom the
    /// tileset does not serve produces an empty grid.
    pub fn compute(viewport: &Viewport, tileset: &TilesetDescriptor, print_mode: bool) -> Self {
        let mut int_zoom = viewport.int_zoom();
        if print_mode {
            int_zoom = int_zoom.saturating_add(1);
        }
        if !tileset.supports_zoom(int_zoom) {
            return Self::empty(int_zoom);
        }

        let scale = 2f64.powf(viewport.zoom - int_zoom as f64);
        let n = TileId::grid_size(int_zoom);
        let b = viewport.bounds;

        // Fractional tile coordinates of the viewport corners; the
        // projection clamps latitude to the Mercator range.
        let (x0f, y0f) = project_to_tilespace(b.max_lat, b.min_lon, int_zoom as f64);
        let (mut x1f, y1f) = project_to_tilespace(b.min_lat, b.max_lon, int_zoom as f64);
        if x1f < x0f {
            // Antimeridian crossing: unwrap the east edge.
            x1f += n as f64;
        }

        let col_range = (x0f.floor() as i64, x1f.ceil() as i64 - 1);
        let row_range = (
            (y0f.floor() as i64).clamp(0, n - 1),
            (y1f.ceil() as i64 - 1).clamp(0, n - 1),
        );

        let size = TILE_SIZE as f64 * scale;
        let mut placements = Vec::new();
        for row in row_range.0..=row_range.1 {
            for col in col_range.0..=col_range.1 {
                placements.push(TilePlacement {
                    tile: TileId::normalized(int_zoom, col, row),
                    screen_x: (col as f64 - x0f) * size,
                    screen_y: (row as f64 - y0f) * size,
                    size,
                });
            }
        }

        Self {
            int_zoom,
            scale,
            col_range,
            row_range,
            placements,
            extent_px: ((x1f - x0f) * size, (y1f - y0f) * size),
        }
    }

    pub(crate) fn empty(int_zoom: u8) -> Self {
        Self {
            int_zoom,
            scale: 1.0,
            col_range: (0, -1),
            row_range: (0, -1),
            placements: Vec::new(),
            extent_px: (0.0, 0.0),
        }
    }

    pub fn int_zoom(&self) -> u8 {
        self.int_zoom
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn placements(&self) -> &[TilePlacement] {
        &self.placements
    }

    /// Inclusive unwrapped column range; the east edge may exceed
    /// `2^zoom` when the view crosses the antimeridian.
    pub fn col_range(&self) -> (i64, i64) {
        self.col_range
    }

    /// Inclusive row range, clamped to the grid.
    pub fn row_range(&self) -> (i64, i64) {
        self.row_range
    }

    pub fn is_empty(&self) -> bool {
        self.placements.is_empty()
    }

    /// Output surface size in whole pixels.
    pub fn pixel_size(&self) -> (u32, u32) {
        (
            self.extent_px.0.ceil().max(0.0) as u32,
            self.extent_px.1.ceil().max(0.0) as u32,
        )
    }

    /// Whether a tile is inside the current view.
    ///
    /// Wrap-aware: a completion for column 3 is in view when the view
    /// spans unwrapped columns `2^zoom .. 2^zoom + 5`, because those
    /// wrap onto columns 0..5.
    pub fn in_view(&self, tile: TileId) -> bool {
        if tile.zoom != self.int_zoom {
            return false;
        }
        let row = tile.y as i64;
        if row < self.row_range.0 || row > self.row_range.1 {
            return false;
        }
        let n = TileId::grid_size(self.int_zoom);
        let (c0, c1) = self.col_range;
        if c1 - c0 + 1 >= n {
            return true;
        }
        // Smallest unwrapped column >= c0 that maps onto tile.x.
        let candidate = c0 + (tile.x as i64 - c0).rem_euclid(n);
        candidate <= c1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tileset() -> TilesetDescriptor {
        TilesetDescriptor::new("demo", "tiles.example.org", "/{z}/{x}/{y}.png")
            .with_zoom_range(0, 18)
            .with_max_age(Duration::from_secs(86400))
    }

    fn viewport(min_lat: f64, min_lon: f64, max_lat: f64, max_lon: f64, zoom: f64) -> Viewport {
        Viewport::new(LatLonBounds::new(min_lat, min_lon, max_lat, max_lon), zoom)
    }

    #[test]
    fn fractional_zoom_rounds_to_nearest_level() {
        assert_eq!(viewport(0.0, 0.0, 1.0, 1.0, 10.4).int_zoom(), 10);
        assert_eq!(viewport(0.0, 0.0, 1.0, 1.0, 10.5).int_zoom(), 11);
    }

    #[test]
    fn grid_covers_the_viewport() {
        let vp = viewport(44.0, -69.0, 45.0, -68.0, 10.0);
        let grid = ViewportGrid::compute(&vp, &tileset(), false);

        assert_eq!(grid.int_zoom(), 10);
        assert!((grid.scale() - 1.0).abs() < 1e-12);
        assert!(!grid.is_empty());
        for p in grid.placements() {
            assert!(grid.in_view(p.tile), "own placements are in view");
            assert!((p.size - 256.0).abs() < 1e-9);
        }
        let (w, h) = grid.pixel_size();
        assert!(w > 0 && h > 0);
    }

    #[test]
    fn fractional_zoom_scales_tile_draw_size() {
        let vp = viewport(44.0, -69.0, 45.0, -68.0, 10.25);
        let grid = ViewportGrid::compute(&vp, &tileset(), false);
        assert_eq!(grid.int_zoom(), 10);
        let expected = 256.0 * 2f64.powf(0.25);
        assert!((grid.placements()[0].size - expected).abs() < 1e-9);
    }

    #[test]
    fn print_mode_goes_one_level_deeper_at_half_scale() {
        let vp = viewport(44.0, -69.0, 45.0, -68.0, 10.0);
        let screen = ViewportGrid::compute(&vp, &tileset(), false);
        let print = ViewportGrid::compute(&vp, &tileset(), true);

        assert_eq!(print.int_zoom(), screen.int_zoom() + 1);
        assert!((print.scale() - screen.scale() / 2.0).abs() < 1e-12);
        // Same geographic area, so roughly four times the tiles.
        assert!(print.placements().len() > screen.placements().len());
    }

    #[test]
    fn unsupported_zoom_yields_empty_grid() {
        let ts = tileset().with_zoom_range(0, 8);
        let vp = viewport(44.0, -69.0, 45.0, -68.0, 12.0);
        let grid = ViewportGrid::compute(&vp, &ts, false);
        assert!(grid.is_empty());
        assert_eq!(grid.pixel_size(), (0, 0));
    }

    #[test]
    fn antimeridian_crossing_wraps_columns() {
        // Fiji-ish: west edge at +179, east edge at -179.
        let vp = viewport(-19.0, 179.0, -16.0, -179.0, 7.0);
        let grid = ViewportGrid::compute(&vp, &tileset(), false);
        assert!(!grid.is_empty());

        let n = TileId::grid_size(7);
        let columns: Vec<i64> = grid.placements().iter().map(|p| p.tile.x as i64).collect();
        assert!(columns.contains(&(n - 1)), "west of the seam");
        assert!(columns.contains(&0), "east of the seam");

        // Both seam columns count as in view despite the wrap.
        let row = grid.placements()[0].tile.y;
        assert!(grid.in_view(TileId::normalized(7, n - 1, row as i64)));
        assert!(grid.in_view(TileId::normalized(7, 0, row as i64)));
    }

    #[test]
    fn out_of_view_tiles_are_rejected() {
        let vp = viewport(44.0, -69.0, 45.0, -68.0, 10.0);
        let grid = ViewportGrid::compute(&vp, &tileset(), false);
        let sample = grid.placements()[0].tile;

        // Wrong zoom.
        assert!(!grid.in_view(TileId::normalized(9, sample.x as i64 / 2, sample.y as i64 / 2)));
        // Far-away column.
        assert!(!grid.in_view(TileId::normalized(10, (sample.x as i64 + 100) % 1024, sample.y as i64)));
    }

    #[test]
    fn wrapped_column_aliases_are_equivalent() {
        let vp = viewport(44.0, -69.0, 45.0, -68.0, 5.0);
        let grid = ViewportGrid::compute(&vp, &tileset(), false);
        let sample = grid.placements()[0].tile;
        let n = TileId::grid_size(5);

        let aliased = TileId::normalized(5, sample.x as i64 + n, sample.y as i64);
        assert_eq!(aliased, sample);
        assert!(grid.in_view(aliased));
    }
}
