//! Tileset descriptors.
//!
//! A tileset names one remote source of pre-rendered raster tiles (a map
//! style/provider) together with everything needed to fetch and cache its
//! tiles: host, path template, zoom bounds, cache freshness policy,
//! opacity and attribution for display.

use crate::coord::TileId;
use std::time::Duration;

/// Immutable description of one tile source.
///
/// Construct with [`TilesetDescriptor::new`] plus the `with_*` builders,
/// then share it as `Arc<TilesetDescriptor>` between every layer and
/// downloader that uses the same source.
///
/// # Example
///
/// ```
/// use slippytile::tileset::TilesetDescriptor;
/// use std::time::Duration;
///
/// let tileset = TilesetDescriptor::new("osm-default", "tile.example.org", "/{z}/{x}/{y}.png")
///     .with_zoom_range(0, 18)
///     .with_max_age(Duration::from_secs(7 * 86400))
///     .with_attribution("Map data © OpenStreetMap contributors");
/// ```
#[derive(Debug, Clone)]
pub struct TilesetDescriptor {
    /// Stable id, used as the cache directory name
    pub id: String,
    /// Remote host, with or without a scheme prefix
    pub host: String,
    /// Path template with `{z}`, `{x}`, `{y}` placeholders
    pub path_template: String,
    /// Minimum zoom level served by this source
    pub zoom_min: u8,
    /// Maximum zoom level served by this source
    pub zoom_max: u8,
    /// Age beyond which a disk-cached tile is considered stale
    pub max_age: Duration,
    /// Compositing opacity in `[0, 1]`
    pub opacity: f32,
    /// Attribution text for display overlays
    pub attribution: Option<String>,
    /// Extra request headers sent verbatim with every tile request
    pub extra_headers: Vec<(String, String)>,
}

/// Default freshness window: 30 days.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(30 * 86400);

impl TilesetDescriptor {
    /// Create a descriptor with default zoom range 0–18, full opacity,
    /// 30-day freshness and no extra headers.
    pub fn new(
        id: impl Into<String>,
        host: impl Into<String>,
        path_template: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            path_template: path_template.into(),
            zoom_min: 0,
            zoom_max: 18,
            max_age: DEFAULT_MAX_AGE,
            opacity: 1.0,
            attribution: None,
            extra_headers: Vec::new(),
        }
    }

    /// Set the supported zoom range.
    pub fn with_zoom_range(mut self, zoom_min: u8, zoom_max: u8) -> Self {
        self.zoom_min = zoom_min;
        self.zoom_max = zoom_max;
        self
    }

    /// Set how long a cached tile stays fresh.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Set the compositing opacity (clamped to `[0, 1]`).
    pub fn with_opacity(mut self, opacity: f32) -> Self {
        self.opacity = opacity.clamp(0.0, 1.0);
        self
    }

    /// Set the attribution text.
    pub fn with_attribution(mut self, attribution: impl Into<String>) -> Self {
        self.attribution = Some(attribution.into());
        self
    }

    /// Add a request header sent with every tile fetch.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }

    /// Checks whether this tileset serves the given zoom level.
    pub fn supports_zoom(&self, zoom: u8) -> bool {
        zoom >= self.zoom_min && zoom <= self.zoom_max
    }

    /// Expand the path template for one tile.
    pub fn remote_path(&self, tile: TileId) -> String {
        self.path_template
            .replace("{z}", &tile.zoom.to_string())
            .replace("{x}", &tile.x.to_string())
            .replace("{y}", &tile.y.to_string())
    }

    /// Full request URL for one tile.
    ///
    /// Hosts without an explicit scheme get plain `http://`, matching the
    /// wire protocol the tile servers speak.
    pub fn url_for(&self, tile: TileId) -> String {
        if self.host.contains("://") {
            format!("{}{}", self.host, self.remote_path(tile))
        } else {
            format!("http://{}{}", self.host, self.remote_path(tile))
        }
    }
}
