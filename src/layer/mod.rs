//! The tile layer: viewport rendering, redraw coalescing, precache,
//! reload and the offline switch.
//!
//! A [`TileLayer`] owns one tileset's render pipeline end to end: the
//! decoded-surface memory cache, the disk cache handle, the background
//! downloader and the completion channel. The consumer drives it from
//! its own loop: `set_viewport` on pan/zoom, `render` for a surface,
//! `poll_redraw` to learn when arriving tiles justify painting again.

mod compose;
mod viewport;

pub use compose::{crop_ancestor, decode_tile, draw_tile};
pub use viewport::{TilePlacement, Viewport, ViewportGrid};

use crate::cache::{BoundedMemoryCache, DiskCacheStore, DEFAULT_CAPACITY};
use crate::coord::{TileId, TileKey};
use crate::fetch::{
    DownloaderConfig, FetchComplete, FetchError, FetchOutcome, SyncFetcher, TileClient,
    TileDownloader,
};
use crate::source::{CacheOnlyResolver, TileLookup, TileResolver};
use crate::tileset::TilesetDescriptor;
use image::RgbaImage;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How long to wait for stragglers once the first awaited tile arrives
/// before forcing a redraw with whatever is on hand.
pub const DEFAULT_PATIENCE: Duration = Duration::from_millis(200);

/// Layer tuning knobs.
#[derive(Debug, Clone)]
pub struct LayerConfig {
    /// Decoded surfaces kept in memory
    pub memory_capacity: usize,
    /// Redraw coalescing window
    pub patience: Duration,
    pub downloader: DownloaderConfig,
    /// Wait between precache retries after a transport failure
    pub precache_retry_wait: Duration,
    /// Transport retries per tile before precache gives it up
    pub precache_retry_limit: usize,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            memory_capacity: DEFAULT_CAPACITY,
            patience: DEFAULT_PATIENCE,
            downloader: DownloaderConfig::default(),
            precache_retry_wait: Duration::from_secs(10),
            precache_retry_limit: 3,
        }
    }
}

/// Counters from one `render` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderStats {
    /// Tiles drawn at full quality
    pub drawn: usize,
    /// Tiles substituted by a scaled-up ancestor crop
    pub approximated: usize,
    /// Tiles with nothing to draw at all
    pub blank: usize,
    /// Tiles newly handed to the fetch pipeline this pass
    pub requested: usize,
}

/// Receives precache progress.
///
/// `tile_done` then `progress` fire once per tile, in that order, so a
/// UI can both count and name what succeeded or failed. During the wait
/// before a transport retry, `countdown` fires once per remaining whole
/// second so the wait is visible rather than a silent stall.
pub trait ProgressSink {
    fn progress(&mut self, done: usize, total: usize);

    /// Final outcome for one tile, reported before `progress`.
    fn tile_done(&mut self, tile: TileId, outcome: FetchOutcome) {
        let _ = (tile, outcome);
    }

    /// Seconds left before `tile` is retried after a transport failure.
    fn countdown(&mut self, tile: TileId, seconds_left: u64) {
        let _ = (tile, seconds_left);
    }
}

impl<F: FnMut(usize, usize)> ProgressSink for F {
    fn progress(&mut self, done: usize, total: usize) {
        self(done, total)
    }
}

/// Outcome counts from one precache run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrecacheReport {
    pub downloaded: usize,
    pub already_fresh: usize,
    pub failed: usize,
    pub total: usize,
}

type SharedMemory = Arc<Mutex<BoundedMemoryCache<Arc<RgbaImage>>>>;

/// One tileset's full render pipeline.
pub struct TileLayer {
    tileset: Arc<TilesetDescriptor>,
    store: DiskCacheStore,
    memory: SharedMemory,
    downloader: Option<Arc<TileDownloader>>,
    resolver: Arc<dyn TileResolver>,
    completions: Option<mpsc::UnboundedReceiver<FetchComplete>>,
    grid: ViewportGrid,
    awaiting: HashSet<TileId>,
    deadline: Option<Instant>,
    dirty: bool,
    offline: bool,
    config: LayerConfig,
}

impl TileLayer {
    /// Create a layer with a live HTTP downloader. Must be called from
    /// within a tokio runtime (the worker pool is spawned here).
    pub fn new(
        tileset: Arc<TilesetDescriptor>,
        store: DiskCacheStore,
        config: LayerConfig,
    ) -> Result<Self, FetchError> {
        let memory = new_memory(config.memory_capacity);
        let (downloader, rx) = TileDownloader::spawn(
            Arc::clone(&tileset),
            store.clone(),
            invalidate_hook(&memory),
            config.downloader.clone(),
        )?;
        Ok(Self::assemble(tileset, store, memory, Some(Arc::new(downloader)), Some(rx), config))
    }

    /// Create a layer whose workers use caller-supplied clients. This is
    /// the seam tests and embedders with custom transports go through.
    pub fn with_clients<C: TileClient + 'static>(
        tileset: Arc<TilesetDescriptor>,
        store: DiskCacheStore,
        config: LayerConfig,
        clients: Vec<C>,
    ) -> Self {
        let memory = new_memory(config.memory_capacity);
        let (downloader, rx) = TileDownloader::spawn_with_clients(
            Arc::clone(&tileset),
            store.clone(),
            invalidate_hook(&memory),
            config.downloader.clone(),
            clients,
        );
        Self::assemble(tileset, store, memory, Some(Arc::new(downloader)), Some(rx), config)
    }

    /// Create a layer over an arbitrary resolver, with no downloader and
    /// no completions (nothing is ever fetched).
    pub fn with_resolver(
        tileset: Arc<TilesetDescriptor>,
        store: DiskCacheStore,
        resolver: Arc<dyn TileResolver>,
        config: LayerConfig,
    ) -> Self {
        let memory = new_memory(config.memory_capacity);
        let mut layer = Self::assemble(tileset, store, memory, None, None, config);
        layer.resolver = resolver;
        layer
    }

    fn assemble(
        tileset: Arc<TilesetDescriptor>,
        store: DiskCacheStore,
        memory: SharedMemory,
        downloader: Option<Arc<TileDownloader>>,
        completions: Option<mpsc::UnboundedReceiver<FetchComplete>>,
        config: LayerConfig,
    ) -> Self {
        let resolver: Arc<dyn TileResolver> = match &downloader {
            Some(d) => Arc::clone(d) as Arc<dyn TileResolver>,
            None => Arc::new(CacheOnlyResolver::new(Arc::clone(&tileset), store.clone())),
        };
        Self {
            tileset,
            store,
            memory,
            downloader,
            resolver,
            completions,
            grid: ViewportGrid::empty(0),
            awaiting: HashSet::new(),
            deadline: None,
            dirty: false,
            offline: false,
            config,
        }
    }

    /// Attribution text of the underlying tileset, for the consumer's
    /// overlay.
    pub fn attribution(&self) -> Option<&str> {
        self.tileset.attribution.as_deref()
    }

    pub fn grid(&self) -> &ViewportGrid {
        &self.grid
    }

    /// Recompute the visible tile grid for a new viewport. Outstanding
    /// redraw state is reset; completions for the old view will be
    /// discarded as out-of-view when they arrive.
    pub fn set_viewport(&mut self, viewport: &Viewport, print_mode: bool) {
        self.grid = ViewportGrid::compute(viewport, &self.tileset, print_mode);
        self.awaiting.clear();
        self.deadline = None;
        self.dirty = false;
        debug!(
            tileset = %self.tileset.id,
            zoom = self.grid.int_zoom(),
            tiles = self.grid.placements().len(),
            "viewport set"
        );
    }

    /// Paint the current grid onto a fresh surface.
    ///
    /// Every visible tile is drawn at the best quality available right
    /// now: memory, then disk (stale tiles included, with a refresh
    /// scheduled), then a scaled-up crop of the nearest cached ancestor.
    /// Missing tiles are handed to the fetch pipeline and arrive later
    /// via [`TileLayer::poll_redraw`].
    pub fn render(&mut self) -> (RgbaImage, RenderStats) {
        let (w, h) = self.grid.pixel_size();
        let mut canvas = RgbaImage::new(w, h);
        let mut stats = RenderStats::default();
        let opacity = self.tileset.opacity;

        let placements: Vec<TilePlacement> = self.grid.placements().to_vec();
        for p in &placements {
            if let Some(surface) = self.memory_get(&p.tile) {
                draw_tile(&mut canvas, &surface, p.screen_x, p.screen_y, p.size, opacity);
                stats.drawn += 1;
                continue;
            }
            match self.resolver.resolve(p.tile, true) {
                TileLookup::Ready(bytes) => match decode_tile(&bytes) {
                    Ok(img) => {
                        let img = Arc::new(img);
                        self.memory_put(p.tile, Arc::clone(&img));
                        draw_tile(&mut canvas, &img, p.screen_x, p.screen_y, p.size, opacity);
                        stats.drawn += 1;
                    }
                    Err(e) => {
                        warn!(tile = %p.tile, error = %e, "undecodable cached tile, treating as missing");
                        self.draw_fallback(&mut canvas, p, opacity, &mut stats);
                    }
                },
                TileLookup::Stale(bytes) => {
                    if self.awaiting.insert(p.tile) {
                        stats.requested += 1;
                    }
                    match decode_tile(&bytes) {
                        Ok(img) => {
                            let img = Arc::new(img);
                            self.memory_put(p.tile, Arc::clone(&img));
                            draw_tile(&mut canvas, &img, p.screen_x, p.screen_y, p.size, opacity);
                            stats.drawn += 1;
                        }
                        Err(e) => {
                            warn!(tile = %p.tile, error = %e, "undecodable stale tile");
                            self.draw_fallback(&mut canvas, p, opacity, &mut stats);
                        }
                    }
                }
                TileLookup::Pending => {
                    if self.awaiting.insert(p.tile) {
                        stats.requested += 1;
                    }
                    self.draw_fallback(&mut canvas, p, opacity, &mut stats);
                }
                TileLookup::Missing => {
                    self.draw_fallback(&mut canvas, p, opacity, &mut stats);
                }
            }
        }
        (canvas, stats)
    }

    /// Substitute the nearest cached ancestor, scaled up over the tile's
    /// footprint. Ancestor lookups never schedule fetches.
    fn draw_fallback(
        &mut self,
        canvas: &mut RgbaImage,
        p: &TilePlacement,
        opacity: f32,
        stats: &mut RenderStats,
    ) {
        let max_levels = p.tile.zoom.saturating_sub(self.tileset.zoom_min);
        for levels in 1..=max_levels {
            let Some(ancestor) = p.tile.ancestor(levels) else { break };
            let surface = match self.memory_get(&ancestor) {
                Some(surface) => Some(surface),
                None => match self.resolver.resolve(ancestor, false) {
                    TileLookup::Ready(bytes) | TileLookup::Stale(bytes) => {
                        match decode_tile(&bytes) {
                            Ok(img) => {
                                let img = Arc::new(img);
                                self.memory_put(ancestor, Arc::clone(&img));
                                Some(img)
                            }
                            Err(_) => None,
                        }
                    }
                    TileLookup::Pending | TileLookup::Missing => None,
                },
            };
            if let Some(surface) = surface {
                let crop = crop_ancestor(&surface, levels, p.tile.quadrant(levels));
                draw_tile(canvas, &crop, p.screen_x, p.screen_y, p.size, opacity);
                stats.approximated += 1;
                return;
            }
        }
        stats.blank += 1;
    }

    /// Drain fetch completions and decide whether a repaint is worth it.
    ///
    /// Completions for tiles outside the current view are discarded. The
    /// first in-view completion that leaves others outstanding arms the
    /// patience timer; when the last awaited tile lands, or the timer
    /// expires, this returns `true` once, provided something actually
    /// changed on disk since the last render.
    pub fn poll_redraw(&mut self, now: Instant) -> bool {
        if let Some(rx) = self.completions.as_mut() {
            while let Ok(done) = rx.try_recv() {
                if !self.grid.in_view(done.tile) {
                    self.awaiting.remove(&done.tile);
                    debug!(tile = %done.tile, "completion for out-of-view tile discarded");
                    continue;
                }
                if self.awaiting.remove(&done.tile) {
                    self.dirty |= done.modified;
                    if !self.awaiting.is_empty() && self.deadline.is_none() {
                        self.deadline = Some(now + self.config.patience);
                    }
                }
            }
        }

        let due = self.awaiting.is_empty()
            || self.deadline.is_some_and(|deadline| now >= deadline);
        if due {
            self.deadline = None;
            if self.dirty {
                self.dirty = false;
                return true;
            }
        }
        false
    }

    /// Throw away cached copies of every visible tile, memory and disk,
    /// so the next render re-fetches them all.
    pub fn reload(&mut self) {
        let tiles: Vec<TileId> = self.grid.placements().iter().map(|p| p.tile).collect();
        info!(tileset = %self.tileset.id, tiles = tiles.len(), "reloading visible tiles");
        for tile in tiles {
            self.memory_invalidate(&tile);
            let key = TileKey::new(self.tileset.id.clone(), tile);
            if let Err(e) = self.store.remove(&key) {
                warn!(key = %key, error = %e, "could not delete cached tile");
            }
        }
        self.awaiting.clear();
        self.deadline = None;
        self.dirty = false;
    }

    /// Switch between live fetching and cache-only operation.
    ///
    /// Offline, the disk cache is treated as fresh forever and missing
    /// tiles stay missing. The memory cache is dumped on every mode
    /// change so surfaces from the other mode cannot linger.
    pub fn set_offline(&mut self, offline: bool) {
        if offline == self.offline {
            return;
        }
        self.offline = offline;
        self.resolver = if offline {
            Arc::new(CacheOnlyResolver::new(
                Arc::clone(&self.tileset),
                self.store.clone(),
            ))
        } else {
            match &self.downloader {
                Some(d) => Arc::clone(d) as Arc<dyn TileResolver>,
                None => Arc::new(CacheOnlyResolver::new(
                    Arc::clone(&self.tileset),
                    self.store.clone(),
                )),
            }
        };
        self.memory.lock().expect("memory cache lock poisoned").clear();
        self.awaiting.clear();
        self.deadline = None;
        self.dirty = false;
        info!(tileset = %self.tileset.id, offline, "offline mode switched");
    }

    pub fn is_offline(&self) -> bool {
        self.offline
    }

    /// Download every tile covering the current view, from the current
    /// zoom down to `max_zoom`, using a live HTTP fetcher.
    pub async fn precache(
        &self,
        max_zoom: u8,
        progress: &mut dyn ProgressSink,
    ) -> Result<PrecacheReport, FetchError> {
        let fetcher = SyncFetcher::new(Arc::clone(&self.tileset), self.store.clone())?;
        Ok(self.precache_with(&fetcher, max_zoom, progress).await)
    }

    /// Precache through a caller-supplied fetcher.
    ///
    /// The tile rectangle doubles per zoom level below the current one
    /// (each tile has four children). Tiles already fresh are skipped
    /// without network traffic; transport failures retry with a visible
    /// countdown, up to the configured limit, then count the tile as
    /// failed. Every tile's identity and outcome reaches `progress`
    /// individually; the returned report only aggregates them.
    pub async fn precache_with<C: TileClient>(
        &self,
        fetcher: &SyncFetcher<C>,
        max_zoom: u8,
        progress: &mut dyn ProgressSink,
    ) -> PrecacheReport {
        let max_zoom = max_zoom.min(self.tileset.zoom_max);
        let mut report = PrecacheReport::default();
        if self.grid.is_empty() {
            return report;
        }

        let (mut x0, mut x1) = self.grid.col_range();
        let (mut y0, mut y1) = self.grid.row_range();
        let mut levels = Vec::new();
        for zoom in self.grid.int_zoom()..=max_zoom {
            report.total += ((x1 - x0 + 1) * (y1 - y0 + 1)) as usize;
            levels.push((zoom, (x0, x1), (y0, y1)));
            x0 *= 2;
            x1 = x1 * 2 + 1;
            y0 *= 2;
            y1 = y1 * 2 + 1;
        }
        info!(
            tileset = %self.tileset.id,
            from_zoom = self.grid.int_zoom(),
            to_zoom = max_zoom,
            total = report.total,
            "precache starting"
        );

        let mut done = 0;
        for (zoom, (x0, x1), (y0, y1)) in levels {
            for row in y0..=y1 {
                for col in x0..=x1 {
                    let tile = TileId::normalized(zoom, col, row);
                    let outcome = self.precache_one(fetcher, tile, progress).await;
                    match outcome {
                        FetchOutcome::Downloaded => report.downloaded += 1,
                        FetchOutcome::Fresh | FetchOutcome::NotModified => {
                            report.already_fresh += 1
                        }
                        FetchOutcome::Abandoned => report.failed += 1,
                    }
                    done += 1;
                    progress.tile_done(tile, outcome);
                    progress.progress(done, report.total);
                }
            }
        }
        info!(
            tileset = %self.tileset.id,
            downloaded = report.downloaded,
            already_fresh = report.already_fresh,
            failed = report.failed,
            "precache finished"
        );
        report
    }

    async fn precache_one<C: TileClient>(
        &self,
        fetcher: &SyncFetcher<C>,
        tile: TileId,
        progress: &mut dyn ProgressSink,
    ) -> FetchOutcome {
        let mut attempts = 0;
        loop {
            match fetcher.fetch(tile).await {
                Ok(outcome) => return outcome,
                Err(e) => {
                    attempts += 1;
                    if attempts > self.config.precache_retry_limit {
                        warn!(tile = %tile, error = %e, "precache giving tile up");
                        return FetchOutcome::Abandoned;
                    }
                    warn!(
                        tile = %tile,
                        error = %e,
                        wait_secs = self.config.precache_retry_wait.as_secs(),
                        "precache transport failure, waiting before retry"
                    );
                    fetcher.reset();
                    self.retry_countdown(tile, progress).await;
                }
            }
        }
    }

    /// Sleep out the retry wait one second at a time, announcing each
    /// remaining second so the caller can show the countdown.
    async fn retry_countdown(&self, tile: TileId, progress: &mut dyn ProgressSink) {
        let mut remaining = self.config.precache_retry_wait;
        while !remaining.is_zero() {
            let seconds_left = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
            progress.countdown(tile, seconds_left);
            let step = remaining.min(Duration::from_secs(1));
            tokio::time::sleep(step).await;
            remaining -= step;
        }
    }

    fn memory_get(&self, tile: &TileId) -> Option<Arc<RgbaImage>> {
        self.memory.lock().expect("memory cache lock poisoned").get(tile)
    }

    fn memory_put(&self, tile: TileId, surface: Arc<RgbaImage>) {
        self.memory
            .lock()
            .expect("memory cache lock poisoned")
            .put(tile, surface);
    }

    fn memory_invalidate(&self, tile: &TileId) {
        self.memory
            .lock()
            .expect("memory cache lock poisoned")
            .invalidate(tile);
    }
}

fn new_memory(capacity: usize) -> SharedMemory {
    Arc::new(Mutex::new(BoundedMemoryCache::new(capacity)))
}

fn invalidate_hook(memory: &SharedMemory) -> crate::fetch::InvalidateFn {
    let memory = Arc::clone(memory);
    Arc::new(move |tile| {
        memory
            .lock()
            .expect("memory cache lock poisoned")
            .invalidate(&tile);
    })
}
