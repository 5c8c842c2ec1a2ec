//! The two fetch-mode front ends: a background worker pool for
//! interactive display and a caller-driven fetcher for batch work.

use crate::cache::DiskCacheStore;
use crate::coord::{TileId, TileKey};
use crate::fetch::client::{ReqwestTileClient, TileClient, DEFAULT_TIMEOUT};
use crate::fetch::queue::{Enqueued, FetchQueue, FetchRequest, DEFAULT_QUEUE_CAPACITY};
use crate::fetch::worker::{fetch_tile, worker_loop, FetchComplete, WorkerContext};
use crate::fetch::{FetchError, FetchOutcome};
use crate::source::TileLookup;
use crate::tileset::TilesetDescriptor;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Default worker pool size.
pub const DEFAULT_WORKERS: usize = 3;

/// Default pause before retrying after a transport failure.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(10);

/// Tuning for a [`TileDownloader`] pool.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub retry_backoff: Duration,
    pub request_timeout: Duration,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            request_timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Hook called when a fetch changed a tile's content, before the
/// completion is reported. The layer points this at its memory cache.
pub type InvalidateFn = Arc<dyn Fn(TileId) + Send + Sync>;

/// Background tile fetcher for one tileset.
///
/// Owns a bounded request queue and a fixed pool of workers, each with
/// its own persistent HTTP client. Requests deduplicate against an
/// in-flight set: asking for a tile already queued or mid-download is a
/// no-op, and the single eventual completion answers every asker.
pub struct TileDownloader {
    tileset: Arc<TilesetDescriptor>,
    store: DiskCacheStore,
    queue: Arc<FetchQueue>,
    in_flight: Arc<Mutex<HashSet<TileId>>>,
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl TileDownloader {
    /// Spawn a pool with real HTTP clients. Must be called from within a
    /// tokio runtime.
    pub fn spawn(
        tileset: Arc<TilesetDescriptor>,
        store: DiskCacheStore,
        invalidate: InvalidateFn,
        config: DownloaderConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<FetchComplete>), FetchError> {
        let mut clients = Vec::with_capacity(config.workers.max(1));
        for _ in 0..config.workers.max(1) {
            clients.push(ReqwestTileClient::with_timeout(config.request_timeout)?);
        }
        Ok(Self::spawn_with_clients(
            tileset, store, invalidate, config, clients,
        ))
    }

    /// Spawn a pool over caller-supplied clients (one worker per client).
    pub fn spawn_with_clients<C: TileClient + 'static>(
        tileset: Arc<TilesetDescriptor>,
        store: DiskCacheStore,
        invalidate: InvalidateFn,
        config: DownloaderConfig,
        clients: Vec<C>,
    ) -> (Self, mpsc::UnboundedReceiver<FetchComplete>) {
        let queue = Arc::new(FetchQueue::new(config.queue_capacity));
        let in_flight = Arc::new(Mutex::new(HashSet::new()));
        let shutdown = CancellationToken::new();
        let (completions, rx) = mpsc::unbounded_channel();

        info!(
            tileset = %tileset.id,
            workers = clients.len(),
            "starting tile downloader"
        );

        let workers = clients
            .into_iter()
            .enumerate()
            .map(|(worker_id, client)| {
                let ctx = WorkerContext {
                    tileset: Arc::clone(&tileset),
                    store: store.clone(),
                    queue: Arc::clone(&queue),
                    in_flight: Arc::clone(&in_flight),
                    completions: completions.clone(),
                    invalidate: Arc::clone(&invalidate),
                    backoff: config.retry_backoff,
                    shutdown: shutdown.clone(),
                };
                tokio::spawn(worker_loop(ctx, client, worker_id))
            })
            .collect();

        (
            Self {
                tileset,
                store,
                queue,
                in_flight,
                shutdown,
                workers,
            },
            rx,
        )
    }

    /// Look a tile up in the disk cache, scheduling a fetch as needed.
    ///
    /// A fresh cached tile is returned without touching the queue. A
    /// stale one is returned as a usable placeholder while a conditional
    /// refetch is queued. A missing tile queues an unconditional fetch.
    /// With `may_fetch` false nothing is ever queued; a stale tile is
    /// simply served as-is.
    pub fn lookup(&self, tile: TileId, may_fetch: bool) -> TileLookup {
        let key = TileKey::new(self.tileset.id.clone(), tile);
        let mtime = self.store.stat(&key);
        let fresh = self.store.is_fresh(&key, self.tileset.max_age);
        match self.store.read(&key) {
            Some(bytes) if fresh => TileLookup::Ready(bytes),
            Some(bytes) => {
                if may_fetch {
                    self.schedule(tile, mtime);
                    TileLookup::Stale(bytes)
                } else {
                    TileLookup::Ready(bytes)
                }
            }
            None => {
                if may_fetch {
                    self.schedule(tile, None);
                    TileLookup::Pending
                } else {
                    TileLookup::Missing
                }
            }
        }
    }

    fn schedule(&self, tile: TileId, prior_mtime: Option<std::time::SystemTime>) {
        {
            let mut in_flight = self.in_flight.lock().expect("in-flight lock poisoned");
            if !in_flight.insert(tile) {
                return;
            }
        }
        let key = TileKey::new(self.tileset.id.clone(), tile);
        let request = FetchRequest {
            local_path: self.store.path_for(&key),
            url: self.tileset.url_for(tile),
            key,
            prior_mtime,
        };
        match self.queue.push_front(request) {
            Enqueued::Accepted => {}
            Enqueued::Displaced(victim) => {
                self.in_flight
                    .lock()
                    .expect("in-flight lock poisoned")
                    .remove(&victim.key.tile);
            }
            Enqueued::Rejected(rejected) => {
                self.in_flight
                    .lock()
                    .expect("in-flight lock poisoned")
                    .remove(&rejected.key.tile);
            }
        }
    }

    /// Tiles currently queued or being fetched.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.lock().expect("in-flight lock poisoned").len()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Signal every worker to stop. Queued-but-unstarted requests are
    /// discarded; in-progress fetches finish their current attempt.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.queue.close();
    }

    /// Shut down and wait for the workers to exit.
    pub async fn join(mut self) {
        self.shutdown();
        for handle in self.workers.drain(..) {
            let _ = handle.await;
        }
    }
}

impl Drop for TileDownloader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Caller-driven fetcher: one tile at a time, on the caller's own task.
///
/// Used by precaching and batch rendering, where the caller wants the
/// tile on disk before moving on and handles retries itself.
pub struct SyncFetcher<C: TileClient = ReqwestTileClient> {
    tileset: Arc<TilesetDescriptor>,
    store: DiskCacheStore,
    client: C,
    pause: Option<Duration>,
}

impl SyncFetcher<ReqwestTileClient> {
    pub fn new(
        tileset: Arc<TilesetDescriptor>,
        store: DiskCacheStore,
    ) -> Result<Self, FetchError> {
        Ok(Self::with_client(tileset, store, ReqwestTileClient::new()?))
    }
}

impl<C: TileClient> SyncFetcher<C> {
    pub fn with_client(tileset: Arc<TilesetDescriptor>, store: DiskCacheStore, client: C) -> Self {
        Self {
            tileset,
            store,
            client,
            pause: None,
        }
    }

    /// Add a courtesy pause after each successful download, for bulk
    /// jobs that should not hammer the tile server.
    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = Some(pause);
        self
    }

    /// Ensure one tile is fresh on disk.
    ///
    /// A tile already within its freshness window returns
    /// [`FetchOutcome::Fresh`] without any network traffic. `Err` means a
    /// transport failure; the caller decides whether to retry.
    pub async fn fetch(&self, tile: TileId) -> Result<FetchOutcome, FetchError> {
        let key = TileKey::new(self.tileset.id.clone(), tile);
        if self.store.is_fresh(&key, self.tileset.max_age) {
            return Ok(FetchOutcome::Fresh);
        }
        let request = FetchRequest {
            local_path: self.store.path_for(&key),
            url: self.tileset.url_for(tile),
            prior_mtime: self.store.stat(&key),
            key,
        };
        let outcome = fetch_tile(&self.client, &self.tileset, &self.store, &request).await?;
        if outcome == FetchOutcome::Downloaded {
            if let Some(pause) = self.pause {
                tokio::time::sleep(pause).await;
            }
        }
        Ok(outcome)
    }

    /// Drop the persistent connection; called between retries.
    pub fn reset(&self) {
        self.client.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::client::tests::MockTileClient;
    use crate::fetch::client::TileResponse;
    use tempfile::TempDir;

    fn fixture() -> (Arc<TilesetDescriptor>, DiskCacheStore, TempDir) {
        let tileset = Arc::new(
            TilesetDescriptor::new("demo", "tiles.example.org", "/{z}/{x}/{y}.png")
                .with_max_age(Duration::from_secs(7 * 86400)),
        );
        let dir = TempDir::new().unwrap();
        let store = DiskCacheStore::new(dir.path()).unwrap();
        (tileset, store, dir)
    }

    fn no_invalidate() -> InvalidateFn {
        Arc::new(|_| {})
    }

    fn quick_config() -> DownloaderConfig {
        DownloaderConfig {
            workers: 2,
            queue_capacity: 16,
            retry_backoff: Duration::from_millis(10),
            request_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn missing_tile_is_fetched_and_reported() {
        let (tileset, store, _dir) = fixture();
        let clients = vec![MockTileClient::serving(b"tile-image")];
        let (downloader, mut rx) = TileDownloader::spawn_with_clients(
            Arc::clone(&tileset),
            store.clone(),
            no_invalidate(),
            quick_config(),
            clients,
        );

        let tile = TileId::normalized(10, 511, 300);
        assert!(matches!(downloader.lookup(tile, true), TileLookup::Pending));

        let done = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.tile, tile);
        assert!(done.modified);
        assert!(done.ok);
        assert_eq!(
            store.read(&TileKey::new("demo", tile)),
            Some(b"tile-image".to_vec())
        );

        // Cache is now fresh: a second lookup serves from disk.
        assert!(matches!(downloader.lookup(tile, true), TileLookup::Ready(_)));
        downloader.join().await;
    }

    #[tokio::test]
    async fn duplicate_lookups_coalesce_into_one_fetch() {
        let (tileset, store, _dir) = fixture();
        let client = MockTileClient::new(move |_, _| Ok(TileResponse::Image(b"img".to_vec())));
        let calls = Arc::clone(&client.calls);
        let (downloader, mut rx) = TileDownloader::spawn_with_clients(
            tileset,
            store,
            no_invalidate(),
            quick_config(),
            vec![client],
        );

        let tile = TileId::normalized(5, 3, 3);
        downloader.lookup(tile, true);
        downloader.lookup(tile, true);
        downloader.lookup(tile, true);

        let done = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.tile, tile);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        downloader.join().await;
    }

    #[tokio::test]
    async fn stale_tile_serves_placeholder_and_refetches_conditionally() {
        let (tileset, store, _dir) = fixture();
        let tile = TileId::normalized(10, 1, 1);
        let key = TileKey::new("demo", tile);
        store.write_atomic(&key, b"stale-bytes").unwrap();
        let old = std::time::SystemTime::now() - Duration::from_secs(30 * 86400);
        filetime::set_file_mtime(store.path_for(&key), filetime::FileTime::from_system_time(old))
            .unwrap();

        let client = MockTileClient::new(|_, ims| {
            assert!(ims.is_some(), "refetch of a cached tile must be conditional");
            Ok(TileResponse::NotModified)
        });
        let (downloader, mut rx) = TileDownloader::spawn_with_clients(
            tileset,
            store.clone(),
            no_invalidate(),
            quick_config(),
            vec![client],
        );

        match downloader.lookup(tile, true) {
            TileLookup::Stale(bytes) => assert_eq!(bytes, b"stale-bytes".to_vec()),
            other => panic!("expected stale placeholder, got {other:?}"),
        }

        let done = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!done.modified, "304 must not count as a content change");
        assert!(done.ok);
        assert!(store.is_fresh(&key, Duration::from_secs(3600)));
        downloader.join().await;
    }

    #[tokio::test]
    async fn lookup_without_fetch_permission_never_queues() {
        let (tileset, store, _dir) = fixture();
        let (downloader, _rx) = TileDownloader::spawn_with_clients(
            tileset,
            store.clone(),
            no_invalidate(),
            quick_config(),
            vec![MockTileClient::serving(b"x")],
        );

        let tile = TileId::normalized(8, 2, 2);
        assert!(matches!(downloader.lookup(tile, false), TileLookup::Missing));
        assert_eq!(downloader.in_flight_len(), 0);

        // Stale content is served straight without queueing.
        let key = TileKey::new("demo", tile);
        store.write_atomic(&key, b"old").unwrap();
        let old = std::time::SystemTime::now() - Duration::from_secs(30 * 86400);
        filetime::set_file_mtime(store.path_for(&key), filetime::FileTime::from_system_time(old))
            .unwrap();
        assert!(matches!(downloader.lookup(tile, false), TileLookup::Ready(_)));
        assert_eq!(downloader.in_flight_len(), 0);
        downloader.join().await;
    }

    #[tokio::test]
    async fn invalidation_runs_before_completion_is_visible() {
        let (tileset, store, _dir) = fixture();
        let invalidated: Arc<Mutex<Vec<TileId>>> = Arc::new(Mutex::new(Vec::new()));
        let hook: InvalidateFn = {
            let invalidated = Arc::clone(&invalidated);
            Arc::new(move |tile| invalidated.lock().unwrap().push(tile))
        };
        let (downloader, mut rx) = TileDownloader::spawn_with_clients(
            tileset,
            store,
            hook,
            quick_config(),
            vec![MockTileClient::serving(b"fresh")],
        );

        let tile = TileId::normalized(9, 4, 4);
        downloader.lookup(tile, true);
        let done = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(done.modified);
        assert_eq!(
            invalidated.lock().unwrap().as_slice(),
            &[tile],
            "invalidation must already have happened when the completion arrives"
        );
        downloader.join().await;
    }

    #[tokio::test]
    async fn transport_failure_retries_after_reset() {
        let (tileset, store, _dir) = fixture();
        let attempts = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let client = {
            let attempts = Arc::clone(&attempts);
            MockTileClient::new(move |_, _| {
                if attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                    Err(FetchError::Transport("connection refused".into()))
                } else {
                    Ok(TileResponse::Image(b"eventually".to_vec()))
                }
            })
        };
        let resets = Arc::clone(&client.resets);
        let (downloader, mut rx) = TileDownloader::spawn_with_clients(
            tileset,
            store.clone(),
            no_invalidate(),
            quick_config(),
            vec![client],
        );

        let tile = TileId::normalized(6, 1, 1);
        downloader.lookup(tile, true);
        let done = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(done.ok);
        assert_eq!(resets.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(
            store.read(&TileKey::new("demo", tile)),
            Some(b"eventually".to_vec())
        );
        downloader.join().await;
    }

    #[tokio::test]
    async fn abandoned_fetch_reports_failure_without_retry() {
        let (tileset, store, _dir) = fixture();
        let client = MockTileClient::new(|_, _| Err(FetchError::Status { status: 404 }));
        let calls = Arc::clone(&client.calls);
        let (downloader, mut rx) = TileDownloader::spawn_with_clients(
            tileset,
            store.clone(),
            no_invalidate(),
            quick_config(),
            vec![client],
        );

        let tile = TileId::normalized(7, 3, 3);
        downloader.lookup(tile, true);
        let done = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!done.ok);
        assert!(!done.modified);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(downloader.in_flight_len(), 0, "failed tile can be re-asked later");
        downloader.join().await;
    }

    #[tokio::test]
    async fn shutdown_stops_workers_promptly() {
        let (tileset, store, _dir) = fixture();
        let (downloader, _rx) = TileDownloader::spawn_with_clients(
            tileset,
            store,
            no_invalidate(),
            quick_config(),
            vec![MockTileClient::serving(b"x"), MockTileClient::serving(b"y")],
        );
        tokio::time::timeout(Duration::from_secs(1), downloader.join())
            .await
            .expect("workers exit on shutdown");
    }

    #[tokio::test]
    async fn sync_fetcher_skips_fresh_tiles() {
        let (tileset, store, _dir) = fixture();
        let tile = TileId::normalized(10, 2, 2);
        store.write_atomic(&TileKey::new("demo", tile), b"fresh").unwrap();

        let client = MockTileClient::serving(b"never-used");
        let fetcher = SyncFetcher::with_client(tileset, store, client);
        let outcome = fetcher.fetch(tile).await.unwrap();
        assert_eq!(outcome, FetchOutcome::Fresh);
        assert_eq!(fetcher.client.call_count(), 0, "fresh tile issues no request");
    }

    #[tokio::test]
    async fn sync_fetcher_downloads_missing_tiles() {
        let (tileset, store, _dir) = fixture();
        let tile = TileId::normalized(10, 8, 8);
        let fetcher =
            SyncFetcher::with_client(tileset, store.clone(), MockTileClient::serving(b"dl"));

        let outcome = fetcher.fetch(tile).await.unwrap();
        assert_eq!(outcome, FetchOutcome::Downloaded);
        assert_eq!(store.read(&TileKey::new("demo", tile)), Some(b"dl".to_vec()));
    }
}
