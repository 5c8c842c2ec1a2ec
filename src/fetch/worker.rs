//! Fetch workers: the shared conditional-GET algorithm and the loop each
//! pool member runs.
//!
//! Transport errors are the only failures a worker fights: it resets its
//! client, backs off a fixed interval and retries the same tile. Protocol
//! and storage failures give the tile up for this cycle; the worker moves
//! on and a later viewport change can request the tile again.

use crate::cache::DiskCacheStore;
use crate::coord::TileId;
use crate::fetch::client::{TileClient, TileResponse};
use crate::fetch::queue::{FetchQueue, FetchRequest};
use crate::fetch::{FetchError, FetchOutcome};
use crate::tileset::TilesetDescriptor;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Completion report for one queued fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchComplete {
    pub tile: TileId,
    /// Whether tile content on disk changed (false for a 304 refresh)
    pub modified: bool,
    /// Whether the tile is now present and current on disk
    pub ok: bool,
}

/// Everything a worker shares with its pool.
pub(crate) struct WorkerContext {
    pub tileset: Arc<TilesetDescriptor>,
    pub store: DiskCacheStore,
    pub queue: Arc<FetchQueue>,
    pub in_flight: Arc<Mutex<HashSet<TileId>>>,
    pub completions: mpsc::UnboundedSender<FetchComplete>,
    /// Invoked before the completion is reported whenever tile content
    /// changed, so stale decoded copies cannot outlive the notification.
    pub invalidate: Arc<dyn Fn(TileId) + Send + Sync>,
    pub backoff: Duration,
    pub shutdown: CancellationToken,
}

/// One fetch attempt: conditional GET, then cache update.
///
/// `Err` is returned only for retryable transport failures; protocol and
/// storage problems are logged and collapse to [`FetchOutcome::Abandoned`].
pub(crate) async fn fetch_tile<C: TileClient>(
    client: &C,
    tileset: &TilesetDescriptor,
    store: &DiskCacheStore,
    request: &FetchRequest,
) -> Result<FetchOutcome, FetchError> {
    let response = match client
        .get_tile(&request.url, &tileset.extra_headers, request.prior_mtime)
        .await
    {
        Ok(response) => response,
        Err(e) if e.is_retryable() => return Err(e),
        Err(e) => {
            debug!(key = %request.key, error = %e, "giving tile up for this cycle");
            return Ok(FetchOutcome::Abandoned);
        }
    };

    match response {
        TileResponse::NotModified => {
            if let Err(e) = store.touch(&request.key) {
                warn!(key = %request.key, error = %e, "could not refresh tile mtime");
                return Ok(FetchOutcome::Abandoned);
            }
            Ok(FetchOutcome::NotModified)
        }
        TileResponse::Image(bytes) => {
            if let Err(e) = store.write_atomic(&request.key, &bytes) {
                warn!(key = %request.key, error = %e, "could not store downloaded tile");
                return Ok(FetchOutcome::Abandoned);
            }
            debug!(
                key = %request.key,
                path = %request.local_path.display(),
                bytes = bytes.len(),
                "tile downloaded"
            );
            Ok(FetchOutcome::Downloaded)
        }
    }
}

/// Loop run by each pool worker until shutdown or queue close.
pub(crate) async fn worker_loop<C: TileClient>(ctx: WorkerContext, client: C, worker_id: usize) {
    debug!(worker_id, tileset = %ctx.tileset.id, "fetch worker starting");
    loop {
        tokio::select! {
            biased;
            _ = ctx.shutdown.cancelled() => break,
            request = ctx.queue.pop() => {
                let Some(request) = request else { break };
                process_request(&ctx, &client, request).await;
            }
        }
    }
    debug!(worker_id, "fetch worker exiting");
}

async fn process_request<C: TileClient>(ctx: &WorkerContext, client: &C, request: FetchRequest) {
    let outcome = loop {
        match fetch_tile(client, &ctx.tileset, &ctx.store, &request).await {
            Ok(outcome) => break outcome,
            Err(e) => {
                warn!(key = %request.key, error = %e, "transport failure, resetting and backing off");
                client.reset();
                tokio::select! {
                    _ = ctx.shutdown.cancelled() => break FetchOutcome::Abandoned,
                    _ = tokio::time::sleep(ctx.backoff) => {}
                }
            }
        }
    };

    let (modified, ok) = match outcome {
        FetchOutcome::Downloaded => (true, true),
        FetchOutcome::NotModified | FetchOutcome::Fresh => (false, true),
        FetchOutcome::Abandoned => (false, false),
    };

    // Invalidation strictly precedes the completion report so the
    // consumer can never re-read a superseded decode after hearing the
    // tile changed.
    if modified {
        (ctx.invalidate)(request.key.tile);
    }
    ctx.in_flight
        .lock()
        .expect("in-flight lock poisoned")
        .remove(&request.key.tile);
    let _ = ctx.completions.send(FetchComplete {
        tile: request.key.tile,
        modified,
        ok,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DiskCacheStore;
    use crate::coord::TileKey;
    use crate::fetch::client::tests::MockTileClient;
    use std::time::SystemTime;
    use tempfile::TempDir;

    fn fixture() -> (Arc<TilesetDescriptor>, DiskCacheStore, TempDir, FetchRequest) {
        let tileset = Arc::new(TilesetDescriptor::new(
            "demo",
            "tiles.example.org",
            "/{z}/{x}/{y}.png",
        ));
        let dir = TempDir::new().unwrap();
        let store = DiskCacheStore::new(dir.path()).unwrap();
        let tile = TileId::normalized(10, 511, 300);
        let key = TileKey::new("demo", tile);
        let request = FetchRequest {
            local_path: store.path_for(&key),
            url: tileset.url_for(tile),
            key,
            prior_mtime: None,
        };
        (tileset, store, dir, request)
    }

    #[tokio::test]
    async fn downloaded_tile_lands_on_disk() {
        let (tileset, store, _dir, request) = fixture();
        let client = MockTileClient::serving(b"png-bytes");

        let outcome = fetch_tile(&client, &tileset, &store, &request).await.unwrap();
        assert_eq!(outcome, FetchOutcome::Downloaded);
        assert_eq!(store.read(&request.key), Some(b"png-bytes".to_vec()));
    }

    #[tokio::test]
    async fn not_modified_refreshes_without_rewrite() {
        let (tileset, store, _dir, mut request) = fixture();
        store.write_atomic(&request.key, b"old-bytes").unwrap();
        let stale = SystemTime::now() - Duration::from_secs(7200);
        filetime::set_file_mtime(
            store.path_for(&request.key),
            filetime::FileTime::from_system_time(stale),
        )
        .unwrap();
        request.prior_mtime = Some(stale);

        let client = MockTileClient::new(|_, ims| {
            assert!(ims.is_some(), "stale tile must be fetched conditionally");
            Ok(TileResponse::NotModified)
        });

        let outcome = fetch_tile(&client, &tileset, &store, &request).await.unwrap();
        assert_eq!(outcome, FetchOutcome::NotModified);
        assert_eq!(store.read(&request.key), Some(b"old-bytes".to_vec()));
        assert!(store.is_fresh(&request.key, Duration::from_secs(3600)));
    }

    #[tokio::test]
    async fn protocol_failure_abandons_the_tile() {
        let (tileset, store, _dir, request) = fixture();
        let client = MockTileClient::new(|_, _| Err(FetchError::Status { status: 404 }));

        let outcome = fetch_tile(&client, &tileset, &store, &request).await.unwrap();
        assert_eq!(outcome, FetchOutcome::Abandoned);
        assert_eq!(store.read(&request.key), None);
    }

    #[tokio::test]
    async fn transport_failure_propagates_for_retry() {
        let (tileset, store, _dir, request) = fixture();
        let client =
            MockTileClient::new(|_, _| Err(FetchError::Transport("connection reset".into())));

        let result = fetch_tile(&client, &tileset, &store, &request).await;
        assert!(matches!(result, Err(FetchError::Transport(_))));
    }
}
