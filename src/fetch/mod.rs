//! Tile fetching: bounded work queue, worker pool, and the shared
//! conditional-GET fetch algorithm.
//!
//! Two operating modes share one fetch algorithm:
//!
//! - **Asynchronous** ([`TileDownloader`]): a fixed pool of workers drains
//!   a bounded queue and reports completions over a channel the consumer's
//!   own loop drains. Used for interactive display.
//! - **Synchronous** ([`SyncFetcher`]): the fetch runs on the caller's own
//!   task and returns once the tile is on disk or has definitively
//!   failed. Used for precaching and print-style rendering.

mod client;
mod downloader;
mod queue;
mod worker;

pub use client::{ReqwestTileClient, TileClient, TileResponse};
pub use downloader::{DownloaderConfig, InvalidateFn, SyncFetcher, TileDownloader};
pub use queue::{Enqueued, FetchQueue, FetchRequest, DEFAULT_QUEUE_CAPACITY};
pub use worker::FetchComplete;

#[cfg(test)]
pub(crate) use client::tests::MockTileClient;

use crate::cache::CacheError;
use thiserror::Error;

/// Errors from a single tile fetch attempt.
///
/// Only [`FetchError::Transport`] is retryable; protocol-level problems
/// abandon the tile for this cycle without crashing the worker.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Connection-level failure: refused, reset, timeout, DNS
    #[error("transport error: {0}")]
    Transport(String),

    /// Unexpected HTTP status code
    #[error("unacceptable response status: {status}")]
    Status { status: u16 },

    /// Response body was not an image
    #[error("non-image content type: {0}")]
    ContentType(String),

    /// Server sent an empty body for a tile
    #[error("empty response body")]
    EmptyBody,

    /// Disk cache write/touch failed
    #[error("storage error: {0}")]
    Storage(#[from] CacheError),
}

impl FetchError {
    /// Whether the same request is worth retrying after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transport(_))
    }
}

/// Terminal result of fetching one tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Cache was already fresh; no request was issued
    Fresh,
    /// New content downloaded and written to the disk cache
    Downloaded,
    /// Server confirmed the cached copy is current; freshness refreshed
    NotModified,
    /// Fetch abandoned for this cycle (protocol or storage problem)
    Abandoned,
}

impl FetchOutcome {
    /// Whether the tile is now present and current in the disk cache.
    pub fn is_success(&self) -> bool {
        !matches!(self, FetchOutcome::Abandoned)
    }
}
