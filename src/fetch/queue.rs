//! Bounded fetch queue shared by the worker pool.
//!
//! Requests are *prepended*: the consumer's latest viewport wins, and
//! tiles queued for a view the user has already panned away from drain
//! last. On overflow the oldest queued request is displaced so the queue
//! never grows without bound during a fast pan.

use crate::coord::TileKey;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;
use tokio::sync::Notify;
use tracing::debug;

/// Default bound on queued (not yet started) requests.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// One unit of fetch work, fully resolved at enqueue time.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub key: TileKey,
    /// Destination file in the disk cache
    pub local_path: PathBuf,
    pub url: String,
    /// mtime of the stale cached copy, if one exists; drives the
    /// conditional request
    pub prior_mtime: Option<SystemTime>,
}

/// Result of offering a request to the queue.
#[derive(Debug)]
pub enum Enqueued {
    /// Queued without displacing anything
    Accepted,
    /// Queued, but the oldest pending request was dropped to make room
    Displaced(FetchRequest),
    /// Queue is closed; the request was not queued
    Rejected(FetchRequest),
}

/// Bounded LIFO-biased queue with async blocking pop.
pub struct FetchQueue {
    inner: Mutex<VecDeque<FetchRequest>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
}

impl FetchQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Prepend a request so it is served before everything already queued.
    pub fn push_front(&self, request: FetchRequest) -> Enqueued {
        if self.closed.load(Ordering::Acquire) {
            return Enqueued::Rejected(request);
        }
        let displaced = {
            let mut queue = self.inner.lock().expect("queue lock poisoned");
            queue.push_front(request);
            if queue.len() > self.capacity {
                queue.pop_back()
            } else {
                None
            }
        };
        self.notify.notify_one();
        match displaced {
            Some(victim) => {
                debug!(key = %victim.key, "fetch queue full, dropping oldest request");
                Enqueued::Displaced(victim)
            }
            None => Enqueued::Accepted,
        }
    }

    /// Wait for the next request. Returns `None` once the queue is closed;
    /// requests still queued at close time are discarded, not served.
    pub async fn pop(&self) -> Option<FetchRequest> {
        loop {
            // Register interest before re-checking state, otherwise a
            // push landing between the check and the await is missed.
            let notified = self.notify.notified();
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            let popped = {
                let mut queue = self.inner.lock().expect("queue lock poisoned");
                let request = queue.pop_front();
                (request, !queue.is_empty())
            };
            match popped {
                (Some(request), more) => {
                    // Pass the wakeup along for a sibling worker.
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(request);
                }
                (None, _) => notified.await,
            }
        }
    }

    /// Close the queue: discard pending requests and wake every worker so
    /// they observe the close and exit.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.inner.lock().expect("queue lock poisoned").clear();
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
