//! HTTP seam for tile fetching.
//!
//! Workers talk to a [`TileClient`] rather than to reqwest directly, so
//! tests drive the whole fetch pipeline with a scripted client and no
//! network. The real client issues conditional GETs and classifies the
//! response before any bytes reach the cache.

use crate::fetch::FetchError;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Identifies this library to tile servers.
pub const DEFAULT_USER_AGENT: &str = concat!("slippytile/", env!("CARGO_PKG_VERSION"));

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Classified tile server response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TileResponse {
    /// 304: the cached copy is still current
    NotModified,
    /// 200 with a validated image body
    Image(Vec<u8>),
}

/// One conditional tile request against a tile server.
pub trait TileClient: Send + Sync {
    /// Fetch a tile, conditionally when `if_modified_since` is set.
    ///
    /// Returns [`TileResponse::NotModified`] on a 304, the validated body
    /// on a 200, and an error for everything else.
    fn get_tile(
        &self,
        url: &str,
        headers: &[(String, String)],
        if_modified_since: Option<SystemTime>,
    ) -> impl Future<Output = Result<TileResponse, FetchError>> + Send;

    /// Discard the persistent connection after a transport failure so the
    /// retry starts from a clean slate.
    fn reset(&self);
}

/// reqwest-backed client with a persistent connection pool.
pub struct ReqwestTileClient {
    client: Mutex<reqwest::Client>,
    timeout: Duration,
}

impl ReqwestTileClient {
    /// Build a client with the default timeout.
    pub fn new() -> Result<Self, FetchError> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    /// Build a client with a custom per-request timeout.
    pub fn with_timeout(timeout: Duration) -> Result<Self, FetchError> {
        Ok(Self {
            client: Mutex::new(build_client(timeout)?),
            timeout,
        })
    }
}

fn build_client(timeout: Duration) -> Result<reqwest::Client, FetchError> {
    reqwest::Client::builder()
        .user_agent(DEFAULT_USER_AGENT)
        .timeout(timeout)
        .pool_max_idle_per_host(1)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .tcp_nodelay(true)
        .build()
        .map_err(|e| FetchError::Transport(e.to_string()))
}

impl TileClient for ReqwestTileClient {
    async fn get_tile(
        &self,
        url: &str,
        headers: &[(String, String)],
        if_modified_since: Option<SystemTime>,
    ) -> Result<TileResponse, FetchError> {
        // reqwest::Client is a handle onto a shared pool; cloning out of
        // the lock keeps the request itself outside the critical section.
        let client = self.client.lock().expect("client lock poisoned").clone();

        let mut request = client.get(url);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        if let Some(mtime) = if_modified_since {
            request = request.header("If-Modified-Since", http_date(mtime));
        }

        let response = request
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_MODIFIED {
            debug!(url, "tile not modified");
            return Ok(TileResponse::NotModified);
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        validate_tile_response(status.as_u16(), content_type.as_deref(), response.content_length())?;

        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        if bytes.is_empty() {
            return Err(FetchError::EmptyBody);
        }
        Ok(TileResponse::Image(bytes.to_vec()))
    }

    fn reset(&self) {
        match build_client(self.timeout) {
            Ok(fresh) => {
                *self.client.lock().expect("client lock poisoned") = fresh;
                debug!("http client reset");
            }
            Err(e) => warn!(error = %e, "http client reset failed, keeping old client"),
        }
    }
}

/// Reject any 200 response that is not plausibly a tile image.
///
/// Servers answer tile URLs with HTML error pages and zero-length bodies
/// often enough that this gate runs before anything touches the cache.
fn validate_tile_response(
    status: u16,
    content_type: Option<&str>,
    content_length: Option<u64>,
) -> Result<(), FetchError> {
    if status != 200 {
        return Err(FetchError::Status { status });
    }
    match content_type {
        Some(ct) if ct.starts_with("image/") => {}
        Some(ct) => return Err(FetchError::ContentType(ct.to_owned())),
        None => return Err(FetchError::ContentType("missing".to_owned())),
    }
    if content_length == Some(0) {
        return Err(FetchError::EmptyBody);
    }
    Ok(())
}

/// Format a timestamp as an RFC 7231 HTTP date (`If-Modified-Since`).
pub fn http_date(t: SystemTime) -> String {
    let dt: chrono::DateTime<chrono::Utc> = t.into();
    dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
