//! Cached sync status of the trusted node of a project.
//!
//! Readers always get the cached value immediately. When the value is older than the
//! refresh interval, the reader kicks off a background refresh unless one is already
//! running; concurrent readers inside the interval reuse the cached (possibly stale)
//! value and never wait for the fetch.

use crate::metrics_defs::SYNC_STATUS_REFRESH;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use shared::counter;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum SyncStatusError {
    #[error("sync status request failed: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("sync status endpoint returned {0}")]
    BadStatus(reqwest::StatusCode),
    #[error("sync status request timed out")]
    Timeout,
    #[error("invalid block height: {0}")]
    InvalidHeight(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct SyncStatus {
    pub earliest_height: u64,
    pub latest_height: u64,
    pub catching_up: bool,
    pub refreshed_at: SystemTime,
}

/// Source of the trusted node's status.
#[async_trait]
pub trait SyncStatusSource: Send + Sync {
    async fn fetch_status(&self, url: &Url) -> Result<SyncStatus, SyncStatusError>;
}

/// Fetches the node status document over HTTP.
pub struct HttpSyncStatusSource {
    client: reqwest::Client,
}

impl HttpSyncStatusSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StatusDocument {
    Wrapped { result: StatusResult },
    Bare(StatusResult),
}

#[derive(Deserialize)]
struct StatusResult {
    sync_info: SyncInfo,
}

#[derive(Deserialize)]
struct SyncInfo {
    earliest_block_height: HeightValue,
    latest_block_height: HeightValue,
    #[serde(default)]
    catching_up: bool,
}

/// Node status documents encode heights either as strings or as numbers.
#[derive(Deserialize)]
#[serde(untagged)]
enum HeightValue {
    Number(u64),
    String(String),
}

impl HeightValue {
    fn parse(self) -> Result<u64, SyncStatusError> {
        match self {
            HeightValue::Number(n) => Ok(n),
            HeightValue::String(s) => s.parse().map_err(|_| SyncStatusError::InvalidHeight(s)),
        }
    }
}

impl TryFrom<StatusDocument> for SyncStatus {
    type Error = SyncStatusError;

    fn try_from(document: StatusDocument) -> Result<Self, Self::Error> {
        let (StatusDocument::Wrapped { result } | StatusDocument::Bare(result)) = document;
        let info = result.sync_info;

        Ok(SyncStatus {
            earliest_height: info.earliest_block_height.parse()?,
            latest_height: info.latest_block_height.parse()?,
            catching_up: info.catching_up,
            refreshed_at: SystemTime::now(),
        })
    }
}

#[async_trait]
impl SyncStatusSource for HttpSyncStatusSource {
    async fn fetch_status(&self, url: &Url) -> Result<SyncStatus, SyncStatusError> {
        let response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(SyncStatusError::BadStatus(response.status()));
        }

        let document = response.json::<StatusDocument>().await?;
        SyncStatus::try_from(document)
    }
}

struct SyncStatusCacheInner {
    project: String,
    url: Url,
    source: Arc<dyn SyncStatusSource>,
    refresh_interval: Duration,
    fetch_timeout: Duration,
    status: RwLock<Option<SyncStatus>>,
    last_attempt: RwLock<Option<Instant>>,
    // Only one refresh may be in flight at a time
    update_lock: Semaphore,
    // Set once the first refresh attempt has finished, successful or not
    ready: AtomicBool,
}

#[derive(Clone)]
pub struct SyncStatusCache {
    inner: Arc<SyncStatusCacheInner>,
}

impl SyncStatusCache {
    pub fn new(
        project: String,
        url: Url,
        source: Arc<dyn SyncStatusSource>,
        refresh_interval: Duration,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SyncStatusCacheInner {
                project,
                url,
                source,
                refresh_interval,
                fetch_timeout,
                status: RwLock::new(None),
                last_attempt: RwLock::new(None),
                update_lock: Semaphore::new(1),
                ready: AtomicBool::new(false),
            }),
        }
    }

    /// Returns the cached status, scheduling a background refresh when it is due.
    /// Must be called from within a tokio runtime.
    pub fn current(&self) -> Option<SyncStatus> {
        if self.refresh_due(Instant::now()) {
            let cache = self.clone();
            tokio::spawn(async move {
                cache.refresh().await;
            });
        }
        self.cached()
    }

    /// Returns the cached status without scheduling anything.
    pub fn cached(&self) -> Option<SyncStatus> {
        self.inner.status.read().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Relaxed)
    }

    fn refresh_due(&self, now: Instant) -> bool {
        match *self.inner.last_attempt.read() {
            Some(last) => now.saturating_duration_since(last) >= self.inner.refresh_interval,
            None => true,
        }
    }

    /// Fetches a fresh status unless another refresh is already running.
    /// A failed fetch keeps the previous value.
    pub async fn refresh(&self) {
        let inner = &self.inner;
        let Ok(_permit) = inner.update_lock.try_acquire() else {
            return;
        };

        // Re-check under the permit so back-to-back callers don't refetch
        let now = Instant::now();
        if !self.refresh_due(now) {
            return;
        }
        *inner.last_attempt.write() = Some(now);

        let result = match timeout(inner.fetch_timeout, inner.source.fetch_status(&inner.url)).await
        {
            Ok(result) => result,
            Err(_) => Err(SyncStatusError::Timeout),
        };

        match result {
            Ok(status) => {
                tracing::debug!(
                    project = %inner.project,
                    earliest = status.earliest_height,
                    latest = status.latest_height,
                    catching_up = status.catching_up,
                    "sync status refreshed"
                );
                counter!(SYNC_STATUS_REFRESH, "project" => inner.project.clone(), "result" => "ok")
                    .increment(1);
                *inner.status.write() = Some(status);
            }
            Err(e) => {
                tracing::warn!(project = %inner.project, error = %e, "sync status refresh failed");
                counter!(
                    SYNC_STATUS_REFRESH,
                    "project" => inner.project.clone(),
                    "result" => "error"
                )
                .increment(1);
            }
        }

        inner.ready.store(true, Ordering::Relaxed);
    }
}
