//! Pull-based cache of a remote daemon's `/api/all`.
//!
//! Reads never touch the network; `refresh` does, and a failed refresh
//! leaves the previous snapshot in place.

use crate::types::MetricSnapshot;
use log::{debug, warn};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
struct Cached {
    snapshot: MetricSnapshot,
    fetched_at: Instant,
}

pub struct SnapshotCache {
    client: reqwest::Client,
    url: String,
    cached: RwLock<Option<Cached>>,
}

impl SnapshotCache {
    pub fn new(base_url: &str) -> Result<Self, reqwest::Error> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: format!("{}/api/all", base_url.trim_end_matches('/')),
            cached: RwLock::new(None),
        })
    }

    /// Fetch a fresh snapshot and store it.
    pub async fn refresh(&self) -> Result<MetricSnapshot, reqwest::Error> {
        let snapshot: MetricSnapshot = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!("[remote] refreshed snapshot from {}", self.url);
        *self.cached.write().await = Some(Cached {
            snapshot: snapshot.clone(),
            fetched_at: Instant::now(),
        });
        Ok(snapshot)
    }

    /// Refresh, falling back to the last good snapshot on failure.
    pub async fn refresh_or_stale(&self) -> Option<MetricSnapshot> {
        match self.refresh().await {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                warn!("[remote] fetch from {} failed: {err}", self.url);
                self.current().await
            }
        }
    }

    /// Last good snapshot, however old.
    pub async fn current(&self) -> Option<MetricSnapshot> {
        self.cached.read().await.as_ref().map(|c| c.snapshot.clone())
    }

    pub async fn age(&self) -> Option<Duration> {
        self.cached.read().await.as_ref().map(|c| c.fetched_at.elapsed())
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}
