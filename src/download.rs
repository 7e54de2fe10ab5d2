//! Artifact download engine
//!
//! Streams one artifact per request into the local cache with throttled
//! progress reporting. The copy into the plugin directory is a separate
//! step (`steam::install_patch`) so its failures report distinctly.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;

use crate::cache::CacheStore;
use crate::config::NETWORK_TIMEOUT;

/// Minimum gap between progress emissions
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Connection timeout: time to establish the TCP connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared HTTP client for index, search and artifact requests
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("luapatch/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(NETWORK_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }

    /// Get the underlying reqwest client
    pub fn inner(&self) -> &reqwest::Client {
        &self.client
    }
}

/// Progress event: (bytes downloaded, bytes total). Total is 0 when the
/// server omits a Content-Length header.
pub type Progress = (u64, u64);

/// Network or local I/O failure while fetching an artifact
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("HTTP {0} from artifact endpoint")]
    Status(u16),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Local I/O error: {0}")]
    Io(String),
}

/// Downloads artifacts into the cache store.
pub struct Downloader {
    client: Arc<HttpClient>,
    cache: CacheStore,
}

impl Downloader {
    pub fn new(client: Arc<HttpClient>, cache: CacheStore) -> Self {
        Self { client, cache }
    }

    /// Fetch one artifact and place it in the cache atomically.
    ///
    /// Progress events are throttled to one per 100 ms, are non-decreasing,
    /// and always end with a final (total, total) emission when the server
    /// declared a length.
    pub async fn download(
        &self,
        url: &str,
        id: &str,
        progress: Option<&mpsc::UnboundedSender<Progress>>,
    ) -> Result<PathBuf, DownloadError> {
        let response = self
            .client
            .inner()
            .get(url)
            .send()
            .await
            .map_err(|e| DownloadError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status(status.as_u16()));
        }

        let total = response.content_length().unwrap_or(0);
        let mut downloaded = 0u64;
        let mut body: Vec<u8> = Vec::with_capacity(total as usize);
        let mut last_emit = Instant::now() - PROGRESS_INTERVAL;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| DownloadError::Network(e.to_string()))?;
            body.extend_from_slice(&chunk);
            downloaded += chunk.len() as u64;

            if let Some(tx) = progress {
                // Throttle so a fast transfer cannot flood the consumer.
                if total > 0 && last_emit.elapsed() >= PROGRESS_INTERVAL {
                    let _ = tx.send((downloaded, total));
                    last_emit = Instant::now();
                }
            }
        }

        if let Some(tx) = progress {
            let _ = tx.send((downloaded, total));
        }

        debug!("Downloaded {}: {} bytes", id, downloaded);

        self.cache
            .write_artifact(id, &body)
            .map_err(|e| DownloadError::Io(format!("{e:#}")))
    }
}
