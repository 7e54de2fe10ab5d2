//! Headless interactive client
//!
//! Single event-driven main context: every network or filesystem
//! operation runs on its own task and reports back over one event
//! channel. Sync and download are single-flight (their triggers stay
//! disabled while one runs and are re-enabled on every outcome); search
//! is exempt but generation-filtered.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::warn;

use crate::cache::CacheStore;
use crate::config::{AppConfig, SEARCH_ENDPOINT};
use crate::download::{Downloader, HttpClient};
use crate::index::{CatalogIndex, SyncEngine};
use crate::search::{SearchClient, SearchUpdate};
use crate::steam;

/// Events delivered to the main context
#[derive(Debug)]
pub enum AppEvent {
    SyncDone { available: usize, from_cache: bool },
    SyncFailed(String),
    Search(SearchUpdate),
    DownloadProgress { downloaded: u64, total: u64 },
    PatchInstalled { id: String, dest: PathBuf },
    DownloadFailed { id: String, message: String },
    CopyFailed { id: String, message: String },
    Status(String),
}

/// Owned client state; never blocks on its workers.
pub struct App {
    config: AppConfig,
    cache: CacheStore,
    client: Arc<HttpClient>,
    index: Arc<RwLock<CatalogIndex>>,
    search: SearchClient,
    events_tx: mpsc::UnboundedSender<AppEvent>,
    events_rx: mpsc::UnboundedReceiver<AppEvent>,
    sync_active: bool,
    download_active: bool,
}

impl App {
    pub fn new(config: AppConfig) -> Result<Self> {
        config.validate()?;
        let cache = match &config.cache_dir {
            Some(dir) => CacheStore::at(dir.clone())?,
            None => CacheStore::open()?,
        };
        let client = Arc::new(HttpClient::new()?);
        let index = Arc::new(RwLock::new(CatalogIndex::default()));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (search_tx, search_rx) = mpsc::unbounded_channel();
        forward_search_updates(search_rx, events_tx.clone());

        let search = SearchClient::new(
            Arc::clone(&client),
            SEARCH_ENDPOINT.to_string(),
            Arc::clone(&index),
            search_tx,
        );

        Ok(Self {
            config,
            cache,
            client,
            index,
            search,
            events_tx,
            events_rx,
            sync_active: false,
            download_active: false,
        })
    }

    /// Shared availability index (replaced wholesale on sync)
    pub fn index(&self) -> Arc<RwLock<CatalogIndex>> {
        Arc::clone(&self.index)
    }

    pub fn search_mut(&mut self) -> &mut SearchClient {
        &mut self.search
    }

    /// Kick off an index sync. Returns false while one is already running.
    pub fn start_sync(&mut self) -> bool {
        if self.sync_active {
            return false;
        }
        self.sync_active = true;

        let engine = SyncEngine::new(
            Arc::clone(&self.client),
            self.config.index_url(),
            self.cache.clone(),
        );
        let index = Arc::clone(&self.index);
        let tx = self.events_tx.clone();

        tokio::spawn(async move {
            let event = match engine.sync().await {
                Ok(outcome) => {
                    let available = outcome.index.len();
                    *index.write().unwrap() = outcome.index;
                    AppEvent::SyncDone {
                        available,
                        from_cache: outcome.from_cache,
                    }
                }
                Err(e) => AppEvent::SyncFailed(e.to_string()),
            };
            let _ = tx.send(event);
        });
        true
    }

    /// Feed search input (debounced; not subject to single-flight).
    pub fn on_input(&mut self, text: &str) {
        self.search.on_input(text);
    }

    /// Download one artifact and copy it into the plugin directory.
    /// Returns false while a patch operation is already in flight.
    pub fn start_patch(&mut self, id: &str) -> bool {
        if self.download_active {
            return false;
        }
        self.download_active = true;

        let id = id.to_string();
        let url = self.config.artifact_url(&id);
        let config = self.config.clone();
        let downloader = Downloader::new(Arc::clone(&self.client), self.cache.clone());
        let tx = self.events_tx.clone();

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        {
            let tx = tx.clone();
            tokio::spawn(async move {
                while let Some((downloaded, total)) = progress_rx.recv().await {
                    let _ = tx.send(AppEvent::DownloadProgress { downloaded, total });
                }
            });
        }

        tokio::spawn(async move {
            let _ = tx.send(AppEvent::Status("Downloading patch...".to_string()));
            let event = match downloader.download(&url, &id, Some(&progress_tx)).await {
                Ok(cached) => match steam::install_patch(&config, &cached, &id) {
                    Ok(dest) => AppEvent::PatchInstalled { id, dest },
                    Err(e) => AppEvent::CopyFailed {
                        id,
                        message: e.to_string(),
                    },
                },
                Err(e) => AppEvent::DownloadFailed {
                    id,
                    message: e.to_string(),
                },
            };
            let _ = tx.send(event);
        });
        true
    }

    /// Restart the external application (fire-and-report).
    pub fn start_restart(&self) {
        let config = self.config.clone();
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let message = match steam::restart_app(&config).await {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("{e}");
                    format!("Error: {e}")
                }
            };
            let _ = tx.send(AppEvent::Status(message));
        });
    }

    /// Receive the next event, maintaining the single-flight guards and
    /// dropping stale search results at the consumption point.
    pub async fn next_event(&mut self) -> Option<AppEvent> {
        loop {
            let event = self.events_rx.recv().await?;
            match &event {
                AppEvent::SyncDone { .. } | AppEvent::SyncFailed(_) => {
                    self.sync_active = false;
                }
                AppEvent::PatchInstalled { .. }
                | AppEvent::DownloadFailed { .. }
                | AppEvent::CopyFailed { .. } => {
                    self.download_active = false;
                }
                AppEvent::Search(
                    SearchUpdate::Results { generation, .. }
                    | SearchUpdate::Failed { generation, .. },
                ) => {
                    if *generation != self.search.current_generation() {
                        continue;
                    }
                }
                _ => {}
            }
            return Some(event);
        }
    }
}

fn forward_search_updates(
    mut rx: mpsc::UnboundedReceiver<SearchUpdate>,
    tx: mpsc::UnboundedSender<AppEvent>,
) {
    tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            if tx.send(AppEvent::Search(update)).is_err() {
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Router};
    use std::time::Duration;
    use tempfile::tempdir;

    async fn spawn_patch_server() -> String {
        let router = Router::new()
            .route(
                "/api/games_index.json",
                get(|| async { r#"{"app_ids": ["730", "440"]}"# }),
            )
            .route("/lua/730.lua", get(|| async { "-- patch for 730" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    async fn expect_event(app: &mut App) -> AppEvent {
        tokio::time::timeout(Duration::from_secs(5), app.next_event())
            .await
            .expect("event timeout")
            .expect("channel closed")
    }

    fn test_app(server: String, root: &std::path::Path) -> App {
        App::new(AppConfig {
            server_url: server,
            plugin_dir: root.join("stplug-in"),
            cache_dir: Some(root.join("cache")),
            ..AppConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_sync_then_patch_flow() {
        let server = spawn_patch_server().await;
        let dir = tempdir().unwrap();
        let mut app = test_app(server, dir.path());

        assert!(app.start_sync());
        assert!(!app.start_sync(), "sync must be single-flight");

        match expect_event(&mut app).await {
            AppEvent::SyncDone {
                available,
                from_cache,
            } => {
                assert_eq!(available, 2);
                assert!(!from_cache);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(app.index().read().unwrap().is_available("730"));

        assert!(app.start_patch("730"));
        assert!(!app.start_patch("730"), "download must be single-flight");

        loop {
            match expect_event(&mut app).await {
                AppEvent::PatchInstalled { id, dest } => {
                    assert_eq!(id, "730");
                    assert_eq!(std::fs::read(dest).unwrap(), b"-- patch for 730");
                    break;
                }
                AppEvent::DownloadProgress { downloaded, total } => {
                    assert!(downloaded <= total || total == 0);
                }
                AppEvent::Status(_) => {}
                other => panic!("unexpected event: {other:?}"),
            }
        }

        // The trigger is re-enabled after completion.
        assert!(app.start_patch("730"));
    }

    #[tokio::test]
    async fn test_download_failure_reenables_trigger() {
        let server = spawn_patch_server().await;
        let dir = tempdir().unwrap();
        let mut app = test_app(server, dir.path());

        assert!(app.start_patch("999"));
        loop {
            match expect_event(&mut app).await {
                AppEvent::DownloadFailed { id, message } => {
                    assert_eq!(id, "999");
                    assert!(message.contains("404"), "got: {message}");
                    break;
                }
                AppEvent::Status(_) | AppEvent::DownloadProgress { .. } => {}
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(app.start_patch("999"));
    }

    #[tokio::test]
    async fn test_sync_failure_keeps_app_usable() {
        let dir = tempdir().unwrap();
        let mut app = test_app("http://127.0.0.1:1".to_string(), dir.path());

        assert!(app.start_sync());
        match expect_event(&mut app).await {
            AppEvent::SyncFailed(message) => assert!(!message.is_empty()),
            other => panic!("unexpected event: {other:?}"),
        }

        // Degraded mode: search still runs against the empty index.
        assert!(app.index().read().unwrap().is_empty());
        assert!(app.start_sync(), "sync can be retried after failure");
    }
}
