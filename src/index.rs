//! Catalog index and the startup sync engine
//!
//! The remote index has appeared in two shapes across server revisions:
//! a bare `{"app_ids": [...]}` array and a richer `{"games": [{id, name}]}`
//! list. Both are accepted here, and ids may be JSON numbers or strings.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cache::CacheStore;
use crate::download::HttpClient;

/// Set of identifiers with a patch available, plus any display names the
/// index carried. Replaced wholesale on every successful sync.
#[derive(Debug, Clone, Default)]
pub struct CatalogIndex {
    ids: HashSet<String>,
    names: HashMap<String, String>,
}

#[derive(Deserialize)]
struct IndexPayload {
    #[serde(default)]
    app_ids: Vec<serde_json::Value>,
    #[serde(default)]
    games: Vec<GameEntry>,
}

#[derive(Deserialize)]
struct GameEntry {
    id: serde_json::Value,
    #[serde(default)]
    name: Option<String>,
}

/// Normalize a JSON id (number or string) to its string form.
pub fn id_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl CatalogIndex {
    /// Parse a raw index document into the available-id set.
    pub fn from_payload(payload: &str) -> Result<Self> {
        let parsed: IndexPayload =
            serde_json::from_str(payload).context("Invalid index document")?;

        let mut ids = HashSet::new();
        let mut names = HashMap::new();

        for value in &parsed.app_ids {
            if let Some(id) = id_to_string(value) {
                ids.insert(id);
            }
        }
        for game in &parsed.games {
            if let Some(id) = id_to_string(&game.id) {
                if let Some(name) = &game.name {
                    names.insert(id.clone(), name.clone());
                }
                ids.insert(id);
            }
        }

        Ok(Self { ids, names })
    }

    /// O(1) membership test against the available set
    pub fn is_available(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn name_of(&self, id: &str) -> Option<&str> {
        self.names.get(id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }
}

/// Stage markers emitted while a sync runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    Connecting,
    Downloading,
    UsingCache,
}

/// Both the network and the on-disk cache were unusable.
#[derive(Debug, thiserror::Error)]
#[error("Index unavailable: {network}; cache: {cache}")]
pub struct SyncError {
    pub network: String,
    pub cache: String,
}

/// Result of a sync, flagged when served from the offline cache
#[derive(Debug)]
pub struct SyncOutcome {
    pub index: CatalogIndex,
    pub from_cache: bool,
}

/// Fetches the remote index with cache fallback.
pub struct SyncEngine {
    client: Arc<HttpClient>,
    index_url: String,
    cache: CacheStore,
    events: Option<mpsc::UnboundedSender<SyncStage>>,
}

impl SyncEngine {
    pub fn new(client: Arc<HttpClient>, index_url: String, cache: CacheStore) -> Self {
        Self {
            client,
            index_url,
            cache,
            events: None,
        }
    }

    /// Attach a side channel receiving stage markers.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<SyncStage>) -> Self {
        self.events = Some(tx);
        self
    }

    fn emit(&self, stage: SyncStage) {
        if let Some(tx) = &self.events {
            let _ = tx.send(stage);
        }
    }

    /// Fetch the remote index, overwriting the cache on success. On any
    /// network failure fall back to the cached payload; if neither works
    /// the caller gets a `SyncError` and must stay usable in degraded mode.
    pub async fn sync(&self) -> Result<SyncOutcome, SyncError> {
        self.emit(SyncStage::Connecting);

        let network_err = match self.fetch_remote().await {
            Ok(index) => {
                info!("Index synced: {} ids available", index.len());
                return Ok(SyncOutcome {
                    index,
                    from_cache: false,
                });
            }
            Err(e) => e,
        };

        warn!("Index fetch failed, trying cache: {network_err:#}");
        self.emit(SyncStage::UsingCache);

        match self.load_cached() {
            Ok(index) => {
                info!("Index served from cache: {} ids", index.len());
                Ok(SyncOutcome {
                    index,
                    from_cache: true,
                })
            }
            Err(cache_err) => Err(SyncError {
                network: format!("{network_err:#}"),
                cache: format!("{cache_err:#}"),
            }),
        }
    }

    async fn fetch_remote(&self) -> Result<CatalogIndex> {
        self.emit(SyncStage::Downloading);

        let response = self
            .client
            .inner()
            .get(&self.index_url)
            .send()
            .await
            .with_context(|| format!("Request failed: {}", self.index_url))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("HTTP {} from index endpoint", status.as_u16());
        }

        let payload = response.text().await.context("Failed to read index body")?;
        let index = CatalogIndex::from_payload(&payload)?;

        // Persist the raw payload only once it parsed; a bad document must
        // not clobber a good cache. A failed write is not worth discarding
        // a fresh index over.
        if let Err(e) = self.cache.write_index(&payload) {
            warn!("Could not cache index payload: {e:#}");
        }

        Ok(index)
    }

    fn load_cached(&self) -> Result<CatalogIndex> {
        let payload = self
            .cache
            .read_index()?
            .context("No cached index on disk")?;
        CatalogIndex::from_payload(&payload)
    }
}
