//! Catalog search client
//!
//! Debounced, cancellable queries against the external store-search API.
//! Every dispatched request carries a generation number; only the response
//! matching the current generation may update the displayed results, and a
//! superseded request is aborted rather than merely ignored.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::download::HttpClient;
use crate::index::{id_to_string, CatalogIndex};

/// Debounce window observed across the UI variants
pub const DEBOUNCE: Duration = Duration::from_millis(400);

/// One search hit from the external API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub name: String,
    pub id: String,
}

/// A hit annotated with catalog availability
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotatedHit {
    pub name: String,
    pub id: String,
    pub available: bool,
}

/// Non-fatal search failure; the results area stays empty with a message.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP {0} from search endpoint")]
    Status(u16),

    #[error("Parse error: {0}")]
    Parse(String),
}

#[derive(Deserialize)]
struct SearchPayload {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Deserialize)]
struct SearchItem {
    #[serde(default)]
    name: Option<String>,
    id: serde_json::Value,
}

/// One-shot query against the search endpoint.
pub async fn search_catalog(
    client: &HttpClient,
    endpoint: &str,
    term: &str,
) -> Result<Vec<SearchHit>, SearchError> {
    let response = client
        .inner()
        .get(endpoint)
        .query(&[("term", term), ("l", "english"), ("cc", "US")])
        .send()
        .await
        .map_err(|e| SearchError::Network(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(SearchError::Status(status.as_u16()));
    }

    let payload: SearchPayload = response
        .json()
        .await
        .map_err(|e| SearchError::Parse(e.to_string()))?;

    Ok(payload
        .items
        .iter()
        .filter_map(|item| {
            let id = id_to_string(&item.id)?;
            Some(SearchHit {
                name: item.name.clone().unwrap_or_else(|| "Unknown".to_string()),
                id,
            })
        })
        .collect())
}

/// Update pushed to the consumer; `generation` lets the consumption point
/// re-apply the staleness filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchUpdate {
    Cleared,
    Results {
        generation: u64,
        hits: Vec<AnnotatedHit>,
    },
    Failed {
        generation: u64,
        message: String,
    },
}

/// Debounced search driver feeding a consumer channel.
pub struct SearchClient {
    client: Arc<HttpClient>,
    endpoint: String,
    index: Arc<RwLock<CatalogIndex>>,
    updates: mpsc::UnboundedSender<SearchUpdate>,
    generation: Arc<AtomicU64>,
    debounce: Duration,
    debounce_task: Option<JoinHandle<()>>,
    // Single-slot active request; replaced (and the old one aborted) on
    // each dispatch.
    inflight: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SearchClient {
    pub fn new(
        client: Arc<HttpClient>,
        endpoint: String,
        index: Arc<RwLock<CatalogIndex>>,
        updates: mpsc::UnboundedSender<SearchUpdate>,
    ) -> Self {
        Self {
            client,
            endpoint,
            index,
            updates,
            generation: Arc::new(AtomicU64::new(0)),
            debounce: DEBOUNCE,
            debounce_task: None,
            inflight: Arc::new(Mutex::new(None)),
        }
    }

    /// Shorten the debounce window (tests).
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Generation of the most recently dispatched request
    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Feed one keystroke's worth of input. Restarts the debounce timer;
    /// empty input clears results immediately without a network call.
    pub fn on_input(&mut self, text: &str) {
        if let Some(task) = self.debounce_task.take() {
            task.abort();
        }

        let term = text.trim().to_string();
        if term.is_empty() {
            // Retire any in-flight request so a late response cannot
            // repopulate a cleared results list.
            self.generation.fetch_add(1, Ordering::SeqCst);
            if let Some(task) = self.inflight.lock().unwrap().take() {
                task.abort();
            }
            let _ = self.updates.send(SearchUpdate::Cleared);
            return;
        }

        let client = Arc::clone(&self.client);
        let endpoint = self.endpoint.clone();
        let index = Arc::clone(&self.index);
        let updates = self.updates.clone();
        let generation = Arc::clone(&self.generation);
        let inflight = Arc::clone(&self.inflight);
        let debounce = self.debounce;

        self.debounce_task = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;

            let my_generation = generation.fetch_add(1, Ordering::SeqCst) + 1;
            debug!("Dispatching search (generation {my_generation}): {term}");

            let request = {
                let generation = Arc::clone(&generation);
                tokio::spawn(async move {
                    let result = search_catalog(&client, &endpoint, &term).await;

                    // Stale responses are dropped silently, even when a
                    // newer query started while this one was in flight.
                    if generation.load(Ordering::SeqCst) != my_generation {
                        debug!("Discarding stale search response (generation {my_generation})");
                        return;
                    }

                    let update = match result {
                        Ok(hits) => {
                            let index = index.read().unwrap();
                            let hits = hits
                                .into_iter()
                                .map(|hit| AnnotatedHit {
                                    available: index.is_available(&hit.id),
                                    name: hit.name,
                                    id: hit.id,
                                })
                                .collect();
                            SearchUpdate::Results {
                                generation: my_generation,
                                hits,
                            }
                        }
                        Err(e) => SearchUpdate::Failed {
                            generation: my_generation,
                            message: e.to_string(),
                        },
                    };
                    let _ = updates.send(update);
                })
            };

            // Actively cancel the previous in-flight request before the
            // new one takes the slot.
            let previous = inflight.lock().unwrap().replace(request);
            if let Some(task) = previous {
                task.abort();
            }
        }));
    }
}

impl Drop for SearchClient {
    fn drop(&mut self) {
        if let Some(task) = self.debounce_task.take() {
            task.abort();
        }
        if let Some(task) = self.inflight.lock().unwrap().take() {
            task.abort();
        }
    }
}
