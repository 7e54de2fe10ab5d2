//! Batch index generator
//!
//! Offline job that rebuilds the catalog index served to clients. Merges
//! a bulk catalog dump with bounded-parallel per-item lookups, checkpoints
//! progress so interrupted or budget-exceeded runs resume without
//! repeating work, and always leaves a valid index file behind.

mod sources;
mod state;

pub use sources::{BULK_ENDPOINTS, DETAILS_ENDPOINT, RATE_LIMIT_DELAY};
pub use state::{is_placeholder, placeholder_name, Checkpoint, GenerationState};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::cache::write_atomic;
use crate::config::{ARTIFACT_EXT, SEARCH_ENDPOINT};
use crate::download::HttpClient;
use crate::index::CatalogIndex;

/// Worker pool size for per-item lookups
pub const LOOKUP_WORKERS: usize = 10;

/// Persist progress every this many completed lookups
pub const CHECKPOINT_INTERVAL: usize = 50;

/// Wall-clock budget; exceeding it is a controlled stop, not an error.
pub const MAX_RUNTIME: Duration = Duration::from_secs(5 * 60 * 60);

/// Configuration for one generation run
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Directory of artifact files; one `<id>.lua` per catalog entry
    pub games_dir: PathBuf,
    /// Final index file (also read as the trusted previous index)
    pub output_path: PathBuf,
    /// Resumable progress file
    pub progress_path: PathBuf,
    /// Companion fix-file directory; enables the per-id availability flag
    pub fixes_dir: Option<PathBuf>,
    pub bulk_endpoints: Vec<String>,
    pub details_endpoint: String,
    pub search_endpoint: String,
    pub lookup_workers: usize,
    pub checkpoint_interval: usize,
    pub max_runtime: Duration,
    pub rate_limit_backoff: Duration,
}

impl GeneratorConfig {
    pub fn new(games_dir: PathBuf, output_path: PathBuf, progress_path: PathBuf) -> Self {
        Self {
            games_dir,
            output_path,
            progress_path,
            fixes_dir: None,
            bulk_endpoints: BULK_ENDPOINTS.iter().map(|s| s.to_string()).collect(),
            details_endpoint: DETAILS_ENDPOINT.to_string(),
            search_endpoint: SEARCH_ENDPOINT.to_string(),
            lookup_workers: LOOKUP_WORKERS,
            checkpoint_interval: CHECKPOINT_INTERVAL,
            max_runtime: MAX_RUNTIME,
            rate_limit_backoff: RATE_LIMIT_DELAY,
        }
    }
}

/// Summary of one generation run
#[derive(Debug, Default)]
pub struct GenerationReport {
    pub total_ids: usize,
    pub trusted: usize,
    pub from_bulk: usize,
    pub looked_up: usize,
    pub skipped: usize,
    pub unnamed: usize,
    pub interrupted: bool,
    pub elapsed: Duration,
}

/// Stop flag flipped by Ctrl-C; checked by every worker iteration.
pub fn spawn_interrupt_watcher() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, draining workers and saving state");
            let _ = tx.send(true);
        }
    });
    rx
}

/// Run the full generation pipeline. On interruption or budget exhaustion
/// the progress file and a best-effort final index are still written.
pub async fn generate(
    client: Arc<HttpClient>,
    config: &GeneratorConfig,
    stop: watch::Receiver<bool>,
) -> Result<GenerationReport> {
    let ids = scan_artifacts(&config.games_dir)?;
    info!("Found {} artifact files in {}", ids.len(), config.games_dir.display());

    let trusted = harvest_existing_index(&config.output_path);
    let state = Arc::new(Mutex::new(GenerationState::load(&config.progress_path)?));

    let bulk = sources::fetch_bulk_catalog(&client, &config.bulk_endpoints)
        .await
        .unwrap_or_default();
    if bulk.is_empty() {
        warn!("No bulk catalog available, relying on per-item lookups");
    }

    let deadline = Instant::now() + config.max_runtime;
    let stopped = {
        let stop = stop.clone();
        move || *stop.borrow() || Instant::now() >= deadline
    };

    // Ids still unnamed after the trusted index and the bulk dump, minus
    // those a previous run already attempted.
    let mut pending = Vec::new();
    let mut skipped = 0usize;
    for id in &ids {
        if trusted.contains_key(id) || bulk.contains_key(id) {
            continue;
        }
        if state.lock().unwrap().is_completed(id) {
            skipped += 1;
        } else {
            pending.push(id.clone());
        }
    }
    info!(
        "{} ids need lookups ({} previously attempted, skipped)",
        pending.len(),
        skipped
    );

    let attempted: Vec<bool> = stream::iter(pending)
        .map(|id| {
            let client = Arc::clone(&client);
            let state = Arc::clone(&state);
            let config = config.clone();
            let stopped = stopped.clone();
            async move {
                if stopped() {
                    return false;
                }
                state.lock().unwrap().record_attempt(&id);

                let name = sources::lookup_name(
                    &client,
                    &id,
                    &config.details_endpoint,
                    &config.search_endpoint,
                    config.rate_limit_backoff,
                )
                .await;

                let mut st = state.lock().unwrap();
                match name {
                    Some(name) => st.record_name(&id, name),
                    None => warn!("No name found for {}", id),
                }
                if st.bump_and_check_checkpoint(config.checkpoint_interval) {
                    if let Err(e) = st.save(&config.progress_path) {
                        warn!("Checkpoint write failed: {e:#}");
                    }
                }
                true
            }
        })
        .buffer_unordered(config.lookup_workers.max(1))
        .collect()
        .await;

    let interrupted = stopped();
    let looked_up_attempts = attempted.iter().filter(|a| **a).count();

    // Controlled stop or normal completion: persist everything either way
    // so no work is silently lost.
    let final_state = state.lock().unwrap();
    final_state
        .save(&config.progress_path)
        .context("Failed to write progress file")?;

    let report = write_final_index(
        &ids,
        &trusted,
        &bulk,
        final_state.lookup_names(),
        config.fixes_dir.as_deref(),
        &config.output_path,
    )?;

    info!(
        "Index written: {} ids ({} trusted, {} bulk, {} looked up, {} unnamed){}",
        report.total_ids,
        report.trusted,
        report.from_bulk,
        report.looked_up,
        report.unnamed,
        if interrupted { " [interrupted]" } else { "" }
    );

    Ok(GenerationReport {
        skipped,
        interrupted,
        elapsed: final_state.elapsed(),
        looked_up: looked_up_attempts.min(report.looked_up),
        ..report
    })
}

/// Enumerate artifact files, one identifier per `<id>.lua`.
fn scan_artifacts(games_dir: &Path) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    let entries = std::fs::read_dir(games_dir)
        .with_context(|| format!("Cannot read games dir {}", games_dir.display()))?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some(ARTIFACT_EXT) {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
    }
    // Numeric order for stable output, non-numeric ids last.
    ids.sort_by_key(|id| (id.parse::<u64>().unwrap_or(u64::MAX), id.clone()));
    Ok(ids)
}

/// Harvest trusted id -> name pairs from a previously generated index,
/// dropping placeholder entries.
fn harvest_existing_index(output_path: &Path) -> HashMap<String, String> {
    let Ok(payload) = std::fs::read_to_string(output_path) else {
        return HashMap::new();
    };
    let Ok(index) = CatalogIndex::from_payload(&payload) else {
        warn!("Previous index at {} is unreadable, ignoring", output_path.display());
        return HashMap::new();
    };

    let mut trusted = HashMap::new();
    for id in index.ids() {
        if let Some(name) = index.name_of(id) {
            if !is_placeholder(name) {
                trusted.insert(id.to_string(), name.to_string());
            }
        }
    }
    info!("Harvested {} trusted names from previous index", trusted.len());
    trusted
}

#[derive(Serialize)]
struct IndexDocument {
    app_ids: Vec<String>,
    games: Vec<IndexGame>,
    count: usize,
}

#[derive(Serialize)]
struct IndexGame {
    id: String,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    fix_available: Option<bool>,
}

/// Merge name sources (trust order: existing index > bulk > lookups, later
/// sources filling gaps only), sort by name, and write atomically.
fn write_final_index(
    ids: &[String],
    trusted: &HashMap<String, String>,
    bulk: &HashMap<String, String>,
    lookups: &HashMap<String, String>,
    fixes_dir: Option<&Path>,
    output_path: &Path,
) -> Result<GenerationReport> {
    let mut report = GenerationReport {
        total_ids: ids.len(),
        ..GenerationReport::default()
    };

    let mut games: Vec<IndexGame> = ids
        .iter()
        .map(|id| {
            let name = if let Some(name) = trusted.get(id) {
                report.trusted += 1;
                name.clone()
            } else if let Some(name) = bulk.get(id) {
                report.from_bulk += 1;
                name.clone()
            } else if let Some(name) = lookups.get(id) {
                report.looked_up += 1;
                name.clone()
            } else {
                report.unnamed += 1;
                placeholder_name(id)
            };

            let fix_available = fixes_dir
                .map(|dir| dir.join(format!("{id}.zip")).exists());

            IndexGame {
                id: id.clone(),
                name,
                fix_available,
            }
        })
        .collect();

    games.sort_by(|a, b| {
        a.name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then_with(|| a.id.cmp(&b.id))
    });

    let document = IndexDocument {
        app_ids: ids.to_vec(),
        count: games.len(),
        games,
    };

    let data = serde_json::to_string(&document).context("Failed to encode index")?;
    write_atomic(output_path, data.as_bytes())?;

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::http::StatusCode;
    use axum::{routing::get, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct Fixture {
        config: GeneratorConfig,
        details_hits: Arc<AtomicUsize>,
        _dir: tempfile::TempDir,
    }

    /// Stub server: bulk endpoint serving a fixed app list (or 404),
    /// details endpoint naming every id "Detail <id>" and counting hits.
    async fn fixture(ids: &[&str], bulk_body: Option<&'static str>, rate_limit_once: bool) -> Fixture {
        let details_hits = Arc::new(AtomicUsize::new(0));

        let hits = Arc::clone(&details_hits);
        let limited = Arc::new(AtomicUsize::new(if rate_limit_once { 1 } else { 0 }));
        let details = move |Query(params): Query<std::collections::HashMap<String, String>>| {
            let hits = Arc::clone(&hits);
            let limited = Arc::clone(&limited);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                if limited.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1)).is_ok() {
                    return (StatusCode::TOO_MANY_REQUESTS, String::new());
                }
                let id = params.get("appids").cloned().unwrap_or_default();
                (
                    StatusCode::OK,
                    format!(r#"{{"{id}": {{"success": true, "data": {{"name": "Detail {id}"}}}}}}"#),
                )
            }
        };

        let bulk = move || async move {
            match bulk_body {
                Some(body) => (StatusCode::OK, body.to_string()),
                None => (StatusCode::NOT_FOUND, String::new()),
            }
        };

        let router = Router::new()
            .route("/applist", get(bulk))
            .route("/appdetails", get(details));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        let base = format!("http://{}", addr);

        let dir = tempdir().unwrap();
        let games_dir = dir.path().join("games");
        std::fs::create_dir_all(&games_dir).unwrap();
        for id in ids {
            std::fs::write(games_dir.join(format!("{id}.lua")), b"-- patch").unwrap();
        }

        let mut config = GeneratorConfig::new(
            games_dir,
            dir.path().join("games_index.json"),
            dir.path().join("progress.json"),
        );
        config.bulk_endpoints = vec![
            "http://127.0.0.1:1/applist".to_string(), // dead candidate first
            format!("{base}/applist"),
        ];
        config.details_endpoint = format!("{base}/appdetails");
        config.search_endpoint = "http://127.0.0.1:1/storesearch".to_string();
        config.lookup_workers = 4;
        config.checkpoint_interval = 2;
        config.rate_limit_backoff = Duration::from_millis(50);

        Fixture {
            config,
            details_hits,
            _dir: dir,
        }
    }

    fn no_stop() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    fn read_index(path: &Path) -> CatalogIndex {
        CatalogIndex::from_payload(&std::fs::read_to_string(path).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_merges_existing_bulk_and_lookups_by_trust() {
        let fx = fixture(
            &["730", "440", "570"],
            Some(r#"{"applist": {"apps": [{"appid": 440, "name": "Team Fortress 2"}, {"appid": 730, "name": "Bulk CS"}]}}"#),
            false,
        )
        .await;

        // Existing index names 730; that beats the bulk name for it.
        std::fs::write(
            &fx.config.output_path,
            r#"{"games": [{"id": "730", "name": "Counter-Strike 2"}, {"id": "440", "name": "Unknown Game 440"}]}"#,
        )
        .unwrap();

        let client = Arc::new(HttpClient::new().unwrap());
        let report = generate(client, &fx.config, no_stop()).await.unwrap();

        assert_eq!(report.total_ids, 3);
        assert_eq!(report.trusted, 1);
        assert_eq!(report.from_bulk, 1);
        assert_eq!(report.looked_up, 1);
        assert_eq!(report.unnamed, 0);
        assert!(!report.interrupted);

        let index = read_index(&fx.config.output_path);
        assert_eq!(index.len(), 3);
        assert_eq!(index.name_of("730"), Some("Counter-Strike 2"));
        assert_eq!(index.name_of("440"), Some("Team Fortress 2"));
        assert_eq!(index.name_of("570"), Some("Detail 570"));
    }

    #[tokio::test]
    async fn test_resumed_run_skips_completed_ids() {
        let fx = fixture(&["100", "200", "300"], None, false).await;

        // Prior run attempted 100 (named) and 200 (failed lookup).
        std::fs::write(
            &fx.config.progress_path,
            r#"{"names": {"100": "Foo"}, "completed_ids": ["100", "200"]}"#,
        )
        .unwrap();

        let client = Arc::new(HttpClient::new().unwrap());
        let report = generate(client, &fx.config, no_stop()).await.unwrap();

        // Only 300 hits the network.
        assert_eq!(fx.details_hits.load(Ordering::SeqCst), 1);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.unnamed, 1); // 200 stays a placeholder

        let index = read_index(&fx.config.output_path);
        assert_eq!(index.name_of("100"), Some("Foo"));
        assert_eq!(index.name_of("200"), Some("Unknown Game 200"));
        assert_eq!(index.name_of("300"), Some("Detail 300"));

        // Progress file still lists all attempted ids.
        let progress: Checkpoint =
            serde_json::from_str(&std::fs::read_to_string(&fx.config.progress_path).unwrap())
                .unwrap();
        assert_eq!(progress.completed_ids, vec!["100", "200", "300"]);
    }

    #[tokio::test]
    async fn test_interruption_writes_state_and_valid_index() {
        let fx = fixture(&["1", "2", "3"], None, false).await;

        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap(); // stop before any lookup starts

        let client = Arc::new(HttpClient::new().unwrap());
        let report = generate(client, &fx.config, rx).await.unwrap();

        assert!(report.interrupted);
        assert_eq!(fx.details_hits.load(Ordering::SeqCst), 0);

        // Best-effort index and progress file both exist and parse.
        let index = read_index(&fx.config.output_path);
        assert_eq!(index.len(), 3);
        let progress: Checkpoint =
            serde_json::from_str(&std::fs::read_to_string(&fx.config.progress_path).unwrap())
                .unwrap();
        assert!(progress.completed_ids.is_empty());
    }

    #[tokio::test]
    async fn test_mid_run_interruption_checkpoints_started_lookups() {
        // Details endpoint that stalls long enough for the stop flag to
        // flip while the first lookup is in flight.
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let details = move |Query(params): Query<std::collections::HashMap<String, String>>| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                let id = params.get("appids").cloned().unwrap_or_default();
                format!(r#"{{"{id}": {{"success": true, "data": {{"name": "Detail {id}"}}}}}}"#)
            }
        };
        let router = Router::new().route("/appdetails", get(details));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let dir = tempdir().unwrap();
        let games_dir = dir.path().join("games");
        std::fs::create_dir_all(&games_dir).unwrap();
        for id in ["1", "2", "3"] {
            std::fs::write(games_dir.join(format!("{id}.lua")), b"-- patch").unwrap();
        }

        let mut config = GeneratorConfig::new(
            games_dir,
            dir.path().join("games_index.json"),
            dir.path().join("progress.json"),
        );
        config.bulk_endpoints = vec!["http://127.0.0.1:1/applist".to_string()];
        config.details_endpoint = format!("http://{addr}/appdetails");
        config.search_endpoint = "http://127.0.0.1:1/storesearch".to_string();
        config.lookup_workers = 1;

        let (tx, rx) = watch::channel(false);
        let first_hit = Arc::clone(&hits);
        tokio::spawn(async move {
            while first_hit.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            let _ = tx.send(true);
        });

        let client = Arc::new(HttpClient::new().unwrap());
        let report = generate(client, &config, rx).await.unwrap();

        assert!(report.interrupted);
        // The lookup that had already started still finishes and is
        // checkpointed; the ones that had not started are not attempted.
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let progress: Checkpoint =
            serde_json::from_str(&std::fs::read_to_string(&config.progress_path).unwrap())
                .unwrap();
        assert_eq!(progress.completed_ids, vec!["1"]);

        let index = read_index(&config.output_path);
        assert_eq!(index.name_of("1"), Some("Detail 1"));
        assert_eq!(index.name_of("2"), Some("Unknown Game 2"));
        assert_eq!(index.name_of("3"), Some("Unknown Game 3"));
    }

    #[tokio::test]
    async fn test_wall_clock_budget_is_a_controlled_stop() {
        let mut fx = fixture(&["1"], None, false).await;
        fx.config.max_runtime = Duration::ZERO;

        let client = Arc::new(HttpClient::new().unwrap());
        let report = generate(client, &fx.config, no_stop()).await.unwrap();

        assert!(report.interrupted);
        assert_eq!(fx.details_hits.load(Ordering::SeqCst), 0);
        assert!(fx.config.output_path.exists());
    }

    #[tokio::test]
    async fn test_rate_limited_lookup_backs_off_and_succeeds() {
        let fx = fixture(&["42"], None, true).await;

        let client = Arc::new(HttpClient::new().unwrap());
        let report = generate(client, &fx.config, no_stop()).await.unwrap();

        assert_eq!(report.looked_up, 1);
        // First request got 429, the retry succeeded.
        assert_eq!(fx.details_hits.load(Ordering::SeqCst), 2);
        let index = read_index(&fx.config.output_path);
        assert_eq!(index.name_of("42"), Some("Detail 42"));
    }

    #[tokio::test]
    async fn test_fix_availability_flag() {
        let mut fx = fixture(&["7"], None, false).await;
        let fixes = fx._dir.path().join("fixes");
        std::fs::create_dir_all(&fixes).unwrap();
        std::fs::write(fixes.join("7.zip"), b"zip").unwrap();
        fx.config.fixes_dir = Some(fixes);

        let client = Arc::new(HttpClient::new().unwrap());
        generate(client, &fx.config, no_stop()).await.unwrap();

        let doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&fx.config.output_path).unwrap())
                .unwrap();
        assert_eq!(doc["games"][0]["fix_available"], serde_json::json!(true));
    }

    #[test]
    fn test_scan_artifacts_orders_numerically() {
        let dir = tempdir().unwrap();
        for name in ["10.lua", "2.lua", "abc.lua", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let ids = scan_artifacts(dir.path()).unwrap();
        assert_eq!(ids, vec!["2", "10", "abc"]);
    }
}
