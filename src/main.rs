//! luapatch - Steam Lua patch manager
//!
//! Sync the availability index, search the store catalog, install
//! patches, rebuild the index, or serve the files.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use luapatch::app::{App, AppEvent};
use luapatch::cache::CacheStore;
use luapatch::config::{AppConfig, SEARCH_ENDPOINT};
use luapatch::download::{Downloader, HttpClient};
use luapatch::generator::{self, GeneratorConfig};
use luapatch::index::SyncEngine;
use luapatch::search::{search_catalog, SearchUpdate};
use luapatch::server::{self, ServerConfig};
use luapatch::steam;

#[derive(Parser)]
#[command(name = "luapatch")]
#[command(version)]
#[command(about = "Steam Lua patch manager")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (use RUST_LOG=debug for more detail)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Patch webserver base URL
    #[arg(long, global = true, env = "LUAPATCH_SERVER")]
    server: Option<String>,

    /// Steam plugin directory patches are installed into
    #[arg(long, global = true)]
    plugin_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch the availability index (falls back to the cached copy)
    Sync,

    /// Search the store catalog and show patch availability
    Search {
        /// Search term (name or numeric id)
        term: String,
    },

    /// Interactive session: type to search, `get <id>` to install
    Interactive,

    /// Download one patch and install it into the plugin directory
    Patch {
        /// Numeric app identifier
        id: String,

        /// Restart Steam after installing
        #[arg(long)]
        restart: bool,
    },

    /// Kill and relaunch Steam
    Restart,

    /// Rebuild the index document from the artifact directory
    Generate {
        /// Directory of .lua artifact files
        games_dir: PathBuf,

        /// Output index document
        #[arg(short, long, default_value = "games_index.json")]
        output: PathBuf,

        /// Resumable progress file
        #[arg(long, default_value = "generation_progress.json")]
        progress: PathBuf,

        /// Directory of fix archives (enables the fix_available flag)
        #[arg(long)]
        fixes_dir: Option<PathBuf>,

        /// Concurrent per-item lookups
        #[arg(long, default_value_t = generator::LOOKUP_WORKERS)]
        workers: usize,

        /// Wall-clock budget in hours
        #[arg(long, default_value_t = 5)]
        max_hours: u64,
    },

    /// Serve the index and artifact files over HTTP
    Serve {
        /// Directory of .lua artifact files
        games_dir: PathBuf,

        /// Index document to serve
        #[arg(long, default_value = "games_index.json")]
        index: PathBuf,

        /// Listen address
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: SocketAddr,

        /// Require this token in the X-Access-Token header
        #[arg(long, env = "LUAPATCH_TOKEN")]
        token: Option<String>,
    },
}

impl Cli {
    fn app_config(&self) -> AppConfig {
        let mut config = AppConfig::default();
        if let Some(server) = &self.server {
            config.server_url = server.clone();
        }
        if let Some(dir) = &self.plugin_dir {
            config.plugin_dir = dir.clone();
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Only initialize logging if verbose or RUST_LOG is set
    if cli.verbose || std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env().add_directive(
                if cli.verbose {
                    "luapatch=debug".parse()?
                } else {
                    "luapatch=warn".parse()?
                },
            ))
            .init();
    }

    let config = cli.app_config();

    match cli.command {
        Commands::Sync => {
            config.validate()?;
            let engine = SyncEngine::new(
                Arc::new(HttpClient::new()?),
                config.index_url(),
                CacheStore::open()?,
            );
            match engine.sync().await {
                Ok(outcome) => {
                    println!(
                        "{} patches available{}",
                        outcome.index.len(),
                        if outcome.from_cache {
                            " (offline cache)"
                        } else {
                            ""
                        }
                    );
                }
                Err(e) => {
                    eprintln!("Sync failed: {e}");
                    std::process::exit(1);
                }
            }
        }

        Commands::Search { term } => {
            config.validate()?;
            let client = Arc::new(HttpClient::new()?);

            // Best-effort availability: a failed sync still lets the
            // search run, just without the markers.
            let engine =
                SyncEngine::new(Arc::clone(&client), config.index_url(), CacheStore::open()?);
            let index = engine.sync().await.map(|o| o.index).unwrap_or_default();

            let hits = search_catalog(&client, SEARCH_ENDPOINT, &term).await?;
            if hits.is_empty() {
                println!("No results for '{term}'");
            }
            for hit in hits {
                let marker = if index.is_available(&hit.id) { "*" } else { " " };
                println!("{marker} {:>8}  {}", hit.id, hit.name);
            }
        }

        Commands::Interactive => {
            run_interactive(config).await?;
        }

        Commands::Patch { id, restart } => {
            config.validate()?;
            let downloader = Downloader::new(Arc::new(HttpClient::new()?), CacheStore::open()?);

            let bar = ProgressBar::new(0);
            bar.set_style(ProgressStyle::with_template(
                "{bar:40} {bytes}/{total_bytes} {msg}",
            )?);

            let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
            let reporter = {
                let bar = bar.clone();
                tokio::spawn(async move {
                    while let Some((downloaded, total)) = progress_rx.recv().await {
                        bar.set_length(total);
                        bar.set_position(downloaded);
                    }
                })
            };

            let url = config.artifact_url(&id);
            let cached = downloader.download(&url, &id, Some(&progress_tx)).await?;
            drop(progress_tx);
            let _ = reporter.await;
            bar.finish_and_clear();

            let dest = steam::install_patch(&config, &cached, &id)?;
            println!("Installed {} -> {}", id, dest.display());

            if restart {
                println!("{}", steam::restart_app(&config).await?);
            }
        }

        Commands::Restart => {
            println!("{}", steam::restart_app(&config).await?);
        }

        Commands::Generate {
            games_dir,
            output,
            progress,
            fixes_dir,
            workers,
            max_hours,
        } => {
            let mut gen_config = GeneratorConfig::new(games_dir, output, progress);
            gen_config.fixes_dir = fixes_dir;
            gen_config.lookup_workers = workers;
            gen_config.max_runtime = Duration::from_secs(max_hours * 3600);

            let stop = generator::spawn_interrupt_watcher();
            let report = generator::generate(Arc::new(HttpClient::new()?), &gen_config, stop).await?;

            println!(
                "{} ids: {} from previous index, {} from bulk catalog, {} looked up, {} unnamed",
                report.total_ids, report.trusted, report.from_bulk, report.looked_up, report.unnamed
            );
            if report.interrupted {
                println!("Run interrupted; progress saved, re-run to continue.");
            }
        }

        Commands::Serve {
            games_dir,
            index,
            addr,
            token,
        } => {
            server::serve(
                ServerConfig {
                    games_dir,
                    index_path: index,
                    access_token: token,
                },
                addr,
            )
            .await?;
        }
    }

    Ok(())
}

/// Stdin-driven session over the event-based client. Plain input is fed
/// to the debounced search; `get <id>` installs, `restart` relaunches.
async fn run_interactive(config: AppConfig) -> Result<()> {
    let mut app = App::new(config)?;
    app.start_sync();

    println!("Type to search, 'get <id>' to install, 'restart', 'quit'.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let line = line.trim().to_string();
                match line.split_once(' ') {
                    _ if line == "quit" => break,
                    _ if line == "restart" => app.start_restart(),
                    Some(("get", id)) => {
                        if !app.start_patch(id.trim()) {
                            println!("A download is already running.");
                        }
                    }
                    _ => app.on_input(&line),
                }
            }
            event = app.next_event() => {
                let Some(event) = event else { break };
                print_event(event);
            }
        }
    }
    Ok(())
}

fn print_event(event: AppEvent) {
    match event {
        AppEvent::SyncDone {
            available,
            from_cache,
        } => {
            println!(
                "Index ready: {} patches available{}",
                available,
                if from_cache { " (offline cache)" } else { "" }
            );
        }
        AppEvent::SyncFailed(message) => {
            println!("Sync failed ({message}); search works but availability is unknown.");
        }
        AppEvent::Search(SearchUpdate::Cleared) => {}
        AppEvent::Search(SearchUpdate::Results { hits, .. }) => {
            if hits.is_empty() {
                println!("No results.");
            }
            for hit in hits {
                let marker = if hit.available { "*" } else { " " };
                println!("{marker} {:>8}  {}", hit.id, hit.name);
            }
        }
        AppEvent::Search(SearchUpdate::Failed { message, .. }) => {
            println!("Search failed: {message}");
        }
        AppEvent::DownloadProgress { downloaded, total } => {
            if total > 0 {
                println!("  {downloaded}/{total} bytes");
            }
        }
        AppEvent::PatchInstalled { id, dest } => {
            println!("Installed {} -> {}", id, dest.display());
        }
        AppEvent::DownloadFailed { id, message } => {
            println!("Download failed for {id}: {message}");
        }
        AppEvent::CopyFailed { id, message } => {
            println!("Install failed for {id}: {message}");
        }
        AppEvent::Status(message) => println!("{message}"),
    }
}
