use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use quill_core::{seed_quotes, select, QuoteDraft, QuoteRecord, RecordStore, ALL_CATEGORIES};
use quill_remote::{HttpGateway, HttpGatewayConfig};
use quill_storage::QuoteStorage;
use quill_sync::SyncEngine;
use rand::seq::SliceRandom;
use tokio::sync::Mutex;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
struct QuillConfig {
    data_dir: PathBuf,
    remote_url: String,
    user_agent: String,
    http_timeout_secs: u64,
    sync_cron: String,
    scheduler_enabled: bool,
    session_id: String,
}

impl QuillConfig {
    fn from_env() -> Self {
        Self {
            data_dir: std::env::var("QUILL_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./quill-data")),
            remote_url: std::env::var("QUILL_REMOTE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            user_agent: std::env::var("QUILL_USER_AGENT")
                .unwrap_or_else(|_| "quill/0.1".to_string()),
            http_timeout_secs: std::env::var("QUILL_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            sync_cron: std::env::var("QUILL_SYNC_CRON")
                .unwrap_or_else(|_| "0 */5 * * * *".to_string()),
            scheduler_enabled: std::env::var("QUILL_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(true),
            session_id: std::env::var("QUILL_SESSION_ID")
                .unwrap_or_else(|_| default_session_id()),
        }
    }
}

/// One terminal = one session. Invocations from the same shell share the
/// parent pid and thus the session namespace; a new terminal starts fresh,
/// the way a new browser tab would.
#[cfg(unix)]
fn default_session_id() -> String {
    std::os::unix::process::parent_id().to_string()
}

#[cfg(not(unix))]
fn default_session_id() -> String {
    "local".to_string()
}

#[derive(Debug, Parser)]
#[command(name = "quill")]
#[command(about = "Local-first quote vault with remote sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Display a random quote, honoring the category filter and search term.
    Show {
        /// Category to filter by; defaults to the last-used filter.
        #[arg(long)]
        category: Option<String>,
        /// Case-insensitive search over text and author.
        #[arg(long, default_value = "")]
        search: String,
        /// Redisplay the quote last shown in this session, if any.
        #[arg(long)]
        last: bool,
    },
    /// Add a new quote to the vault.
    Add {
        text: String,
        #[arg(long)]
        author: Option<String>,
        #[arg(long)]
        category: Option<String>,
    },
    /// Remove a quote by id.
    Remove { id: String },
    /// List quotes, optionally filtered.
    List {
        #[arg(long, default_value = ALL_CATEGORIES)]
        category: String,
        #[arg(long, default_value = "")]
        search: String,
    },
    /// Import quotes from a JSON array file (newer timestamp wins per id).
    Import { path: PathBuf },
    /// Export the full vault as pretty-printed JSON.
    Export { path: PathBuf },
    /// Run one sync cycle against the remote.
    Sync,
    /// Sync periodically until interrupted.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = QuillConfig::from_env();

    let storage = QuoteStorage::open(&config.data_dir, &config.session_id)
        .await
        .with_context(|| format!("opening storage under {}", config.data_dir.display()))?;
    let mut store = boot_store(&storage).await;

    // A bare `quill` redisplays the session's last quote, like reloading the
    // page in a browser tab.
    match cli.command.unwrap_or(Commands::Show {
        category: None,
        search: String::new(),
        last: true,
    }) {
        Commands::Show {
            category,
            search,
            last,
        } => {
            let filter = match category {
                Some(category) => category,
                None => storage
                    .load_last_filter()
                    .await
                    .unwrap_or_default()
                    .unwrap_or_else(|| ALL_CATEGORIES.to_string()),
            };
            let visible = select(&store.snapshot(), &filter, &search);
            match quote_to_show(&storage, &visible, last).await {
                Some(quote) => {
                    println!("\"{}\"", quote.text);
                    println!("  — {} [{}] ({})", quote.author, quote.category, quote.id);
                    if let Err(err) = storage.save_session_last(&quote).await {
                        warn!(error = %err, "failed to remember last-displayed quote");
                    }
                    if let Err(err) = storage.save_last_filter(&filter).await {
                        warn!(error = %err, "failed to remember category filter");
                    }
                }
                None => println!("no quotes match filter={filter} search={search:?}"),
            }
        }
        Commands::Add {
            text,
            author,
            category,
        } => {
            let stored = store
                .add(QuoteDraft {
                    author,
                    category,
                    ..QuoteDraft::new(text)
                })
                .context("adding quote")?;
            persist(&storage, &store).await;
            println!("added {} [{}]", stored.id, stored.category);
        }
        Commands::Remove { id } => {
            if store.remove(&id) {
                persist(&storage, &store).await;
                println!("removed {id}");
            } else {
                println!("no quote with id {id}");
            }
        }
        Commands::List { category, search } => {
            let visible = select(&store.snapshot(), &category, &search);
            for quote in &visible {
                println!("{}  \"{}\" — {} [{}]", quote.id, quote.text, quote.author, quote.category);
            }
            println!("{} quote(s)", visible.len());
        }
        Commands::Import { path } => {
            let drafts = quill_storage::read_import_file(&path)
                .await
                .with_context(|| format!("importing {}", path.display()))?;
            let total = drafts.len();
            let now = chrono::Utc::now();
            let mut imported = Vec::new();
            for draft in drafts {
                match draft.normalize(now) {
                    Ok(record) => imported.push(record),
                    Err(err) => warn!(error = %err, "skipping unimportable quote"),
                }
            }
            let accepted = imported.len();
            let merged = quill_core::merge_by_recency(store.snapshot(), imported);
            store.replace_all(merged);
            persist(&storage, &store).await;
            println!(
                "imported {accepted} of {total} quote(s); vault now holds {}",
                store.len()
            );
        }
        Commands::Export { path } => {
            quill_storage::write_export_file(&path, &store.snapshot())
                .await
                .with_context(|| format!("exporting to {}", path.display()))?;
            println!("exported {} quote(s) to {}", store.len(), path.display());
        }
        Commands::Sync => {
            let engine = build_engine(&config, storage, store)?;
            match engine.run_cycle().await? {
                Some(summary) => println!(
                    "sync complete: remote={} merged={} published={} failures={}",
                    summary.remote_records,
                    summary.merged_records,
                    summary.published,
                    summary.publish_failures
                ),
                None => println!("sync already in progress"),
            }
        }
        Commands::Watch => {
            if !config.scheduler_enabled {
                println!("scheduler disabled via QUILL_SCHEDULER_ENABLED; run `quill sync` for a one-off cycle");
                return Ok(());
            }
            let engine = Arc::new(build_engine(&config, storage, store)?);
            let mut sched = Arc::clone(&engine).build_scheduler(&config.sync_cron).await?;
            sched.start().await.context("starting scheduler")?;
            println!("syncing on cron `{}`; ctrl-c to stop", config.sync_cron);
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

/// Pick what `show` displays. With `show_last`, the session's remembered
/// quote is redisplayed when it exists; otherwise (and on any session-read
/// problem) fall through to a random pick from the visible set.
async fn quote_to_show(
    storage: &QuoteStorage,
    visible: &[QuoteRecord],
    show_last: bool,
) -> Option<QuoteRecord> {
    if show_last {
        match storage.load_session_last().await {
            Ok(Some(quote)) => return Some(quote),
            Ok(None) => {}
            Err(err) => warn!(error = %err, "failed to read last-displayed quote"),
        }
    }
    visible.choose(&mut rand::thread_rng()).cloned()
}

/// Load the durable snapshot into a fresh store. Both a never-written and an
/// unreadable quotes key fall open to the seed set, applied here, once, not
/// inside the adapter.
async fn boot_store(storage: &QuoteStorage) -> RecordStore {
    match storage.load_quotes().await {
        Ok(Some(records)) => RecordStore::with_records(records),
        Ok(None) => seed_store(storage).await,
        Err(err) => {
            warn!(error = %err, "stored quotes unreadable; reseeding");
            seed_store(storage).await
        }
    }
}

async fn seed_store(storage: &QuoteStorage) -> RecordStore {
    let mut store = RecordStore::new();
    for draft in seed_quotes() {
        if let Err(err) = store.add(draft) {
            warn!(error = %err, "seed quote rejected");
        }
    }
    persist(storage, &store).await;
    store
}

/// Best-effort durable write; the in-memory store stays authoritative.
async fn persist(storage: &QuoteStorage, store: &RecordStore) {
    if let Err(err) = storage.save_quotes(&store.snapshot()).await {
        warn!(error = %err, "failed to persist vault; in-memory state kept");
    }
}

fn build_engine(
    config: &QuillConfig,
    storage: QuoteStorage,
    store: RecordStore,
) -> Result<SyncEngine> {
    let gateway = HttpGateway::new(HttpGatewayConfig {
        base_url: config.remote_url.clone(),
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..HttpGatewayConfig::default()
    })?;
    Ok(SyncEngine::new(
        Arc::new(Mutex::new(store)),
        storage,
        Arc::new(gateway),
    ))
}
