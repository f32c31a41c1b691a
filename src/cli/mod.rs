//! Command-line interface for echonote.
//!
//! - `echonote watch`  — run the full watch/transcribe/annotate daemon
//! - `echonote scan`   — one-shot look at the watch folder vs the state store
//! - `echonote status` — state store counts and pending retries
//! - `echonote stats`  — processing statistics
//! - `echonote purge`  — drop terminal records past the retention horizon
//! - `echonote config` — show the resolved configuration

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};

use crate::adapters::{MarkdownNoteWriter, OllamaAnnotator, WhisperTranscriber};
use crate::adapters::ollama::OllamaConfig;
use crate::config;
use crate::core::{retry_backoff, JobHandler, Orchestrator, WorkQueue};
use crate::ingest::FolderWatcher;
use crate::store::{compute_content_hash, StateStore};

/// echonote - audio note ingestion pipeline
#[derive(Parser, Debug)]
#[command(name = "echonote")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Watch the folder and process new audio continuously
    Watch {
        /// Override the watch folder
        #[arg(short, long)]
        path: Option<PathBuf>,
    },

    /// Scan the watch folder once and report what would be processed
    Scan {
        /// Override the watch folder
        #[arg(short, long)]
        path: Option<PathBuf>,
    },

    /// Show state store counts and files awaiting retry
    Status,

    /// Show processing statistics
    Stats,

    /// Remove terminal records older than the retention horizon
    Purge {
        /// Retention in days
        #[arg(long, default_value = "90")]
        days: i64,
    },

    /// Show resolved configuration
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Watch { path } => run_watch(path).await,
            Commands::Scan { path } => run_scan(path).await,
            Commands::Status => show_status().await,
            Commands::Stats => show_stats().await,
            Commands::Purge { days } => run_purge(days).await,
            Commands::Config => show_config(),
        }
    }
}

/// Build the orchestrator with its production collaborators
fn build_orchestrator(cfg: &config::ResolvedConfig, store: Arc<StateStore>) -> Result<Orchestrator> {
    let vault = cfg.require_vault_path()?;
    let error_dir = cfg.error_dir()?;

    let transcriber = Arc::new(WhisperTranscriber::new(cfg.whisper_model.clone()));
    let annotator = Arc::new(OllamaAnnotator::new(OllamaConfig {
        api_url: cfg.ollama_api_url.clone(),
        model: cfg.require_ollama_model()?.to_string(),
        temperature: cfg.ollama_temperature,
        read_timeout: cfg.ollama_timeout,
    }));
    let notes = Arc::new(MarkdownNoteWriter::new(vault, &cfg.notes_folder, &error_dir));

    Ok(Orchestrator::new(
        store,
        transcriber,
        annotator,
        notes,
        cfg.pipeline_config(),
    ))
}

/// Run the daemon: watch → stabilize → enqueue → process.
async fn run_watch(path_override: Option<PathBuf>) -> Result<()> {
    let mut cfg = config::config()?.clone();
    if let Some(path) = path_override {
        cfg.watch_folder = Some(path);
    }

    // Unreadable state at startup is fatal; everything downstream is not
    let store = Arc::new(StateStore::open(&cfg.state_db_path())?);

    let orchestrator = Arc::new(build_orchestrator(&cfg, Arc::clone(&store))?);
    let queue = Arc::new(WorkQueue::new(cfg.queue_config()));
    queue.start_workers(Arc::clone(&orchestrator) as Arc<dyn JobHandler>);

    let watcher = FolderWatcher::new(cfg.watcher_config()?, cfg.error_dir()?);
    let (mut event_rx, watch_handle) = watcher.watch()?;

    println!("Watching {}", cfg.require_watch_folder()?.display());
    println!("Press Ctrl+C to stop");

    let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        let _ = stop_tx.send(());
    });

    // Health pass: retry re-enqueue, statistics log, retention cleanup
    let mut health_timer = tokio::time::interval(Duration::from_secs(30));
    health_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_stats_log = std::time::Instant::now();

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match queue.enqueue(&event.path) {
                    Ok(job_id) => {
                        tracing::info!(job_id = %job_id, "Queued {}", event.path.display());
                    }
                    Err(e) => {
                        // Duplicate/full enqueues are expected, not fatal
                        tracing::debug!("Not queued ({}): {}", e, event.path.display());
                    }
                }
            }

            _ = health_timer.tick() => {
                requeue_retryable(&store, &queue);

                if last_stats_log.elapsed() >= Duration::from_secs(3600) {
                    log_statistics(&store, &queue);
                    if let Err(e) = store.purge_older_than(chrono::Duration::days(cfg.retention_days)) {
                        tracing::warn!("Retention cleanup failed: {}", e);
                    }
                    last_stats_log = std::time::Instant::now();
                }
            }

            _ = &mut stop_rx => {
                println!();
                println!("Stopping...");
                break;
            }
        }
    }

    watch_handle.stop().await.ok();
    queue.shutdown().await;
    log_statistics(&store, &queue);
    Ok(())
}

/// Re-enqueue failed_retry records whose backoff has elapsed
fn requeue_retryable(store: &StateStore, queue: &WorkQueue) {
    let records = match store.retryable() {
        Ok(records) => records,
        Err(e) => {
            tracing::warn!("Could not list retryable records: {}", e);
            return;
        }
    };

    for record in records {
        let backoff = retry_backoff(record.retry_count);
        let eligible_at = record.processed_at + chrono::Duration::seconds(backoff.as_secs() as i64);
        if Utc::now() < eligible_at {
            continue;
        }
        if !record.source_path.exists() || queue.has_live_job(&record.source_path) {
            continue;
        }

        match queue.enqueue(&record.source_path) {
            Ok(_) => tracing::info!(
                retry = record.retry_count,
                "Re-queued {} for retry",
                record.source_path.display()
            ),
            Err(e) => tracing::debug!("Retry enqueue skipped: {}", e),
        }
    }
}

fn log_statistics(store: &StateStore, queue: &WorkQueue) {
    let queue_stats = queue.stats();
    match store.statistics(None) {
        Ok(stats) => {
            tracing::info!(
                success = stats.total_success,
                failed = stats.total_failed,
                success_rate = format!("{:.1}%", stats.success_rate),
                today = stats.files_processed_today,
                avg_secs = format!("{:.1}", stats.avg_processing_duration),
                queued = queue_stats.queued,
                running = queue_stats.running,
                "Processing statistics"
            );
        }
        Err(e) => tracing::warn!("Could not compute statistics: {}", e),
    }
}

/// One-shot scan: report each candidate's dedup status without processing
async fn run_scan(path_override: Option<PathBuf>) -> Result<()> {
    let mut cfg = config::config()?.clone();
    if let Some(path) = path_override {
        cfg.watch_folder = Some(path);
    }

    let store = StateStore::open(&cfg.state_db_path())?;
    let watcher = FolderWatcher::new(cfg.watcher_config()?, cfg.error_dir()?);

    println!("Scanning: {}", cfg.require_watch_folder()?.display());
    println!();

    let candidates = watcher.scan_candidates().await?;
    if candidates.is_empty() {
        println!("No audio files found");
        return Ok(());
    }

    let mut new_files = 0;
    let mut seen = 0;

    println!("{:<40} {:<14} {:<12}", "FILE", "HASH", "STATUS");
    println!("{}", "-".repeat(70));

    for path in &candidates {
        let name = path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        let hash = compute_content_hash(path)
            .await
            .with_context(|| format!("Failed to hash {}", path.display()))?;

        let status = match store.lookup(&hash)? {
            Some(record) => {
                seen += 1;
                record.status.to_string()
            }
            None => {
                new_files += 1;
                "new".to_string()
            }
        };

        println!("{:<40} {:<14} {:<12}", truncate(&name, 38), &hash[..12], status);
    }

    println!();
    println!("{} file(s): {} new, {} known", candidates.len(), new_files, seen);
    Ok(())
}

async fn show_status() -> Result<()> {
    let cfg = config::config()?;
    let store = StateStore::open(&cfg.state_db_path())?;
    let stats = store.statistics(None)?;

    println!();
    println!("State Store Status");
    println!("══════════════════════════════════════════════════════════════");
    println!();
    println!("Database:   {}", cfg.state_db_path().display());
    println!();
    println!("Records:");
    println!("  Success:    {}", stats.total_success);
    println!("  Failed:     {}", stats.total_failed);
    println!("  Processing: {}", stats.total_processing);
    println!();

    let retryable = store.retryable()?;
    if !retryable.is_empty() {
        println!("Awaiting retry:");
        for record in retryable.iter().take(10) {
            println!(
                "  [{}/{}] {} — {}",
                record.retry_count,
                cfg.max_retries,
                record.file_name,
                record
                    .error_message
                    .as_deref()
                    .unwrap_or("unknown error")
            );
        }
        println!();
    }

    Ok(())
}

async fn show_stats() -> Result<()> {
    let cfg = config::config()?;
    let store = StateStore::open(&cfg.state_db_path())?;
    let stats = store.statistics(None)?;

    println!();
    println!("Processing Statistics");
    println!("══════════════════════════════════════════════════════════════");
    println!();
    println!("  Total success:        {}", stats.total_success);
    println!("  Total failed:         {}", stats.total_failed);
    println!("  Success rate:         {:.1}%", stats.success_rate);
    println!("  Processed today:      {}", stats.files_processed_today);
    println!("  Avg duration:         {:.1}s", stats.avg_processing_duration);
    println!("  Total duration:       {:.1}s", stats.total_processing_duration);
    println!();

    Ok(())
}

async fn run_purge(days: i64) -> Result<()> {
    let cfg = config::config()?;
    let store = StateStore::open(&cfg.state_db_path())?;

    let deleted = store.purge_older_than(chrono::Duration::days(days))?;
    println!("Removed {} record(s) older than {} days", deleted, days);
    Ok(())
}

fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!();
    println!("echonote Configuration");
    println!("══════════════════════════════════════════════════════════════");
    println!();
    println!(
        "Config file:     {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - env + defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!(
        "  Watch folder:  {}",
        cfg.watch_folder
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(not set)".to_string())
    );
    println!(
        "  Vault:         {}",
        cfg.vault_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(not set)".to_string())
    );
    println!("  Notes folder:  {}", cfg.notes_folder);
    println!("  State db:      {}", cfg.state_db_path().display());
    println!();
    println!("Processing:");
    println!("  Workers:             {}", cfg.max_concurrent);
    println!("  Queue capacity:      {}", cfg.queue_capacity);
    println!("  Retry budget:        {}", cfg.max_retries);
    println!("  Retention:           {} days", cfg.retention_days);
    println!("  Stable polls:        {}", cfg.required_stable_polls);
    println!("  Stuck timeout:       {:?}", cfg.stuck_timeout);
    println!();
    println!("Chunking:");
    println!("  Threshold:           {:.0}s", cfg.chunk_threshold);
    println!("  Chunk duration:      {:.0}s", cfg.chunk_duration);
    println!("  Overlap:             {:.0}s", cfg.chunk_overlap);
    println!("  Similarity cutoff:   {:.2}", cfg.similarity_threshold);
    println!();
    println!("Backends:");
    println!("  Whisper model:       {}", cfg.whisper_model);
    println!("  Ollama endpoint:     {}", cfg.ollama_api_url);
    println!(
        "  Ollama model:        {}",
        cfg.ollama_model.as_deref().unwrap_or("(not set)")
    );
    println!();

    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() > max {
        format!("{}...", &s[..max.saturating_sub(3)])
    } else {
        s.to_string()
    }
}
