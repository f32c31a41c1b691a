//! Watch-folder ingestion.
//!
//! Combines debounced filesystem events with a periodic full rescan (sync
//! providers do not reliably emit events for every materialized file) and
//! funnels candidates through the stability tracker. Stable files are
//! emitted to the daemon loop for enqueueing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use notify::RecursiveMode;
use notify_debouncer_mini::new_debouncer;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use super::stability::{PollVerdict, StabilityConfig, StabilityTracker};

/// Errors that can occur with the watcher
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("Watch directory does not exist: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("Notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for the watcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Folder to watch
    pub watch_path: PathBuf,

    /// Audio extensions to accept
    pub extensions: Vec<String>,

    /// Stability poll cadence
    pub poll_interval: Duration,

    /// Full-rescan cadence (catches files the event stream missed)
    pub rescan_interval: Duration,

    pub stability: StabilityConfig,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            watch_path: PathBuf::from("."),
            extensions: ["mp3", "wav", "m4a", "flac", "ogg", "aac"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            poll_interval: Duration::from_secs(1),
            rescan_interval: Duration::from_secs(300),
            stability: StabilityConfig::default(),
        }
    }
}

impl WatcherConfig {
    pub fn validate(&self) -> Result<(), WatcherError> {
        if !self.watch_path.exists() {
            return Err(WatcherError::DirectoryNotFound(self.watch_path.clone()));
        }
        Ok(())
    }

    fn is_audio_file(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
            .unwrap_or(false)
    }

    /// Cloud placeholders and anything already quarantined are not candidates
    fn is_candidate(&self, path: &Path, error_dir: &Path) -> bool {
        if !self.is_audio_file(path) {
            return false;
        }
        if path.to_string_lossy().ends_with(".icloud") {
            return false;
        }
        if path.starts_with(error_dir) {
            return false;
        }
        true
    }
}

/// Event emitted when an audio file has stabilized and is safe to read
#[derive(Debug, Clone)]
pub struct AudioFileEvent {
    pub path: PathBuf,
    pub size: u64,
    pub detected_at: DateTime<Utc>,
}

/// Handle to control a running watcher
pub struct WatchHandle {
    stop_tx: mpsc::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl WatchHandle {
    /// Stop the watcher and wait for its task to finish
    pub async fn stop(self) -> Result<(), tokio::task::JoinError> {
        let _ = self.stop_tx.send(()).await;
        self.task.await
    }
}

/// Folder watcher with stability checking.
pub struct FolderWatcher {
    config: WatcherConfig,
    error_dir: PathBuf,
}

impl FolderWatcher {
    pub fn new(config: WatcherConfig, error_dir: PathBuf) -> Self {
        Self { config, error_dir }
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    /// Enumerate candidate files currently in the watch folder
    pub async fn scan_candidates(&self) -> Result<Vec<PathBuf>, WatcherError> {
        self.config.validate()?;

        let mut candidates = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.config.watch_path).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();

            let metadata = match entry.metadata().await {
                Ok(m) => m,
                Err(_) => continue,
            };
            if !metadata.is_file() {
                continue;
            }
            if self.config.is_candidate(&path, &self.error_dir) {
                candidates.push(path);
            }
        }

        candidates.sort();
        Ok(candidates)
    }

    /// Watch the folder and emit `AudioFileEvent`s for files that stabilize.
    /// Runs until stopped through the returned handle.
    pub fn watch(
        &self,
    ) -> Result<(mpsc::Receiver<AudioFileEvent>, WatchHandle), WatcherError> {
        self.config.validate()?;

        let (event_tx, event_rx) = mpsc::channel::<AudioFileEvent>(100);
        let (stop_tx, stop_rx) = mpsc::channel::<()>(1);

        let config = self.config.clone();
        let error_dir = self.error_dir.clone();

        let task = tokio::spawn(async move {
            if let Err(e) = run_watcher(config, error_dir, event_tx, stop_rx).await {
                tracing::error!("Watcher error: {}", e);
            }
        });

        Ok((event_rx, WatchHandle { stop_tx, task }))
    }
}

/// Internal watcher loop
async fn run_watcher(
    config: WatcherConfig,
    error_dir: PathBuf,
    event_tx: mpsc::Sender<AudioFileEvent>,
    mut stop_rx: mpsc::Receiver<()>,
) -> Result<(), WatcherError> {
    let mut tracker = StabilityTracker::new(config.stability.clone());

    // Debounced filesystem events arrive on a std channel
    let (fs_tx, fs_rx) = std::sync::mpsc::channel();
    let mut debouncer = new_debouncer(Duration::from_secs(2), fs_tx)?;
    debouncer
        .watcher()
        .watch(&config.watch_path, RecursiveMode::NonRecursive)?;

    tracing::info!("Watching {} for audio files", config.watch_path.display());

    // Seed the tracker with whatever is already in the folder
    seed_from_scan(&config, &error_dir, &mut tracker).await;

    let mut poll_timer = tokio::time::interval(config.poll_interval);
    let mut rescan_timer = tokio::time::interval(config.rescan_interval);
    rescan_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                tracing::info!("Watcher stopping");
                break;
            }

            _ = poll_timer.tick() => {
                // Drain pending filesystem events into the tracker
                while let Ok(result) = fs_rx.try_recv() {
                    match result {
                        Ok(events) => {
                            for event in events {
                                if config.is_candidate(&event.path, &error_dir) {
                                    tracker.track(&event.path);
                                }
                            }
                        }
                        Err(e) => tracing::warn!("Watcher event error: {:?}", e),
                    }
                }

                for verdict in tracker.poll() {
                    match verdict {
                        PollVerdict::Stable(path) => {
                            let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                            tracing::info!("File stable: {} ({} bytes)", path.display(), size);
                            let event = AudioFileEvent {
                                path,
                                size,
                                detected_at: Utc::now(),
                            };
                            if event_tx.send(event).await.is_err() {
                                return Ok(()); // receiver gone, daemon shut down
                            }
                        }
                        PollVerdict::Vanished(path) => {
                            tracing::debug!("File vanished while stabilizing: {}", path.display());
                        }
                        PollVerdict::Stuck(path) => {
                            tracing::warn!(
                                "File has not stabilized within {:?}: {}",
                                config.stability.stuck_timeout,
                                path.display()
                            );
                        }
                    }
                }
            }

            _ = rescan_timer.tick() => {
                seed_from_scan(&config, &error_dir, &mut tracker).await;
            }
        }
    }

    Ok(())
}

/// Full directory scan feeding untracked candidates into the tracker
async fn seed_from_scan(config: &WatcherConfig, error_dir: &Path, tracker: &mut StabilityTracker) {
    let mut entries = match tokio::fs::read_dir(&config.watch_path).await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("Scan of {} failed: {}", config.watch_path.display(), e);
            return;
        }
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let is_file = entry
            .metadata()
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if is_file && config.is_candidate(&path, error_dir) {
            tracker.track(&path);
        }
    }
}
