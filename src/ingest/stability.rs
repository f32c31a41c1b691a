//! Stability detection for files in a syncing folder.
//!
//! Cloud-sync providers materialize files progressively, sometimes starting
//! from a zero-byte placeholder. Reading too early yields truncated or
//! garbage audio, so a file is only promoted once its size and mtime have
//! held still across consecutive polls and it can actually be opened.
//!
//! The tracker is a plain synchronous state machine; the watcher drives it
//! on a timer, and tests drive it directly.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};

/// Stability tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StabilityConfig {
    /// Consecutive unchanged polls required before a file is stable
    pub required_stable_polls: u32,

    /// How long a file may churn before it is reported stuck
    pub stuck_timeout: Duration,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            required_stable_polls: 3,
            stuck_timeout: Duration::from_secs(60),
        }
    }
}

/// What one poll concluded about a tracked file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollVerdict {
    /// Size/mtime held still long enough and the file opens cleanly
    Stable(PathBuf),

    /// File disappeared between polls (sync eviction); dropped from
    /// tracking, not an error
    Vanished(PathBuf),

    /// Still churning past the stuck timeout; reported once, tracking
    /// continues
    Stuck(PathBuf),
}

#[derive(Debug)]
struct TrackedFile {
    last_size: u64,
    last_mtime: SystemTime,
    stable_polls: u32,
    first_seen: Instant,
    stuck_reported: bool,
}

/// Tracks candidate files until they are safe to read.
#[derive(Debug)]
pub struct StabilityTracker {
    config: StabilityConfig,
    entries: HashMap<PathBuf, TrackedFile>,
}

impl StabilityTracker {
    pub fn new(config: StabilityConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
        }
    }

    /// Begin tracking a candidate. Re-tracking an already tracked path is a
    /// no-op so repeated filesystem events don't reset progress.
    pub fn track(&mut self, path: &Path) {
        if self.entries.contains_key(path) {
            return;
        }

        let Ok((size, mtime)) = probe(path) else {
            // Not accessible yet; the next scan will retry
            tracing::debug!("Cannot probe {} yet, skipping", path.display());
            return;
        };

        tracing::debug!("Tracking {} for stability ({} bytes)", path.display(), size);
        self.entries.insert(
            path.to_path_buf(),
            TrackedFile {
                last_size: size,
                last_mtime: mtime,
                stable_polls: 0,
                first_seen: Instant::now(),
                stuck_reported: false,
            },
        );
    }

    pub fn is_tracking(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    pub fn tracked_count(&self) -> usize {
        self.entries.len()
    }

    /// Poll every tracked file once. Stable files are removed from tracking
    /// and returned; vanished files are dropped; stuck files are reported
    /// once each.
    pub fn poll(&mut self) -> Vec<PollVerdict> {
        let mut verdicts = Vec::new();
        let mut remove = Vec::new();

        for (path, entry) in self.entries.iter_mut() {
            match probe(path) {
                Err(_) => {
                    verdicts.push(PollVerdict::Vanished(path.clone()));
                    remove.push(path.clone());
                }
                Ok((size, mtime)) => {
                    let unchanged = size == entry.last_size && mtime == entry.last_mtime;

                    // Zero-byte files are placeholders, never stable
                    if unchanged && size > 0 {
                        entry.stable_polls += 1;
                    } else {
                        entry.stable_polls = 0;
                        entry.last_size = size;
                        entry.last_mtime = mtime;
                    }

                    if entry.stable_polls >= self.config.required_stable_polls {
                        if openable(path) {
                            verdicts.push(PollVerdict::Stable(path.clone()));
                            remove.push(path.clone());
                        } else {
                            // Present but locked by the sync agent; start over
                            entry.stable_polls = 0;
                        }
                    } else if entry.first_seen.elapsed() >= self.config.stuck_timeout
                        && !entry.stuck_reported
                    {
                        entry.stuck_reported = true;
                        verdicts.push(PollVerdict::Stuck(path.clone()));
                    }
                }
            }
        }

        for path in remove {
            self.entries.remove(&path);
        }
        verdicts
    }
}

/// Size and mtime snapshot
fn probe(path: &Path) -> std::io::Result<(u64, SystemTime)> {
    let metadata = std::fs::metadata(path)?;
    Ok((metadata.len(), metadata.modified()?))
}

/// A file still held exclusively by the sync agent fails to open; that is a
/// not-yet-stable signal, not an error
fn openable(path: &Path) -> bool {
    File::open(path).is_ok()
}
