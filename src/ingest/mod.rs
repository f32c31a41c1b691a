//! Watch-folder ingestion pipeline.
//!
//! 1. **Watcher**: filesystem events + periodic rescan of the watch folder
//! 2. **Stability**: size/mtime polling until a file is safe to read
//!
//! Stable files flow out as `AudioFileEvent`s; the daemon loop enqueues them
//! into the work queue.

pub mod stability;
pub mod watcher;

// Re-export key types
pub use stability::{PollVerdict, StabilityConfig, StabilityTracker};
pub use watcher::{AudioFileEvent, FolderWatcher, WatchHandle, WatcherConfig, WatcherError};
