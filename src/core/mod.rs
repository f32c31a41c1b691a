//! Pipeline core: work queue, chunk merge engine, orchestrator.

pub mod merge;
pub mod orchestrator;
pub mod queue;

pub use merge::{merge_chunks, merged_text, MergeConfig};
pub use orchestrator::{retry_backoff, CompletedNote, Orchestrator, PipelineConfig, ProcessError};
pub use queue::{JobHandler, QueueConfig, QueueError, WorkQueue};
