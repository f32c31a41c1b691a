//! Work queue jobs.
//!
//! Jobs are owned exclusively by the `WorkQueue`; the orchestrator observes
//! completion through its handler result and never mutates job state.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the FIFO
    Queued,

    /// A worker is executing it
    Running,

    /// Handler returned Ok
    Done,

    /// Handler returned Err (recorded, never propagated out of the pool)
    Error,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// A single unit of work: one file to push through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,

    /// File to process
    pub file_path: PathBuf,

    /// Content hash, filled in once the worker has computed it
    pub content_hash: Option<String>,

    pub enqueued_at: DateTime<Utc>,

    pub status: JobStatus,
}

impl Job {
    pub fn new(file_path: PathBuf) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            file_path,
            content_hash: None,
            enqueued_at: Utc::now(),
            status: JobStatus::Queued,
        }
    }
}

/// Point-in-time queue counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub capacity: usize,
    pub pool_size: usize,
    pub done: usize,
    pub errored: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_job_is_queued() {
        let job = Job::new(PathBuf::from("/tmp/memo.m4a"));
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.content_hash.is_none());
    }
}
