//! Durable processing records keyed by content hash.
//!
//! A `FileRecord` is the source of truth for whether a given file content
//! has been processed. The hash is the identity; the path is provenance only
//! and may differ between runs (sync folders rename and re-materialize files).

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Processing status of a file record.
///
/// `Success` and `Failed` are terminal. `FailedRetry` may transition back to
/// `Processing`; nothing ever leaves `Success`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    /// Known but not yet picked up by a worker
    Pending,

    /// A worker owns this record right now
    Processing,

    /// Completed, terminal
    Success,

    /// Failed with retry budget exhausted, terminal
    Failed,

    /// Failed but eligible for another attempt
    FailedRetry,
}

impl FileStatus {
    /// Terminal statuses never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Database column representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::FailedRetry => "failed_retry",
        }
    }

    /// Parse the database column representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "failed_retry" => Some(Self::FailedRetry),
            _ => None,
        }
    }
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record per distinct content hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    /// Full SHA-256 hex digest of the file bytes. Unique and immutable.
    pub content_hash: String,

    /// Path the file was last seen at (provenance, not identity)
    pub source_path: PathBuf,

    /// File name only
    pub file_name: String,

    /// Size in bytes at hash time
    pub size_bytes: u64,

    /// Current status
    pub status: FileStatus,

    /// Failed attempts so far
    pub retry_count: u32,

    /// Last status change
    pub processed_at: DateTime<Utc>,

    /// Wall-clock seconds spent processing (set on terminal transitions)
    pub processing_duration: Option<f64>,

    /// Human-readable failure reason (failure statuses only)
    pub error_message: Option<String>,

    /// Language reported by the transcriber (success only)
    pub detected_language: Option<String>,

    /// Note written for this file (success only)
    pub note_path: Option<PathBuf>,

    /// Where the source audio was archived (success only)
    pub audio_archive_path: Option<PathBuf>,
}

/// Aggregate view over the state store, computed on demand.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessingStats {
    pub total_success: u64,
    pub total_failed: u64,
    pub total_processing: u64,
    /// Percentage of terminal records that succeeded
    pub success_rate: f64,
    pub avg_processing_duration: f64,
    pub total_processing_duration: f64,
    pub files_processed_today: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            FileStatus::Pending,
            FileStatus::Processing,
            FileStatus::Success,
            FileStatus::Failed,
            FileStatus::FailedRetry,
        ] {
            assert_eq!(FileStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(FileStatus::parse("bogus"), None);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(FileStatus::Success.is_terminal());
        assert!(FileStatus::Failed.is_terminal());
        assert!(!FileStatus::FailedRetry.is_terminal());
        assert!(!FileStatus::Processing.is_terminal());
        assert!(!FileStatus::Pending.is_terminal());
    }
}
