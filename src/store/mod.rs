//! Durable, content-addressed state store.
//!
//! One SQLite row per distinct content hash. `begin_processing` is the single
//! serialization point: it runs in one transaction, so two workers racing on
//! the same hash see exactly one `Accepted`.
//!
//! Locks are held only for the bookkeeping read/write; no external call ever
//! happens inside the store.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncReadExt;

use crate::domain::{FileRecord, FileStatus, ProcessingStats};

/// Persisted error messages are capped at this many characters
const ERROR_MESSAGE_CAP: usize = 500;

/// Errors from the state store.
///
/// `Corrupt` at open time is fatal to the whole system; everything else is
/// per-record and handled by the caller.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("State database unreadable at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        source: rusqlite::Error,
    },

    #[error("No record for hash {0}")]
    NotFound(String),

    #[error("Record {hash} is {actual}, expected processing")]
    NotProcessing { hash: String, actual: FileStatus },

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of `begin_processing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginOutcome {
    /// Caller owns the record; it is now `processing`
    Accepted,

    /// Another attempt on this hash is running right now
    InFlight,

    /// Already completed successfully, terminal
    AlreadyProcessed,

    /// Failed with the retry budget spent, terminal
    RetriesExhausted,
}

impl BeginOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Metadata captured when a record is first created or re-claimed.
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub source_path: PathBuf,
    pub file_name: String,
    pub size_bytes: u64,
}

impl FileMeta {
    /// Build metadata from a path, reading its current size
    pub fn probe(path: &Path) -> std::io::Result<Self> {
        let size_bytes = std::fs::metadata(path)?.len();
        Ok(Self {
            source_path: path.to_path_buf(),
            file_name: path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string(),
            size_bytes,
        })
    }
}

/// SQLite-backed record store keyed by content hash.
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    /// Open (or create) the store at the given path.
    ///
    /// An existing database that cannot be read or migrated is reported as
    /// `StoreError::Corrupt`, which callers treat as fatal: without the
    /// record of what was already processed, running would reprocess
    /// everything.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).map_err(|e| StoreError::Corrupt {
            path: path.to_path_buf(),
            source: e,
        })?;

        Self::init_schema(&conn).map_err(|e| StoreError::Corrupt {
            path: path.to_path_buf(),
            source: e,
        })?;

        tracing::info!("State store opened at {}", path.display());

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS file_records (
                content_hash        TEXT PRIMARY KEY,
                source_path         TEXT NOT NULL,
                file_name           TEXT NOT NULL,
                size_bytes          INTEGER NOT NULL,
                status              TEXT NOT NULL,
                retry_count         INTEGER NOT NULL DEFAULT 0,
                processed_at        TEXT NOT NULL,
                processing_duration REAL,
                error_message       TEXT,
                detected_language   TEXT,
                note_path           TEXT,
                audio_archive_path  TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_records_status
                ON file_records(status);
            CREATE INDEX IF NOT EXISTS idx_records_processed_at
                ON file_records(processed_at);",
        )
    }

    /// Point read by content hash. Never scans.
    pub fn lookup(&self, content_hash: &str) -> Result<Option<FileRecord>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let record = conn
            .query_row(
                "SELECT content_hash, source_path, file_name, size_bytes, status,
                        retry_count, processed_at, processing_duration, error_message,
                        detected_language, note_path, audio_archive_path
                 FROM file_records WHERE content_hash = ?1",
                params![content_hash],
                Self::row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Claim a hash for processing.
    ///
    /// The only write path that can move a record into `processing`. Runs in
    /// a single transaction so concurrent callers for the same hash are
    /// linearized: exactly one gets `Accepted`.
    pub fn begin_processing(
        &self,
        content_hash: &str,
        meta: &FileMeta,
    ) -> Result<BeginOutcome, StoreError> {
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction()?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT status FROM file_records WHERE content_hash = ?1",
                params![content_hash],
                |row| row.get(0),
            )
            .optional()?;

        let outcome = match existing.as_deref().and_then(FileStatus::parse) {
            Some(FileStatus::Success) => BeginOutcome::AlreadyProcessed,
            Some(FileStatus::Failed) => BeginOutcome::RetriesExhausted,
            Some(FileStatus::Processing) => BeginOutcome::InFlight,
            Some(FileStatus::Pending) | Some(FileStatus::FailedRetry) => {
                tx.execute(
                    "UPDATE file_records
                     SET status = 'processing', source_path = ?2, file_name = ?3,
                         size_bytes = ?4, processed_at = ?5
                     WHERE content_hash = ?1",
                    params![
                        content_hash,
                        meta.source_path.to_string_lossy(),
                        meta.file_name,
                        meta.size_bytes as i64,
                        Utc::now().to_rfc3339(),
                    ],
                )?;
                BeginOutcome::Accepted
            }
            None => {
                tx.execute(
                    "INSERT INTO file_records
                        (content_hash, source_path, file_name, size_bytes, status,
                         retry_count, processed_at)
                     VALUES (?1, ?2, ?3, ?4, 'processing', 0, ?5)",
                    params![
                        content_hash,
                        meta.source_path.to_string_lossy(),
                        meta.file_name,
                        meta.size_bytes as i64,
                        Utc::now().to_rfc3339(),
                    ],
                )?;
                BeginOutcome::Accepted
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    /// Terminal success. Requires the record to be `processing`.
    pub fn record_success(
        &self,
        content_hash: &str,
        duration_secs: f64,
        language: Option<&str>,
        note_path: &Path,
        audio_archive_path: &Path,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let changed = conn.execute(
            "UPDATE file_records
             SET status = 'success', processing_duration = ?2, detected_language = ?3,
                 note_path = ?4, audio_archive_path = ?5, error_message = NULL,
                 processed_at = ?6
             WHERE content_hash = ?1 AND status = 'processing'",
            params![
                content_hash,
                duration_secs,
                language,
                note_path.to_string_lossy(),
                audio_archive_path.to_string_lossy(),
                Utc::now().to_rfc3339(),
            ],
        )?;

        if changed == 0 {
            return Err(self.transition_error(&conn, content_hash));
        }
        Ok(())
    }

    /// Record a failed attempt. Requires the record to be `processing`.
    ///
    /// Sets `failed_retry` while the attempt is retryable and budget remains,
    /// `failed` otherwise. Returns the status the record ended up in.
    pub fn record_failure(
        &self,
        content_hash: &str,
        duration_secs: f64,
        error_message: &str,
        retryable: bool,
        max_retries: u32,
    ) -> Result<FileStatus, StoreError> {
        let message: String = error_message.chars().take(ERROR_MESSAGE_CAP).collect();

        let conn = self.conn.lock().expect("store mutex poisoned");

        let retry_count: Option<u32> = conn
            .query_row(
                "SELECT retry_count FROM file_records
                 WHERE content_hash = ?1 AND status = 'processing'",
                params![content_hash],
                |row| row.get(0),
            )
            .optional()?;

        let retry_count = match retry_count {
            Some(n) => n + 1,
            None => return Err(self.transition_error(&conn, content_hash)),
        };

        let status = if retryable && retry_count < max_retries {
            FileStatus::FailedRetry
        } else {
            FileStatus::Failed
        };

        conn.execute(
            "UPDATE file_records
             SET status = ?2, retry_count = ?3, error_message = ?4,
                 processing_duration = ?5, processed_at = ?6
             WHERE content_hash = ?1 AND status = 'processing'",
            params![
                content_hash,
                status.as_str(),
                retry_count,
                message,
                duration_secs,
                Utc::now().to_rfc3339(),
            ],
        )?;

        Ok(status)
    }

    /// Records currently eligible for another attempt, oldest first
    pub fn retryable(&self) -> Result<Vec<FileRecord>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT content_hash, source_path, file_name, size_bytes, status,
                    retry_count, processed_at, processing_duration, error_message,
                    detected_language, note_path, audio_archive_path
             FROM file_records WHERE status = 'failed_retry'
             ORDER BY processed_at ASC",
        )?;
        let records = stmt
            .query_map([], Self::row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Aggregate counts and rates, computed by scanning persisted records.
    /// Nothing is cached beyond the call.
    pub fn statistics(&self, since: Option<DateTime<Utc>>) -> Result<ProcessingStats, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let horizon = since
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| DateTime::<Utc>::MIN_UTC.to_rfc3339());

        let (total_success, avg_duration, total_duration): (u64, f64, f64) = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(AVG(processing_duration), 0),
                    COALESCE(SUM(processing_duration), 0)
             FROM file_records
             WHERE status = 'success' AND processed_at >= ?1",
            params![horizon],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let total_failed: u64 = conn.query_row(
            "SELECT COUNT(*) FROM file_records
             WHERE status IN ('failed', 'failed_retry') AND processed_at >= ?1",
            params![horizon],
            |row| row.get(0),
        )?;

        let total_processing: u64 = conn.query_row(
            "SELECT COUNT(*) FROM file_records WHERE status = 'processing'",
            [],
            |row| row.get(0),
        )?;

        let today_start = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|t| t.and_utc().to_rfc3339())
            .unwrap_or_else(|| Utc::now().to_rfc3339());

        let files_processed_today: u64 = conn.query_row(
            "SELECT COUNT(*) FROM file_records
             WHERE status = 'success' AND processed_at >= ?1",
            params![today_start],
            |row| row.get(0),
        )?;

        let terminal = total_success + total_failed;
        let success_rate = if terminal > 0 {
            total_success as f64 / terminal as f64 * 100.0
        } else {
            0.0
        };

        Ok(ProcessingStats {
            total_success,
            total_failed,
            total_processing,
            success_rate,
            avg_processing_duration: avg_duration,
            total_processing_duration: total_duration,
            files_processed_today,
        })
    }

    /// Remove terminal records older than the retention horizon.
    /// Non-terminal records are never removed. Returns the deleted count.
    pub fn purge_older_than(&self, age: Duration) -> Result<usize, StoreError> {
        let cutoff = (Utc::now() - age).to_rfc3339();
        let conn = self.conn.lock().expect("store mutex poisoned");
        let deleted = conn.execute(
            "DELETE FROM file_records
             WHERE processed_at < ?1 AND status IN ('success', 'failed')",
            params![cutoff],
        )?;

        if deleted > 0 {
            tracing::info!("Purged {} old record(s) from state store", deleted);
        }
        Ok(deleted)
    }

    fn transition_error(&self, conn: &Connection, content_hash: &str) -> StoreError {
        let actual: Option<String> = conn
            .query_row(
                "SELECT status FROM file_records WHERE content_hash = ?1",
                params![content_hash],
                |row| row.get(0),
            )
            .optional()
            .ok()
            .flatten();

        match actual.as_deref().and_then(FileStatus::parse) {
            Some(status) => StoreError::NotProcessing {
                hash: content_hash.to_string(),
                actual: status,
            },
            None => StoreError::NotFound(content_hash.to_string()),
        }
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> Result<FileRecord, rusqlite::Error> {
        let status_str: String = row.get(4)?;
        let processed_at_str: String = row.get(6)?;
        let source_path: String = row.get(1)?;
        let note_path: Option<String> = row.get(10)?;
        let audio_archive_path: Option<String> = row.get(11)?;
        let size: i64 = row.get(3)?;

        Ok(FileRecord {
            content_hash: row.get(0)?,
            source_path: PathBuf::from(source_path),
            file_name: row.get(2)?,
            size_bytes: size as u64,
            status: FileStatus::parse(&status_str).unwrap_or(FileStatus::Failed),
            retry_count: row.get(5)?,
            processed_at: DateTime::parse_from_rfc3339(&processed_at_str)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            processing_duration: row.get(7)?,
            error_message: row.get(8)?,
            detected_language: row.get(9)?,
            note_path: note_path.map(PathBuf::from),
            audio_archive_path: audio_archive_path.map(PathBuf::from),
        })
    }
}

/// Compute the SHA-256 content hash of a file, streamed in 64 KiB reads.
/// The full hex digest is the file's durable identity.
pub async fn compute_content_hash(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}
