//! Pipeline orchestrator.
//!
//! Drives one file through the pipeline: hash → dedup gate → transcribe
//! (chunked above the duration threshold, stitched by the merge engine) →
//! annotate → write note → archive → record outcome.
//!
//! The state store's lock is only ever taken for the bookkeeping read/write;
//! transcription and annotation run outside any lock.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::adapters::{Annotator, NoteWriter, Transcriber};
use crate::domain::{ChunkTranscript, FileStatus, Job};
use crate::store::{compute_content_hash, BeginOutcome, FileMeta, StateStore};

use super::merge::{merge_chunks, merged_text, MergeConfig};
use super::queue::JobHandler;

/// Pipeline failure taxonomy.
///
/// `TransientIo` and `ExternalService` are retryable up to the budget;
/// `CorruptInput` is permanent; `Duplicate` is not a failure at all — it is
/// logged and the job is skipped.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// File vanished or was locked mid-read; worth retrying later
    #[error("Transient IO error: {0}")]
    TransientIo(String),

    /// Unreadable or zero-length audio; no retry will fix it
    #[error("Corrupt input: {0}")]
    CorruptInput(String),

    /// A collaborator (transcriber, annotator, note writer) failed
    #[error("External service '{stage}' failed: {message}")]
    ExternalService {
        stage: &'static str,
        message: String,
    },

    /// Content already handled (processed, in flight, or retries exhausted)
    #[error("Duplicate content {hash}: {reason}")]
    Duplicate { hash: String, reason: &'static str },
}

impl ProcessError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientIo(_) | Self::ExternalService { .. })
    }

    fn external(stage: &'static str) -> impl FnOnce(anyhow::Error) -> Self {
        move |e| Self::ExternalService {
            stage,
            message: e.to_string(),
        }
    }
}

/// Orchestrator tunables.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Audio longer than this is transcribed in chunks (seconds)
    pub chunk_threshold: f64,

    /// Chunk length in seconds
    pub chunk_duration: f64,

    /// Overlap between adjacent chunks in seconds
    pub chunk_overlap: f64,

    /// Failed attempts allowed before a record goes terminal
    pub max_retries: u32,

    /// Optional fixed language passed to the transcriber
    pub language_hint: Option<String>,

    pub merge: MergeConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_threshold: 240.0,
            chunk_duration: 30.0,
            chunk_overlap: 5.0,
            max_retries: 3,
            language_hint: None,
            merge: MergeConfig::default(),
        }
    }
}

/// Backoff before re-enqueueing a `failed_retry` record, computed from how
/// many attempts it has burned: 1s, 2s, 4s, ... capped at 30s.
pub fn retry_backoff(retry_count: u32) -> Duration {
    let secs = 1u64 << retry_count.min(5);
    Duration::from_secs(secs.min(30))
}

/// Result of a successfully completed pipeline run.
#[derive(Debug, Clone)]
pub struct CompletedNote {
    pub content_hash: String,
    pub note_path: PathBuf,
    pub audio_archive_path: PathBuf,
    pub language: Option<String>,
}

/// Wires the stability/watch side to the collaborators and the state store.
pub struct Orchestrator {
    store: Arc<StateStore>,
    transcriber: Arc<dyn Transcriber>,
    annotator: Arc<dyn Annotator>,
    notes: Arc<dyn NoteWriter>,
    config: PipelineConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<StateStore>,
        transcriber: Arc<dyn Transcriber>,
        annotator: Arc<dyn Annotator>,
        notes: Arc<dyn NoteWriter>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            transcriber,
            annotator,
            notes,
            config,
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Run the whole pipeline for one file.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn process_file(&self, path: &Path) -> Result<CompletedNote, ProcessError> {
        let started = Instant::now();

        // Pre-flight: the file may have been evicted by the sync provider
        // between stabilization and pickup
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| ProcessError::TransientIo(format!("{}: {e}", path.display())))?;
        if metadata.len() == 0 {
            return Err(ProcessError::CorruptInput(format!(
                "{} is zero-length",
                path.display()
            )));
        }

        // Hash before anything moves the file; the hash is the identity
        let hash = compute_content_hash(path)
            .await
            .map_err(|e| ProcessError::TransientIo(format!("hashing {}: {e}", path.display())))?;

        let meta = FileMeta::probe(path)
            .map_err(|e| ProcessError::TransientIo(format!("{}: {e}", path.display())))?;

        // Single serialization point: exactly one concurrent caller per hash
        // gets past this gate
        let outcome = self
            .store
            .begin_processing(&hash, &meta)
            .map_err(|e| ProcessError::TransientIo(format!("state store: {e}")))?;

        match outcome {
            BeginOutcome::Accepted => {}
            BeginOutcome::AlreadyProcessed => {
                return Err(ProcessError::Duplicate {
                    hash,
                    reason: "already processed",
                })
            }
            BeginOutcome::InFlight => {
                return Err(ProcessError::Duplicate {
                    hash,
                    reason: "already being processed",
                })
            }
            BeginOutcome::RetriesExhausted => {
                return Err(ProcessError::Duplicate {
                    hash,
                    reason: "retries exhausted",
                })
            }
        }

        let result = self.execute_stages(path, &hash).await;
        let duration = started.elapsed().as_secs_f64();

        match result {
            Ok(completed) => {
                self.store
                    .record_success(
                        &hash,
                        duration,
                        completed.language.as_deref(),
                        &completed.note_path,
                        &completed.audio_archive_path,
                    )
                    .map_err(|e| ProcessError::TransientIo(format!("state store: {e}")))?;
                info!(
                    hash = %hash,
                    duration_secs = duration,
                    note = %completed.note_path.display(),
                    "File processed"
                );
                Ok(completed)
            }
            Err(e) => {
                let status = self
                    .store
                    .record_failure(
                        &hash,
                        duration,
                        &e.to_string(),
                        e.is_retryable(),
                        self.config.max_retries,
                    )
                    .map_err(|se| ProcessError::TransientIo(format!("state store: {se}")))?;

                warn!(hash = %hash, status = %status, error = %e, "Processing failed");

                // Budget spent: move the file aside so the watcher stops
                // rediscovering it
                if status == FileStatus::Failed && path.exists() {
                    let attempts = self
                        .store
                        .lookup(&hash)
                        .ok()
                        .flatten()
                        .map(|r| r.retry_count)
                        .unwrap_or(self.config.max_retries);
                    if let Err(move_err) =
                        self.notes.move_to_error(path, &e.to_string(), attempts).await
                    {
                        warn!(error = %move_err, "Could not quarantine failed file");
                    }
                }

                Err(e)
            }
        }
    }

    /// The fallible pipeline stages, run only after `begin_processing`
    /// accepted the claim.
    async fn execute_stages(&self, path: &Path, hash: &str) -> Result<CompletedNote, ProcessError> {
        let hint = self.config.language_hint.as_deref();

        let audio_duration = self
            .transcriber
            .duration(path)
            .await
            .map_err(ProcessError::external("transcriber"))?;

        let (text, language) = if audio_duration > self.config.chunk_threshold {
            self.transcribe_chunked(path, audio_duration, hint).await?
        } else {
            let transcript = self
                .transcriber
                .transcribe(path, hint)
                .await
                .map_err(ProcessError::external("transcriber"))?;
            (transcript.text, Some(transcript.language))
        };

        if text.trim().is_empty() {
            return Err(ProcessError::CorruptInput(format!(
                "{} produced an empty transcript",
                path.display()
            )));
        }

        let annotation = self
            .annotator
            .annotate(&text)
            .await
            .map_err(ProcessError::external("annotator"))?;

        let note_path = self
            .notes
            .write_note(&annotation, path)
            .await
            .map_err(|e| ProcessError::TransientIo(format!("writing note: {e}")))?;

        let audio_archive_path = self
            .notes
            .archive_audio(path)
            .await
            .map_err(|e| ProcessError::TransientIo(format!("archiving audio: {e}")))?;

        Ok(CompletedNote {
            content_hash: hash.to_string(),
            note_path,
            audio_archive_path,
            language,
        })
    }

    /// Transcribe a long recording as overlapping chunks and stitch the
    /// results with the merge engine.
    async fn transcribe_chunked(
        &self,
        path: &Path,
        total: f64,
        hint: Option<&str>,
    ) -> Result<(String, Option<String>), ProcessError> {
        let step = self.config.chunk_duration - self.config.chunk_overlap;
        if step <= 0.0 {
            return Err(ProcessError::CorruptInput(
                "chunk duration must exceed overlap".to_string(),
            ));
        }

        let mut chunks = Vec::new();
        let mut language = None;
        let mut start = 0.0;
        let mut index = 0;

        while start < total {
            let end = (start + self.config.chunk_duration).min(total);
            info!(chunk = index, start, end, "Transcribing chunk");

            let transcript = self
                .transcriber
                .transcribe_span(path, start, end - start, hint)
                .await
                .map_err(ProcessError::external("transcriber"))?;

            if language.is_none() && !transcript.language.is_empty() {
                language = Some(transcript.language.clone());
            }

            chunks.push(ChunkTranscript::new(index, start, end).with_segments(transcript.segments));

            if end >= total {
                break;
            }
            start += step;
            index += 1;
        }

        let segments = merge_chunks(&chunks, &self.config.merge);
        Ok((merged_text(&segments), language))
    }
}

#[async_trait]
impl JobHandler for Orchestrator {
    async fn run(&self, job: &Job) -> anyhow::Result<Option<String>> {
        match self.process_file(&job.file_path).await {
            Ok(completed) => Ok(Some(completed.content_hash)),
            // A duplicate is a skip, not a failure: the job completes cleanly
            Err(ProcessError::Duplicate { hash, reason }) => {
                info!(hash = %hash, reason, "Skipping duplicate content");
                Ok(Some(hash))
            }
            Err(e) => Err(e.into()),
        }
    }
}
