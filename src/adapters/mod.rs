//! Collaborator interfaces for external systems.
//!
//! The pipeline core consumes transcription, annotation and note persistence
//! through these capability traits; concrete backends are injected into the
//! orchestrator so they can be swapped (or mocked in tests) without touching
//! pipeline logic.

pub mod notes;
pub mod ollama;
pub mod whisper;

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;

use crate::domain::Transcript;

pub use notes::MarkdownNoteWriter;
pub use ollama::OllamaAnnotator;
pub use whisper::WhisperTranscriber;

/// Structured note content produced by the annotation step.
#[derive(Debug, Clone)]
pub struct Annotation {
    pub title: String,
    pub tags: Vec<String>,
    pub body: String,
}

/// Speech-to-text backend.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Duration of the audio in seconds, used to decide whether to chunk
    async fn duration(&self, audio: &Path) -> Result<f64>;

    /// Transcribe a whole file
    async fn transcribe(&self, audio: &Path, language_hint: Option<&str>) -> Result<Transcript>;

    /// Transcribe one time span of the file; segment timestamps in the
    /// result are relative to `start`
    async fn transcribe_span(
        &self,
        audio: &Path,
        start: f64,
        duration: f64,
        language_hint: Option<&str>,
    ) -> Result<Transcript>;
}

/// LLM annotation backend: turns a raw transcript into a titled, tagged note.
#[async_trait]
pub trait Annotator: Send + Sync {
    async fn annotate(&self, transcript_text: &str) -> Result<Annotation>;
}

/// Persists the final note artifact and relocates source audio.
#[async_trait]
pub trait NoteWriter: Send + Sync {
    /// Write the note, returning its path
    async fn write_note(&self, annotation: &Annotation, audio_ref: &Path) -> Result<PathBuf>;

    /// Move successfully processed audio into the archive, returning the new path
    async fn archive_audio(&self, audio: &Path) -> Result<PathBuf>;

    /// Move a permanently failed file aside with a reason sidecar
    async fn move_to_error(&self, audio: &Path, reason: &str, attempts: u32) -> Result<PathBuf>;
}
