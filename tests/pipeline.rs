//! Pipeline Integration Tests
//!
//! Exercises the orchestrator end to end with mock collaborators: the
//! success path, duplicate-content skips, the retry budget, and chunked
//! transcription through the merge engine.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use echonote::adapters::{Annotation, Annotator, NoteWriter, Transcriber};
use echonote::core::{Orchestrator, PipelineConfig, ProcessError};
use echonote::domain::{FileStatus, Transcript, TranscriptSegment};
use echonote::store::StateStore;

/// Transcriber returning canned segments; optionally failing every call
struct FakeTranscriber {
    duration: f64,
    fail: bool,
    span_calls: Arc<AtomicUsize>,
}

impl FakeTranscriber {
    fn ok(duration: f64) -> Self {
        Self {
            duration,
            fail: false,
            span_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn failing(duration: f64) -> Self {
        Self {
            duration,
            fail: true,
            span_calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn duration(&self, _audio: &Path) -> Result<f64> {
        Ok(self.duration)
    }

    async fn transcribe(&self, _audio: &Path, _hint: Option<&str>) -> Result<Transcript> {
        if self.fail {
            anyhow::bail!("whisper exploded");
        }
        Ok(Transcript {
            text: "a short memo".to_string(),
            language: "en".to_string(),
            segments: vec![TranscriptSegment::new(0.0, 3.0, "a short memo")],
        })
    }

    async fn transcribe_span(
        &self,
        _audio: &Path,
        start: f64,
        duration: f64,
        _hint: Option<&str>,
    ) -> Result<Transcript> {
        if self.fail {
            anyhow::bail!("whisper exploded");
        }
        self.span_calls.fetch_add(1, Ordering::SeqCst);

        // Each chunk hears its own content in the middle, re-hears the
        // previous chunk's tail at its head, and (if full length) produces
        // the tail the next chunk will re-hear
        let mut segments = Vec::new();
        if start > 0.0 {
            segments.push(TranscriptSegment::new(0.0, 4.0, "and so it goes"));
        }
        segments.push(TranscriptSegment::new(
            6.0,
            10.0,
            format!("chunk starting at {start:.0}"),
        ));
        if duration >= 29.0 {
            segments.push(TranscriptSegment::new(24.0, 29.0, "and so it goes"));
        }

        Ok(Transcript {
            text: String::new(),
            language: "en".to_string(),
            segments,
        })
    }
}

struct FakeAnnotator;

#[async_trait]
impl Annotator for FakeAnnotator {
    async fn annotate(&self, transcript_text: &str) -> Result<Annotation> {
        Ok(Annotation {
            title: "Test note".to_string(),
            tags: vec!["test".to_string()],
            body: transcript_text.to_string(),
        })
    }
}

struct FakeNoteWriter {
    dir: PathBuf,
}

#[async_trait]
impl NoteWriter for FakeNoteWriter {
    async fn write_note(&self, annotation: &Annotation, _audio_ref: &Path) -> Result<PathBuf> {
        let path = self.dir.join("note.md");
        tokio::fs::write(&path, &annotation.body).await?;
        Ok(path)
    }

    async fn archive_audio(&self, audio: &Path) -> Result<PathBuf> {
        let target = self.dir.join("archive").join(audio.file_name().unwrap());
        tokio::fs::create_dir_all(target.parent().unwrap()).await?;
        tokio::fs::rename(audio, &target).await?;
        Ok(target)
    }

    async fn move_to_error(&self, audio: &Path, _reason: &str, _attempts: u32) -> Result<PathBuf> {
        let target = self.dir.join("errors").join(audio.file_name().unwrap());
        tokio::fs::create_dir_all(target.parent().unwrap()).await?;
        tokio::fs::rename(audio, &target).await?;
        Ok(target)
    }
}

fn orchestrator_with(
    temp: &TempDir,
    transcriber: FakeTranscriber,
    config: PipelineConfig,
) -> (Orchestrator, Arc<StateStore>) {
    let store = Arc::new(StateStore::open_in_memory().unwrap());
    let orchestrator = Orchestrator::new(
        Arc::clone(&store),
        Arc::new(transcriber),
        Arc::new(FakeAnnotator),
        Arc::new(FakeNoteWriter {
            dir: temp.path().to_path_buf(),
        }),
        config,
    );
    (orchestrator, store)
}

async fn write_audio(temp: &TempDir, name: &str, content: &[u8]) -> PathBuf {
    let path = temp.path().join(name);
    tokio::fs::write(&path, content).await.unwrap();
    path
}

#[tokio::test]
async fn test_success_path_records_outcome() {
    let temp = TempDir::new().unwrap();
    let audio = write_audio(&temp, "memo.m4a", b"fake audio bytes").await;

    let (orchestrator, store) =
        orchestrator_with(&temp, FakeTranscriber::ok(30.0), PipelineConfig::default());

    let completed = orchestrator.process_file(&audio).await.unwrap();
    assert!(completed.note_path.exists());
    assert_eq!(completed.language.as_deref(), Some("en"));

    let record = store.lookup(&completed.content_hash).unwrap().unwrap();
    assert_eq!(record.status, FileStatus::Success);
    assert_eq!(record.detected_language.as_deref(), Some("en"));
    assert!(record.note_path.is_some());
    assert!(record.processing_duration.is_some());

    // Source was archived away
    assert!(!audio.exists());
}

#[tokio::test]
async fn test_identical_content_different_path_is_duplicate() {
    let temp = TempDir::new().unwrap();
    let first = write_audio(&temp, "original.m4a", b"identical bytes").await;
    let second = write_audio(&temp, "copy-from-sync.m4a", b"identical bytes").await;

    let (orchestrator, _store) =
        orchestrator_with(&temp, FakeTranscriber::ok(30.0), PipelineConfig::default());

    orchestrator.process_file(&first).await.unwrap();

    let err = orchestrator.process_file(&second).await.unwrap_err();
    assert!(matches!(err, ProcessError::Duplicate { .. }));
    // The duplicate was not consumed
    assert!(second.exists());
}

#[tokio::test]
async fn test_retry_budget_exhaustion_goes_terminal() {
    let temp = TempDir::new().unwrap();
    let audio = write_audio(&temp, "memo.m4a", b"fake audio bytes").await;
    let hash = echonote::store::compute_content_hash(&audio).await.unwrap();

    let (orchestrator, store) = orchestrator_with(
        &temp,
        FakeTranscriber::failing(30.0),
        PipelineConfig::default(),
    );

    // Three retryable external failures exhaust the default budget
    for attempt in 1..=3u32 {
        let err = orchestrator.process_file(&audio).await.unwrap_err();
        assert!(matches!(err, ProcessError::ExternalService { .. }));

        let record = store.lookup(&hash).unwrap().unwrap();
        assert_eq!(record.retry_count, attempt);
        if attempt < 3 {
            assert_eq!(record.status, FileStatus::FailedRetry);
        } else {
            // Final status is failed, not failed_retry
            assert_eq!(record.status, FileStatus::Failed);
        }
    }

    // The exhausted file was quarantined
    assert!(!audio.exists());
    assert!(temp.path().join("errors").join("memo.m4a").exists());

    // And the record never re-enters processing
    let replacement = write_audio(&temp, "memo.m4a", b"fake audio bytes").await;
    let err = orchestrator.process_file(&replacement).await.unwrap_err();
    assert!(matches!(err, ProcessError::Duplicate { .. }));
}

#[tokio::test]
async fn test_zero_length_file_is_corrupt_not_retryable() {
    let temp = TempDir::new().unwrap();
    let audio = write_audio(&temp, "placeholder.m4a", b"").await;

    let (orchestrator, _store) =
        orchestrator_with(&temp, FakeTranscriber::ok(30.0), PipelineConfig::default());

    let err = orchestrator.process_file(&audio).await.unwrap_err();
    assert!(matches!(err, ProcessError::CorruptInput(_)));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_missing_file_is_transient() {
    let temp = TempDir::new().unwrap();
    let (orchestrator, _store) =
        orchestrator_with(&temp, FakeTranscriber::ok(30.0), PipelineConfig::default());

    let err = orchestrator
        .process_file(&temp.path().join("never-existed.m4a"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProcessError::TransientIo(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_long_audio_is_chunked_and_merged() {
    let temp = TempDir::new().unwrap();
    let audio = write_audio(&temp, "long.m4a", b"long fake audio").await;

    // 70s of audio with a 30s threshold and 30s/5s chunking → chunks at
    // 0, 25, 50
    let config = PipelineConfig {
        chunk_threshold: 30.0,
        chunk_duration: 30.0,
        chunk_overlap: 5.0,
        ..Default::default()
    };

    let transcriber = FakeTranscriber::ok(70.0);
    let (orchestrator, store) = orchestrator_with(&temp, transcriber, config);

    let completed = orchestrator.process_file(&audio).await.unwrap();
    let record = store.lookup(&completed.content_hash).unwrap().unwrap();
    assert_eq!(record.status, FileStatus::Success);

    // The merged note contains each chunk's own content exactly once, and
    // each overlap-window duplicate was collapsed to the earlier chunk's copy
    let note = tokio::fs::read_to_string(&completed.note_path).await.unwrap();
    assert!(note.contains("chunk starting at 0"));
    assert!(note.contains("chunk starting at 25"));
    assert!(note.contains("chunk starting at 50"));
    assert_eq!(note.matches("and so it goes").count(), 2);
}

#[tokio::test]
async fn test_short_audio_is_not_chunked() {
    let temp = TempDir::new().unwrap();
    let audio = write_audio(&temp, "short.m4a", b"short fake audio").await;

    let transcriber = FakeTranscriber::ok(30.0);
    let span_calls = Arc::clone(&transcriber.span_calls);
    let (orchestrator, _store) = orchestrator_with(&temp, transcriber, PipelineConfig::default());

    orchestrator.process_file(&audio).await.unwrap();

    // Below the threshold the chunked path is never taken
    assert_eq!(span_calls.load(Ordering::SeqCst), 0);
}
