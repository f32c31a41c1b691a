//! Transcript types.
//!
//! `ChunkTranscript` is transient: produced per chunk during chunked
//! transcription, consumed by the merge engine, never persisted.

use serde::{Deserialize, Serialize};

/// One recognized span of speech, timestamped in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    /// Start time in seconds
    pub start: f64,

    /// End time in seconds
    pub end: f64,

    pub text: String,
}

impl TranscriptSegment {
    pub fn new(start: f64, end: f64, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
        }
    }
}

/// Result of transcribing a whole file (or one chunk of it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,

    /// Detected language code, e.g. "en"
    pub language: String,

    /// Ordered segments with timestamps relative to the transcribed input
    pub segments: Vec<TranscriptSegment>,
}

/// Segments of one chunk of a longer recording.
///
/// Segment timestamps are local to the chunk; the merge engine globalizes
/// them by adding `start_offset`.
#[derive(Debug, Clone)]
pub struct ChunkTranscript {
    /// Position of this chunk in the source audio (0-based)
    pub index: usize,

    /// Where this chunk begins in the source audio, seconds
    pub start_offset: f64,

    /// Where this chunk ends in the source audio, seconds
    pub end_offset: f64,

    /// Segments with chunk-local timestamps
    pub segments: Vec<TranscriptSegment>,
}

impl ChunkTranscript {
    pub fn new(index: usize, start_offset: f64, end_offset: f64) -> Self {
        Self {
            index,
            start_offset,
            end_offset,
            segments: Vec::new(),
        }
    }

    pub fn with_segments(mut self, segments: Vec<TranscriptSegment>) -> Self {
        self.segments = segments;
        self
    }
}
