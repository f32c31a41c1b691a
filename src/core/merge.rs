//! Chunk merge engine.
//!
//! Long recordings are transcribed as overlapping chunks; adjacent chunks
//! share an overlap window so neither side loses words at the seam. This
//! module stitches the per-chunk segments back into one transcript,
//! discarding duplicate recognitions of the shared audio span.
//!
//! The merge is a pure function: no I/O, no side effects, and identical
//! input always yields identical output.

use crate::domain::{ChunkTranscript, TranscriptSegment};

/// Tunable merge parameters.
#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Token-overlap ratio at or above which two segments in the shared
    /// window are judged duplicate recognitions of the same audio
    pub similarity_threshold: f64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.6,
        }
    }
}

/// A segment carried through the merge with its originating chunk.
#[derive(Debug, Clone)]
struct GlobalSegment {
    chunk_index: usize,
    segment: TranscriptSegment,
}

/// Merge per-chunk transcripts into one deduplicated, time-ordered list.
///
/// Segments are globalized by adding each chunk's start offset, sorted by
/// global start time, then deduplicated inside each adjacent-chunk overlap
/// window: when two segments from neighbouring chunks say (nearly) the same
/// thing, the earlier chunk's segment wins because it had full left context.
pub fn merge_chunks(chunks: &[ChunkTranscript], config: &MergeConfig) -> Vec<TranscriptSegment> {
    let mut ordered: Vec<&ChunkTranscript> = chunks.iter().collect();
    ordered.sort_by_key(|c| c.index);

    // Globalize chunk-local timestamps
    let mut segments: Vec<GlobalSegment> = Vec::new();
    for chunk in &ordered {
        for seg in &chunk.segments {
            segments.push(GlobalSegment {
                chunk_index: chunk.index,
                segment: TranscriptSegment::new(
                    seg.start + chunk.start_offset,
                    seg.end + chunk.start_offset,
                    seg.text.clone(),
                ),
            });
        }
    }

    // Drop later-chunk duplicates inside each adjacent overlap window
    for pair in ordered.windows(2) {
        let (earlier, later) = (pair[0], pair[1]);

        // Shared window: [later.start, earlier.end). Empty when chunks abut.
        let window_start = later.start_offset;
        let window_end = earlier.end_offset;
        if window_end <= window_start {
            continue;
        }

        let earlier_in_window: Vec<TranscriptSegment> = segments
            .iter()
            .filter(|g| {
                g.chunk_index == earlier.index
                    && overlaps_window(&g.segment, window_start, window_end)
            })
            .map(|g| g.segment.clone())
            .collect();

        segments.retain(|g| {
            if g.chunk_index != later.index || !overlaps_window(&g.segment, window_start, window_end)
            {
                return true;
            }
            // Keep the later segment only if no earlier-chunk segment in the
            // window says the same thing
            !earlier_in_window
                .iter()
                .any(|e| token_overlap(&e.text, &g.segment.text) >= config.similarity_threshold)
        });
    }

    // Deterministic total order: start time, then chunk index
    segments.sort_by(|a, b| {
        a.segment
            .start
            .total_cmp(&b.segment.start)
            .then(a.chunk_index.cmp(&b.chunk_index))
    });

    // Seam heuristic: when two kept segments from adjacent chunks meet exactly
    // at the window boundary and the earlier one was cut mid-word, trim its
    // dangling final token
    trim_boundary_partials(&mut segments, &ordered);

    segments.into_iter().map(|g| g.segment).collect()
}

/// Join merged segment texts with single spaces, preserving the punctuation
/// each segment already carries.
pub fn merged_text(segments: &[TranscriptSegment]) -> String {
    segments
        .iter()
        .map(|s| s.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn overlaps_window(segment: &TranscriptSegment, window_start: f64, window_end: f64) -> bool {
    segment.start < window_end && segment.end > window_start
}

/// Normalized token overlap: |A ∩ B| / |A ∪ B| over lowercased,
/// punctuation-stripped tokens. 1.0 for identical token sets, 0.0 for
/// disjoint ones; empty inputs compare as 0.0.
pub fn token_overlap(a: &str, b: &str) -> f64 {
    let ta = tokens(a);
    let tb = tokens(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }

    let intersection = ta.iter().filter(|t| tb.contains(*t)).count();
    let union = ta.len() + tb.len() - intersection;
    intersection as f64 / union as f64
}

fn tokens(text: &str) -> Vec<String> {
    let mut out: Vec<String> = text
        .split_whitespace()
        .map(|w| {
            w.chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

/// If a kept earlier-chunk segment ends exactly at its chunk boundary and its
/// final token is a strict prefix of the next kept later-chunk segment's
/// first token, the boundary cut it mid-word: drop the dangling token.
fn trim_boundary_partials(segments: &mut [GlobalSegment], chunks: &[&ChunkTranscript]) {
    for i in 0..segments.len().saturating_sub(1) {
        let (left, right) = (&segments[i], &segments[i + 1]);
        if left.chunk_index + 1 != right.chunk_index {
            continue;
        }

        let Some(chunk) = chunks.iter().find(|c| c.index == left.chunk_index) else {
            continue;
        };
        if left.segment.end != chunk.end_offset {
            continue;
        }

        let last = left.segment.text.split_whitespace().last().unwrap_or("");
        let first = right.segment.text.split_whitespace().next().unwrap_or("");
        let last_norm = last.to_lowercase();
        let first_norm = first.to_lowercase();

        if !last_norm.is_empty()
            && first_norm.starts_with(&last_norm)
            && first_norm.len() > last_norm.len()
        {
            let text = &segments[i].segment.text;
            let trimmed = text[..text.len() - last.len()].trim_end().to_string();
            segments[i].segment.text = trimmed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(
        index: usize,
        start: f64,
        end: f64,
        segs: &[(f64, f64, &str)],
    ) -> ChunkTranscript {
        ChunkTranscript::new(index, start, end).with_segments(
            segs.iter()
                .map(|(s, e, t)| TranscriptSegment::new(*s, *e, *t))
                .collect(),
        )
    }

    #[test]
    fn test_token_overlap_identical() {
        assert!((token_overlap("see you later", "See you later!") - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_token_overlap_partial() {
        // {see, you, later} vs {see, you, later, today} = 3/4
        let sim = token_overlap("see you later", "see you later today");
        assert!((sim - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_token_overlap_disjoint() {
        assert_eq!(token_overlap("alpha beta", "gamma delta"), 0.0);
        assert_eq!(token_overlap("", "anything"), 0.0);
    }

    #[test]
    fn test_single_chunk_passthrough() {
        // Offsets are applied even with nothing to deduplicate
        let chunks = vec![chunk(0, 10.0, 40.0, &[(0.0, 5.0, "hello there")])];
        let merged = merge_chunks(&chunks, &MergeConfig::default());
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].start, 10.0);
        assert_eq!(merged[0].end, 15.0);
    }

    #[test]
    fn test_non_overlapping_is_sorted_concatenation() {
        // With an empty overlap window, merge equals concatenation sorted
        // by start time
        let chunks = vec![
            chunk(1, 30.0, 60.0, &[(0.0, 4.0, "second part")]),
            chunk(0, 0.0, 30.0, &[(2.0, 6.0, "first part"), (10.0, 14.0, "more")]),
        ];
        let merged = merge_chunks(&chunks, &MergeConfig::default());
        let texts: Vec<&str> = merged.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["first part", "more", "second part"]);
    }

    #[test]
    fn test_overlap_duplicate_earlier_chunk_wins() {
        // Chunk A covers [0,30) with (25,30,"see you later"); chunk B covers
        // [25,55) with (0,6,"see you later today") — global (25,31).
        // Similarity 0.75 >= 0.6, so A's segment survives and B's duplicate
        // is dropped; B's tail content past the window is appended.
        let chunks = vec![
            chunk(0, 0.0, 30.0, &[(25.0, 30.0, "see you later")]),
            chunk(
                1,
                25.0,
                55.0,
                &[(0.0, 6.0, "see you later today"), (7.0, 12.0, "next topic")],
            ),
        ];
        let merged = merge_chunks(&chunks, &MergeConfig::default());
        let texts: Vec<&str> = merged.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["see you later", "next topic"]);
        assert_eq!(merged[1].start, 32.0);
    }

    #[test]
    fn test_overlap_distinct_content_both_kept() {
        // Below-threshold similarity means the later chunk genuinely heard
        // something different; both segments are kept in time order
        let chunks = vec![
            chunk(0, 0.0, 30.0, &[(26.0, 29.0, "wrapping up now")]),
            chunk(1, 25.0, 55.0, &[(2.0, 5.0, "totally different words")]),
        ];
        let merged = merge_chunks(&chunks, &MergeConfig::default());
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].text, "wrapping up now");
        assert_eq!(merged[1].text, "totally different words");
    }

    #[test]
    fn test_determinism() {
        let chunks = vec![
            chunk(
                0,
                0.0,
                30.0,
                &[(1.0, 5.0, "one"), (25.0, 30.0, "see you later")],
            ),
            chunk(
                1,
                25.0,
                55.0,
                &[(0.0, 6.0, "see you later today"), (10.0, 14.0, "two")],
            ),
        ];
        let config = MergeConfig::default();
        let first = merge_chunks(&chunks, &config);
        for _ in 0..10 {
            assert_eq!(merge_chunks(&chunks, &config), first);
        }
    }

    #[test]
    fn test_threshold_is_tunable() {
        let chunks = vec![
            chunk(0, 0.0, 30.0, &[(25.0, 30.0, "see you later")]),
            chunk(1, 25.0, 55.0, &[(0.0, 6.0, "see you later today")]),
        ];

        // Default threshold drops the near-duplicate
        let merged = merge_chunks(&chunks, &MergeConfig::default());
        assert_eq!(merged.len(), 1);

        // A stricter threshold keeps both
        let strict = MergeConfig {
            similarity_threshold: 0.9,
        };
        let merged = merge_chunks(&chunks, &strict);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_boundary_partial_word_trim() {
        // Earlier segment ends exactly at the chunk boundary mid-word;
        // the later chunk heard the whole word
        let chunks = vec![
            chunk(0, 0.0, 30.0, &[(26.0, 30.0, "meeting with the accoun")]),
            chunk(1, 25.0, 55.0, &[(5.0, 9.0, "accountant tomorrow morning")]),
        ];
        let merged = merge_chunks(&chunks, &MergeConfig::default());
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].text, "meeting with the");
        assert_eq!(merged[1].text, "accountant tomorrow morning");
    }

    #[test]
    fn test_merged_text_joins_with_single_spaces() {
        let segments = vec![
            TranscriptSegment::new(0.0, 2.0, " First sentence. "),
            TranscriptSegment::new(2.0, 4.0, "Second one."),
            TranscriptSegment::new(4.0, 5.0, "  "),
        ];
        assert_eq!(merged_text(&segments), "First sentence. Second one.");
    }
}
