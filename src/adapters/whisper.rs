//! Whisper transcription backend.
//!
//! Shells out to a local whisper binary. Chunk spans are cut with ffmpeg
//! into a temp dir first, since whisper itself only takes whole files.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use super::Transcriber;
use crate::domain::{Transcript, TranscriptSegment};

/// Whisper output JSON structure
#[derive(Debug, Deserialize)]
struct WhisperOutput {
    text: String,
    #[serde(default)]
    language: String,
    #[serde(default)]
    segments: Vec<WhisperSegment>,
}

#[derive(Debug, Deserialize)]
struct WhisperSegment {
    #[serde(default)]
    start: f64,
    #[serde(default)]
    end: f64,
    #[serde(default)]
    text: String,
}

/// ffprobe `-show_entries format=duration` JSON shape
#[derive(Debug, Deserialize)]
struct ProbeOutput {
    format: ProbeFormat,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: String,
}

/// Local Whisper binary wrapper.
pub struct WhisperTranscriber {
    whisper_path: PathBuf,
    model: String,
}

impl WhisperTranscriber {
    pub fn new(model: impl Into<String>) -> Self {
        let whisper_path = std::env::var("WHISPER_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("whisper"));
        Self {
            whisper_path,
            model: model.into(),
        }
    }

    async fn run_whisper(&self, audio: &Path, language_hint: Option<&str>) -> Result<Transcript> {
        let temp_dir = tempfile::tempdir().context("Failed to create temp dir")?;

        let mut cmd = Command::new(&self.whisper_path);
        cmd.arg(audio)
            .arg("--model")
            .arg(&self.model)
            .arg("--output_dir")
            .arg(temp_dir.path())
            .arg("--output_format")
            .arg("json")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(lang) = language_hint {
            cmd.arg("--language").arg(lang);
        }

        let output = cmd.output().await.context("Failed to run whisper")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Whisper failed: {}", stderr);
        }

        // Whisper writes <stem>.json into the output dir
        let stem = audio.file_stem().unwrap_or_default().to_string_lossy();
        let json_path = temp_dir.path().join(format!("{}.json", stem));

        let json_content = tokio::fs::read_to_string(&json_path)
            .await
            .context("Failed to read whisper output")?;

        let whisper: WhisperOutput =
            serde_json::from_str(&json_content).context("Failed to parse whisper JSON")?;

        Ok(Transcript {
            text: whisper.text.trim().to_string(),
            language: if whisper.language.is_empty() {
                "unknown".to_string()
            } else {
                whisper.language
            },
            segments: whisper
                .segments
                .into_iter()
                .map(|s| TranscriptSegment::new(s.start, s.end, s.text.trim().to_string()))
                .collect(),
        })
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn duration(&self, audio: &Path) -> Result<f64> {
        let output = Command::new("ffprobe")
            .args(["-v", "error", "-show_entries", "format=duration", "-of", "json"])
            .arg(audio)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to run ffprobe")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("ffprobe failed: {}", stderr);
        }

        let probe: ProbeOutput =
            serde_json::from_slice(&output.stdout).context("Failed to parse ffprobe JSON")?;
        probe
            .format
            .duration
            .parse::<f64>()
            .context("ffprobe returned a non-numeric duration")
    }

    async fn transcribe(&self, audio: &Path, language_hint: Option<&str>) -> Result<Transcript> {
        self.run_whisper(audio, language_hint).await
    }

    async fn transcribe_span(
        &self,
        audio: &Path,
        start: f64,
        duration: f64,
        language_hint: Option<&str>,
    ) -> Result<Transcript> {
        let temp_dir = tempfile::tempdir().context("Failed to create temp dir")?;
        let span_path = temp_dir.path().join("span.wav");

        // Cut the span out with ffmpeg; whisper gets a standalone wav whose
        // timestamps start at zero
        let output = Command::new("ffmpeg")
            .args(["-v", "error", "-ss"])
            .arg(format!("{start}"))
            .args(["-t"])
            .arg(format!("{duration}"))
            .arg("-i")
            .arg(audio)
            .args(["-ar", "16000", "-ac", "1"])
            .arg(&span_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to run ffmpeg")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("ffmpeg failed extracting span: {}", stderr);
        }

        self.run_whisper(&span_path, language_hint).await
    }
}
