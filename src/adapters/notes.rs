//! Markdown note writer.
//!
//! Writes annotated notes with YAML frontmatter into the vault, archives the
//! source audio into a dated subfolder, and quarantines permanently failed
//! files into `errors/` with a JSON sidecar describing the failure.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use super::{Annotation, NoteWriter};

/// Note writer rooted at a vault directory.
pub struct MarkdownNoteWriter {
    notes_dir: PathBuf,
    audio_dir: PathBuf,
    error_dir: PathBuf,
}

impl MarkdownNoteWriter {
    pub fn new(vault_path: &Path, notes_folder: &str, error_dir: &Path) -> Self {
        let notes_dir = vault_path.join(notes_folder);
        let audio_dir = notes_dir.join("audio");
        Self {
            notes_dir,
            audio_dir,
            error_dir: error_dir.to_path_buf(),
        }
    }

    /// Strip characters that are invalid in filenames on any platform
    fn sanitize_filename(name: &str) -> String {
        let cleaned: String = name
            .chars()
            .filter(|c| !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*'))
            .collect();
        cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// Pick a path that does not collide with an existing file
    fn unique_path(dir: &Path, stem: &str, ext: &str) -> PathBuf {
        let candidate = dir.join(format!("{stem}.{ext}"));
        if !candidate.exists() {
            return candidate;
        }
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        dir.join(format!("{stem}_{stamp}.{ext}"))
    }
}

#[async_trait]
impl NoteWriter for MarkdownNoteWriter {
    async fn write_note(&self, annotation: &Annotation, audio_ref: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.notes_dir)
            .await
            .context("Failed to create notes directory")?;

        let stem = Self::sanitize_filename(&annotation.title);
        let stem = if stem.is_empty() {
            format!("note-{}", Utc::now().format("%Y-%m-%d_%H%M%S"))
        } else {
            stem
        };
        let note_path = Self::unique_path(&self.notes_dir, &stem, "md");

        let audio_name = audio_ref
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();

        let mut content = String::new();
        content.push_str("---\n");
        content.push_str(&format!("title: \"{}\"\n", annotation.title.replace('"', "'")));
        content.push_str(&format!("date: {}\n", Utc::now().format("%Y-%m-%d %H:%M")));
        if !annotation.tags.is_empty() {
            content.push_str("tags:\n");
            for tag in &annotation.tags {
                content.push_str(&format!("  - {tag}\n"));
            }
        }
        content.push_str("---\n\n");
        content.push_str(&annotation.body);
        content.push_str(&format!("\n\n![[{audio_name}]]\n"));

        tokio::fs::write(&note_path, content)
            .await
            .with_context(|| format!("Failed to write note: {}", note_path.display()))?;

        tracing::info!("Note written: {}", note_path.display());
        Ok(note_path)
    }

    async fn archive_audio(&self, audio: &Path) -> Result<PathBuf> {
        let dated = self.audio_dir.join(Utc::now().format("%Y-%m-%d").to_string());
        tokio::fs::create_dir_all(&dated)
            .await
            .context("Failed to create audio archive directory")?;

        let file_name = audio.file_name().unwrap_or_default().to_string_lossy();
        let stem = audio.file_stem().unwrap_or_default().to_string_lossy();
        let ext = audio.extension().unwrap_or_default().to_string_lossy();
        let target = if dated.join(&*file_name).exists() {
            Self::unique_path(&dated, &stem, &ext)
        } else {
            dated.join(&*file_name)
        };

        // rename fails across filesystems; fall back to copy + remove
        if tokio::fs::rename(audio, &target).await.is_err() {
            tokio::fs::copy(audio, &target)
                .await
                .with_context(|| format!("Failed to archive audio: {}", audio.display()))?;
            tokio::fs::remove_file(audio).await.ok();
        }

        tracing::info!("Audio archived: {}", target.display());
        Ok(target)
    }

    async fn move_to_error(&self, audio: &Path, reason: &str, attempts: u32) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.error_dir)
            .await
            .context("Failed to create error directory")?;

        let file_name = audio.file_name().unwrap_or_default().to_string_lossy();
        let stem = audio.file_stem().unwrap_or_default().to_string_lossy();
        let ext = audio.extension().unwrap_or_default().to_string_lossy();
        let target = if self.error_dir.join(&*file_name).exists() {
            Self::unique_path(&self.error_dir, &stem, &ext)
        } else {
            self.error_dir.join(&*file_name)
        };

        if tokio::fs::rename(audio, &target).await.is_err() {
            tokio::fs::copy(audio, &target)
                .await
                .with_context(|| format!("Failed to quarantine audio: {}", audio.display()))?;
            tokio::fs::remove_file(audio).await.ok();
        }

        // Sidecar recording why the file ended up here
        let sidecar = target.with_extension(format!("{ext}.error"));
        let metadata = json!({
            "original_path": audio.to_string_lossy(),
            "failed_at": Utc::now().to_rfc3339(),
            "attempts": attempts,
            "last_error": reason,
        });
        tokio::fs::write(&sidecar, serde_json::to_vec_pretty(&metadata)?)
            .await
            .context("Failed to write error sidecar")?;

        tracing::warn!("Moved failed file to {}", target.display());
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn writer(temp: &TempDir) -> MarkdownNoteWriter {
        MarkdownNoteWriter::new(temp.path(), "notes", &temp.path().join("errors"))
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(
            MarkdownNoteWriter::sanitize_filename("Call: plan/review?  draft"),
            "Call planreview draft"
        );
    }

    #[tokio::test]
    async fn test_write_note_with_frontmatter() {
        let temp = TempDir::new().unwrap();
        let writer = writer(&temp);

        let annotation = Annotation {
            title: "Morning thoughts".to_string(),
            tags: vec!["journal".to_string(), "ideas".to_string()],
            body: "Remember the bridge idea.".to_string(),
        };

        let note = writer
            .write_note(&annotation, Path::new("/watch/memo.m4a"))
            .await
            .unwrap();

        let content = tokio::fs::read_to_string(&note).await.unwrap();
        assert!(content.starts_with("---\n"));
        assert!(content.contains("  - journal"));
        assert!(content.contains("Remember the bridge idea."));
        assert!(content.contains("![[memo.m4a]]"));
    }

    #[tokio::test]
    async fn test_archive_moves_file() {
        let temp = TempDir::new().unwrap();
        let writer = writer(&temp);

        let audio = temp.path().join("memo.m4a");
        tokio::fs::write(&audio, b"audio").await.unwrap();

        let archived = writer.archive_audio(&audio).await.unwrap();
        assert!(archived.exists());
        assert!(!audio.exists());
    }

    #[tokio::test]
    async fn test_move_to_error_writes_sidecar() {
        let temp = TempDir::new().unwrap();
        let writer = writer(&temp);

        let audio = temp.path().join("broken.m4a");
        tokio::fs::write(&audio, b"audio").await.unwrap();

        let quarantined = writer
            .move_to_error(&audio, "transcription failed", 3)
            .await
            .unwrap();
        assert!(quarantined.exists());

        let sidecar = quarantined.with_extension("m4a.error");
        let content = tokio::fs::read_to_string(&sidecar).await.unwrap();
        assert!(content.contains("transcription failed"));
        assert!(content.contains("\"attempts\": 3"));
    }
}
