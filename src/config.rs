//! Configuration for echonote.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (WATCH_FOLDER, OBSIDIAN_VAULT_PATH, OLLAMA_*, ...)
//! 2. Config file (.echonote/config.yaml, searched upward from the cwd)
//! 3. Defaults (~/.echonote for engine state)
//!
//! Paths in the config file are resolved relative to the config file's
//! parent directory.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::{MergeConfig, PipelineConfig, QueueConfig};
use crate::ingest::{StabilityConfig, WatcherConfig};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<std::result::Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub processing: ProcessingSection,
    #[serde(default)]
    pub ollama: OllamaSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsSection {
    /// Folder to watch for new audio
    pub watch_folder: Option<String>,
    /// Vault root the notes are written into
    pub vault: Option<String>,
    /// Notes subfolder inside the vault
    pub notes_folder: Option<String>,
    /// Engine state directory (database lives here)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProcessingSection {
    pub max_concurrent: Option<usize>,
    pub queue_capacity: Option<usize>,
    pub max_retries: Option<u32>,
    pub retention_days: Option<i64>,
    pub required_stable_polls: Option<u32>,
    pub stuck_timeout_secs: Option<u64>,
    pub chunk_threshold_secs: Option<f64>,
    pub chunk_duration_secs: Option<f64>,
    pub chunk_overlap_secs: Option<f64>,
    pub similarity_threshold: Option<f64>,
    pub whisper_model: Option<String>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OllamaSection {
    pub api_url: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub timeout_secs: Option<u64>,
}

/// Resolved configuration with absolute paths and all defaults applied
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Engine state directory
    pub home: PathBuf,

    /// Folder to watch (required for watch/scan commands only)
    pub watch_folder: Option<PathBuf>,

    /// Vault root (required for processing)
    pub vault_path: Option<PathBuf>,

    pub notes_folder: String,

    pub max_concurrent: usize,
    pub queue_capacity: usize,
    pub max_retries: u32,
    pub retention_days: i64,

    pub required_stable_polls: u32,
    pub stuck_timeout: Duration,

    pub chunk_threshold: f64,
    pub chunk_duration: f64,
    pub chunk_overlap: f64,
    pub similarity_threshold: f64,

    pub whisper_model: String,
    pub language: Option<String>,

    pub ollama_api_url: String,
    pub ollama_model: Option<String>,
    pub ollama_temperature: f64,
    pub ollama_timeout: Duration,

    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl ResolvedConfig {
    /// Path of the SQLite state database
    pub fn state_db_path(&self) -> PathBuf {
        self.home.join("state.db")
    }

    /// Quarantine folder for permanently failed files
    pub fn error_dir(&self) -> Result<PathBuf> {
        Ok(self.require_watch_folder()?.join("errors"))
    }

    pub fn require_watch_folder(&self) -> Result<&PathBuf> {
        self.watch_folder
            .as_ref()
            .context("WATCH_FOLDER is not configured")
    }

    pub fn require_vault_path(&self) -> Result<&PathBuf> {
        self.vault_path
            .as_ref()
            .context("OBSIDIAN_VAULT_PATH is not configured")
    }

    pub fn require_ollama_model(&self) -> Result<&str> {
        self.ollama_model
            .as_deref()
            .context("OLLAMA_MODEL is not configured")
    }

    pub fn watcher_config(&self) -> Result<WatcherConfig> {
        Ok(WatcherConfig {
            watch_path: self.require_watch_folder()?.clone(),
            stability: StabilityConfig {
                required_stable_polls: self.required_stable_polls,
                stuck_timeout: self.stuck_timeout,
            },
            ..WatcherConfig::default()
        })
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            pool_size: self.max_concurrent,
            capacity: self.queue_capacity,
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            chunk_threshold: self.chunk_threshold,
            chunk_duration: self.chunk_duration,
            chunk_overlap: self.chunk_overlap,
            max_retries: self.max_retries,
            language_hint: self.language.clone(),
            merge: MergeConfig {
                similarity_threshold: self.similarity_threshold,
            },
        }
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".echonote").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path_str)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_var(name).and_then(|v| v.parse().ok())
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".echonote");

    let config_file = find_config_file();
    let (file, base_dir) = match &config_file {
        Some(path) => {
            let base = path
                .parent() // .echonote/
                .and_then(|p| p.parent()) // project root
                .unwrap_or(Path::new("."))
                .to_path_buf();
            (load_config_file(path)?, base)
        }
        None => (ConfigFile::default(), PathBuf::from(".")),
    };

    let home = env_var("ECHONOTE_HOME")
        .map(PathBuf::from)
        .or_else(|| file.paths.home.as_deref().map(|p| resolve_path(&base_dir, p)))
        .unwrap_or(default_home);

    let watch_folder = env_var("WATCH_FOLDER")
        .map(PathBuf::from)
        .or_else(|| {
            file.paths
                .watch_folder
                .as_deref()
                .map(|p| resolve_path(&base_dir, p))
        });

    let vault_path = env_var("OBSIDIAN_VAULT_PATH")
        .map(PathBuf::from)
        .or_else(|| file.paths.vault.as_deref().map(|p| resolve_path(&base_dir, p)));

    let notes_folder = env_var("NOTES_FOLDER")
        .or(file.paths.notes_folder)
        .unwrap_or_else(|| "notes".to_string());

    let processing = file.processing;
    let ollama = file.ollama;

    Ok(ResolvedConfig {
        home,
        watch_folder,
        vault_path,
        notes_folder,
        max_concurrent: env_parse("MAX_CONCURRENT_PROCESSING")
            .or(processing.max_concurrent)
            .unwrap_or(1),
        queue_capacity: processing.queue_capacity.unwrap_or(100),
        max_retries: env_parse("MAX_RETRY_ATTEMPTS")
            .or(processing.max_retries)
            .unwrap_or(3),
        retention_days: processing.retention_days.unwrap_or(90),
        required_stable_polls: processing.required_stable_polls.unwrap_or(3),
        stuck_timeout: Duration::from_secs(processing.stuck_timeout_secs.unwrap_or(60)),
        chunk_threshold: env_parse("WHISPER_CHUNK_THRESHOLD")
            .or(processing.chunk_threshold_secs)
            .unwrap_or(240.0),
        chunk_duration: env_parse("WHISPER_CHUNK_DURATION")
            .or(processing.chunk_duration_secs)
            .unwrap_or(30.0),
        chunk_overlap: env_parse("WHISPER_CHUNK_OVERLAP")
            .or(processing.chunk_overlap_secs)
            .unwrap_or(5.0),
        similarity_threshold: processing.similarity_threshold.unwrap_or(0.6),
        whisper_model: env_var("WHISPER_MODEL_SIZE")
            .or(processing.whisper_model)
            .unwrap_or_else(|| "medium".to_string()),
        language: env_var("TRANSCRIPTION_LANGUAGE").or(processing.language),
        ollama_api_url: env_var("OLLAMA_API_URL")
            .or(ollama.api_url)
            .unwrap_or_else(|| "http://localhost:11434/api/generate".to_string()),
        ollama_model: env_var("OLLAMA_MODEL").or(ollama.model),
        ollama_temperature: env_parse("OLLAMA_TEMPERATURE")
            .or(ollama.temperature)
            .unwrap_or(0.3),
        ollama_timeout: Duration::from_secs(
            env_parse("OLLAMA_TIMEOUT")
                .or(ollama.timeout_secs)
                .unwrap_or(120),
        ),
        config_file,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}
