//! Ollama annotation backend.
//!
//! Sends the transcript to a local Ollama instance and parses the model's
//! JSON reply into a titled, tagged note. Retries with exponential backoff;
//! the read timeout doubles per attempt because a cold model load can make
//! the first call far slower than the rest.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{Annotation, Annotator};

const MAX_ATTEMPTS: u32 = 3;
const BASE_DELAY: Duration = Duration::from_secs(1);

/// Ollama generate-endpoint response shape
#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Expected shape of the model's reply
#[derive(Debug, Deserialize)]
struct NotePayload {
    title: String,
    #[serde(default)]
    tags: Vec<String>,
    body: String,
}

/// Ollama HTTP client configuration
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    /// Generate endpoint, e.g. http://localhost:11434/api/generate
    pub api_url: String,
    pub model: String,
    pub temperature: f64,
    /// Base read timeout; doubled per retry attempt
    pub read_timeout: Duration,
}

/// LLM annotator backed by a local Ollama server.
pub struct OllamaAnnotator {
    config: OllamaConfig,
}

impl OllamaAnnotator {
    pub fn new(config: OllamaConfig) -> Self {
        Self { config }
    }

    fn prompt(transcript: &str) -> String {
        format!(
            "You are a note-taking assistant. The text below is a transcript \
             of a spoken personal note. Reply with JSON only, in the form \
             {{\"title\": \"...\", \"tags\": [\"...\"], \"body\": \"...\"}}. \
             The title is short and descriptive, tags are lowercase single \
             words, and the body is the cleaned-up note in markdown.\n\n\
             Transcript:\n{transcript}"
        )
    }

    async fn call_once(&self, prompt: &str, read_timeout: Duration) -> Result<String> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(read_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        let response = client
            .post(&self.config.api_url)
            .json(&json!({
                "model": self.config.model,
                "prompt": prompt,
                "stream": false,
                "temperature": self.config.temperature,
            }))
            .send()
            .await
            .context("Ollama request failed")?
            .error_for_status()
            .context("Ollama returned an error status")?;

        let body: GenerateResponse = response
            .json()
            .await
            .context("Failed to parse Ollama response")?;
        Ok(body.response)
    }

    /// Pull the JSON object out of the model reply. Models sometimes wrap
    /// the JSON in prose or code fences; take the outermost braces.
    fn extract_payload(reply: &str) -> Result<NotePayload> {
        let start = reply.find('{');
        let end = reply.rfind('}');
        let candidate = match (start, end) {
            (Some(s), Some(e)) if e > s => &reply[s..=e],
            _ => anyhow::bail!("No JSON object in model reply"),
        };

        serde_json::from_str(candidate).context("Model reply was not valid note JSON")
    }
}

#[async_trait]
impl Annotator for OllamaAnnotator {
    async fn annotate(&self, transcript_text: &str) -> Result<Annotation> {
        let prompt = Self::prompt(transcript_text);
        let mut last_err = None;

        for attempt in 0..MAX_ATTEMPTS {
            let read_timeout = self.config.read_timeout * 2u32.pow(attempt);
            tracing::debug!(
                attempt = attempt + 1,
                timeout_secs = read_timeout.as_secs(),
                "Calling Ollama"
            );

            match self.call_once(&prompt, read_timeout).await {
                Ok(reply) => {
                    let payload = Self::extract_payload(&reply)?;
                    return Ok(Annotation {
                        title: payload.title,
                        tags: payload.tags,
                        body: payload.body,
                    });
                }
                Err(e) => {
                    tracing::warn!(attempt = attempt + 1, error = %e, "Ollama call failed");
                    last_err = Some(e);
                    if attempt + 1 < MAX_ATTEMPTS {
                        tokio::time::sleep(BASE_DELAY * 2u32.pow(attempt)).await;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Ollama annotation failed")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_payload_plain_json() {
        let reply = r#"{"title": "Groceries", "tags": ["errand"], "body": "Buy milk."}"#;
        let payload = OllamaAnnotator::extract_payload(reply).unwrap();
        assert_eq!(payload.title, "Groceries");
        assert_eq!(payload.tags, vec!["errand"]);
    }

    #[test]
    fn test_extract_payload_with_surrounding_prose() {
        let reply = "Sure! Here is the note:\n```json\n{\"title\": \"T\", \"body\": \"B\"}\n```";
        let payload = OllamaAnnotator::extract_payload(reply).unwrap();
        assert_eq!(payload.title, "T");
        assert!(payload.tags.is_empty());
    }

    #[test]
    fn test_extract_payload_rejects_non_json() {
        assert!(OllamaAnnotator::extract_payload("no json here").is_err());
    }
}
