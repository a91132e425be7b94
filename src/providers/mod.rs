use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ProvidersConfig;

pub mod gemini;
pub mod whisper;

#[cfg(test)]
pub(crate) mod test_server;

pub use gemini::GeminiProvider;
pub use whisper::WhisperProvider;

/// The closed set of speech-to-text providers a job can be dispatched to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Google Gemini: one multimodal call that transcribes and diarizes
    Gemini,
    /// OpenAI Whisper followed by a chat-model cleanup pass
    #[serde(alias = "openai")]
    #[value(alias = "openai")]
    Whisper,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Gemini => "gemini",
            ProviderKind::Whisper => "whisper",
        }
    }

    pub fn all() -> [ProviderKind; 2] {
        [ProviderKind::Gemini, ProviderKind::Whisper]
    }

    /// Environment variable conventionally holding this provider's API key
    pub fn api_key_env(&self) -> &'static str {
        match self {
            ProviderKind::Gemini => "GEMINI_API_KEY",
            ProviderKind::Whisper => "OPENAI_API_KEY",
        }
    }
}

impl FromStr for ProviderKind {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gemini" => Ok(ProviderKind::Gemini),
            "whisper" | "openai" => Ok(ProviderKind::Whisper),
            other => Err(ProviderError::UnknownProvider(other.to_string())),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A decrypted provider secret.
///
/// Deliberately not `Serialize`, and `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Raw secret, for building request headers only
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Per-call limits a provider imposes on its input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProviderLimits {
    /// Longest audio accepted in one call; `None` means unlimited
    pub max_chunk_duration: Option<Duration>,
}

/// Receives fractional progress (0.0..=1.0) from a running provider call
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn report(&self, fraction: f32, message: &str);
}

/// Speech-to-text capability. Implementations are selected once per job.
#[async_trait]
pub trait TranscriptionProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn limits(&self) -> ProviderLimits;

    /// Transcribe one audio file (a whole artifact or a single chunk)
    async fn transcribe(
        &self,
        audio_path: &Path,
        credential: &Credential,
        progress: Option<&dyn ProgressReporter>,
    ) -> Result<String, ProviderError>;

    /// Post-process the complete transcript. Must not fail: implementations
    /// return the input unchanged when their own pass goes wrong.
    async fn refine(&self, transcript: String, _credential: &Credential) -> String {
        transcript
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    #[error("api request failed: {0}")]
    ApiRequestFailed(String),
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("reading audio failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Build the provider implementation for `kind`
pub fn build_provider(kind: ProviderKind, config: &ProvidersConfig) -> Arc<dyn TranscriptionProvider> {
    match kind {
        ProviderKind::Gemini => Arc::new(GeminiProvider::new(config.gemini.clone())),
        ProviderKind::Whisper => Arc::new(WhisperProvider::new(config.whisper.clone())),
    }
}

/// Registry holding one provider instance per kind
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn TranscriptionProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in provider configured from `config`
    pub fn from_config(config: &ProvidersConfig) -> Self {
        let mut registry = Self::new();
        for kind in ProviderKind::all() {
            registry.register(build_provider(kind, config));
        }
        registry
    }

    /// Register a provider, replacing any previous one of the same kind
    pub fn register(&mut self, provider: Arc<dyn TranscriptionProvider>) {
        self.providers.retain(|existing| existing.kind() != provider.kind());
        self.providers.push(provider);
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn TranscriptionProvider>> {
        self.providers
            .iter()
            .find(|provider| provider.kind() == kind)
            .cloned()
    }

    pub fn kinds(&self) -> Vec<ProviderKind> {
        self.providers.iter().map(|provider| provider.kind()).collect()
    }
}

/// Request body reading `path` from disk as it is sent
pub(crate) async fn stream_file(path: &Path) -> Result<reqwest::Body, ProviderError> {
    let file = tokio::fs::File::open(path).await?;
    Ok(reqwest::Body::wrap_stream(tokio_util::io::ReaderStream::new(file)))
}

/// Read an error body for inclusion in an error message
pub(crate) async fn describe_failure(response: reqwest::Response) -> String {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown error".to_string());
    format!("status {}: {}", status, body.trim())
}
