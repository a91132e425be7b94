use async_trait::async_trait;
use reqwest::multipart;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use super::{
    describe_failure, Credential, ProgressReporter, ProviderError, ProviderKind, ProviderLimits,
    TranscriptionProvider,
};
use crate::config::WhisperConfig;
use crate::extractors::AudioFormat;

const CLEANUP_PROMPT: &str = r#"You are a transcript editor. Your task is to:

1. SPEAKER IDENTIFICATION: Analyze the conversation and identify different speakers. Label them as "Speaker 1:", "Speaker 2:", etc.
2. FORMATTING: Format the transcript with each speaker on a new line with natural conversation flow.
3. CONTENT CLEANING:
   - Remove filler words (um, uh, like, you know) unless essential
   - Remove repeated words and false starts
   - Replace profanity and slurs with [censored] while keeping meaning
   - Fix stuttering and verbal tics
   - Keep the actual content and meaning intact - don't summarize

OUTPUT FORMAT:
If single speaker: Clean transcript with paragraphs
If multiple speakers:
Speaker 1: [dialogue]
Speaker 2: [dialogue]

Provide ONLY the enhanced transcript, no explanations."#;

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// Whisper transcription with a chat-model cleanup pass
pub struct WhisperProvider {
    client: reqwest::Client,
    config: WhisperConfig,
}

impl WhisperProvider {
    pub fn new(config: WhisperConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Speaker labelling and filler removal through the chat completions API
    async fn cleanup(&self, transcript: &str, credential: &Credential) -> Result<String, ProviderError> {
        let body = serde_json::json!({
            "model": self.config.cleanup_model,
            "temperature": 0.3,
            "messages": [
                { "role": "system", "content": CLEANUP_PROMPT },
                {
                    "role": "user",
                    "content": format!("Please enhance this transcript:\n\n{}", transcript)
                }
            ]
        });

        let response = self
            .client
            .post(self.endpoint("chat/completions"))
            .bearer_auth(credential.expose())
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::ApiRequestFailed(format!("request: {}", e)))?;

        if !response.status().is_success() {
            return Err(ProviderError::ApiRequestFailed(describe_failure(response).await));
        }

        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|e| ProviderError::UnexpectedResponse(format!("body: {}", e)))?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| ProviderError::UnexpectedResponse("no completion content".to_string()))
    }
}

#[async_trait]
impl TranscriptionProvider for WhisperProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Whisper
    }

    fn limits(&self) -> ProviderLimits {
        ProviderLimits {
            max_chunk_duration: self.config.max_chunk_secs.map(Duration::from_secs),
        }
    }

    async fn transcribe(
        &self,
        audio_path: &Path,
        credential: &Credential,
        progress: Option<&dyn ProgressReporter>,
    ) -> Result<String, ProviderError> {
        let audio = tokio::fs::read(audio_path).await?;
        let format = AudioFormat::from_path(audio_path).unwrap_or(AudioFormat::Mp3);
        let file_name = audio_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("audio.{}", format.as_str()));

        if let Some(progress) = progress {
            progress.report(0.1, "Uploading audio to Whisper...").await;
        }

        let file_part = multipart::Part::bytes(audio)
            .file_name(file_name)
            .mime_str(format.mime_type())
            .map_err(|e| ProviderError::ApiRequestFailed(format!("mime: {}", e)))?;

        let form = multipart::Form::new()
            .text("model", self.config.model.clone())
            .text("response_format", "text")
            .part("file", file_part);

        tracing::debug!(model = %self.config.model, "Sending audio to Whisper API");

        let response = self
            .client
            .post(self.endpoint("audio/transcriptions"))
            .bearer_auth(credential.expose())
            .multipart(form)
            .send()
            .await
            .map_err(|e| ProviderError::ApiRequestFailed(format!("request: {}", e)))?;

        if !response.status().is_success() {
            return Err(ProviderError::ApiRequestFailed(describe_failure(response).await));
        }

        let transcript = response
            .text()
            .await
            .map_err(|e| ProviderError::UnexpectedResponse(format!("body: {}", e)))?;

        if let Some(progress) = progress {
            progress.report(1.0, "Whisper transcription received").await;
        }

        tracing::info!(chars = transcript.len(), "Whisper transcription completed");

        Ok(transcript.trim().to_string())
    }

    async fn refine(&self, transcript: String, credential: &Credential) -> String {
        if transcript.trim().is_empty() {
            return transcript;
        }

        match self.cleanup(&transcript, credential).await {
            Ok(cleaned) => {
                tracing::info!(
                    raw_chars = transcript.len(),
                    cleaned_chars = cleaned.len(),
                    "Transcript cleanup completed"
                );
                cleaned
            }
            Err(e) => {
                tracing::warn!(error = %e, "Transcript cleanup failed, keeping raw transcript");
                transcript
            }
        }
    }
}
