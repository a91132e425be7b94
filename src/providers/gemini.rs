use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::time::sleep;

use super::{
    describe_failure, stream_file, Credential, ProgressReporter, ProviderError, ProviderKind,
    ProviderLimits, TranscriptionProvider,
};
use crate::config::GeminiConfig;
use crate::extractors::AudioFormat;

const TRANSCRIBE_PROMPT: &str = r#"Please transcribe this audio file with the following requirements:

1. SPEAKER IDENTIFICATION: If multiple speakers are present, identify them as "Speaker 1:", "Speaker 2:", etc. at the start of each speaking turn.

2. FORMATTING:
   - Each new speaker's dialogue should start on a new line
   - Use proper punctuation and capitalization
   - Format as natural conversation flow
   - Add paragraph breaks for topic changes

3. CONTENT CLEANING:
   - Remove filler words (um, uh, like, you know, etc.) unless they're essential to meaning
   - Remove repeated words or false starts
   - Remove profanity and slurs while maintaining the message
   - Clean up stuttering and verbal tics
   - Keep the actual conversation content intact - don't summarize or change meaning

4. OUTPUT FORMAT:
   If single speaker: Just provide the clean transcript
   If multiple speakers: Format as:
   Speaker 1: [their dialogue]
   Speaker 2: [their dialogue]
   Speaker 1: [continues...]

Provide only the transcription, no additional commentary."#;

const API_KEY_HEADER: &str = "x-goog-api-key";
const MAX_STATE_CHECKS: u32 = 30;

#[derive(Debug, Deserialize)]
struct UploadResponse {
    file: RemoteFile,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteFile {
    name: String,
    uri: String,
    #[serde(default)]
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

/// Gemini multimodal transcription through the Files API
pub struct GeminiProvider {
    client: reqwest::Client,
    config: GeminiConfig,
    state_poll_interval: Duration,
}

impl GeminiProvider {
    pub fn new(config: GeminiConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            state_poll_interval: Duration::from_secs(2),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Upload the audio with the resumable protocol (start + upload/finalize)
    async fn upload(&self, audio_path: &Path, credential: &Credential) -> Result<RemoteFile, ProviderError> {
        let size = tokio::fs::metadata(audio_path).await?.len();
        let format = AudioFormat::from_path(audio_path).unwrap_or(AudioFormat::Mp3);
        let display_name = audio_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "audio".to_string());

        let start = self
            .client
            .post(self.endpoint("upload/v1beta/files"))
            .header(API_KEY_HEADER, credential.expose())
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", size.to_string())
            .header("X-Goog-Upload-Header-Content-Type", format.mime_type())
            .json(&serde_json::json!({ "file": { "display_name": display_name } }))
            .send()
            .await
            .map_err(|e| ProviderError::ApiRequestFailed(format!("upload start: {}", e)))?;

        if !start.status().is_success() {
            return Err(ProviderError::ApiRequestFailed(describe_failure(start).await));
        }

        let upload_url = start
            .headers()
            .get("x-goog-upload-url")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ProviderError::UnexpectedResponse("missing upload url".to_string()))?;

        let uploaded = self
            .client
            .post(upload_url)
            .header(API_KEY_HEADER, credential.expose())
            .header("X-Goog-Upload-Offset", "0")
            .header("X-Goog-Upload-Command", "upload, finalize")
            .header(reqwest::header::CONTENT_LENGTH, size)
            .body(stream_file(audio_path).await?)
            .send()
            .await
            .map_err(|e| ProviderError::ApiRequestFailed(format!("upload: {}", e)))?;

        if !uploaded.status().is_success() {
            return Err(ProviderError::ApiRequestFailed(describe_failure(uploaded).await));
        }

        let body: UploadResponse = uploaded
            .json()
            .await
            .map_err(|e| ProviderError::UnexpectedResponse(format!("upload body: {}", e)))?;

        Ok(body.file)
    }

    /// Uploaded media is processed asynchronously; wait until it is usable
    async fn wait_until_active(&self, file: RemoteFile, credential: &Credential) -> Result<RemoteFile, ProviderError> {
        let mut current = file;
        let mut checks = 0;

        while current.state.as_deref() == Some("PROCESSING") {
            checks += 1;
            if checks > MAX_STATE_CHECKS {
                return Err(ProviderError::UnexpectedResponse(format!(
                    "file {} still processing after {} checks",
                    current.name, MAX_STATE_CHECKS
                )));
            }
            sleep(self.state_poll_interval).await;

            let response = self
                .client
                .get(self.endpoint(&format!("v1beta/{}", current.name)))
                .header(API_KEY_HEADER, credential.expose())
                .send()
                .await
                .map_err(|e| ProviderError::ApiRequestFailed(format!("file state: {}", e)))?;

            if !response.status().is_success() {
                return Err(ProviderError::ApiRequestFailed(describe_failure(response).await));
            }

            current = response
                .json()
                .await
                .map_err(|e| ProviderError::UnexpectedResponse(format!("file state body: {}", e)))?;
        }

        if current.state.as_deref() == Some("FAILED") {
            return Err(ProviderError::ApiRequestFailed(format!(
                "file {} failed server-side processing",
                current.name
            )));
        }

        Ok(current)
    }

    async fn generate(&self, file: &RemoteFile, mime_type: &str, credential: &Credential) -> Result<String, ProviderError> {
        let body = serde_json::json!({
            "contents": [{
                "parts": [
                    { "text": TRANSCRIBE_PROMPT },
                    { "file_data": { "mime_type": mime_type, "file_uri": file.uri } }
                ]
            }]
        });

        let response = self
            .client
            .post(self.endpoint(&format!("v1beta/models/{}:generateContent", self.config.model)))
            .header(API_KEY_HEADER, credential.expose())
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::ApiRequestFailed(format!("generate: {}", e)))?;

        if !response.status().is_success() {
            return Err(ProviderError::ApiRequestFailed(describe_failure(response).await));
        }

        let generated: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::UnexpectedResponse(format!("generate body: {}", e)))?;

        let text: String = generated
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|part| part.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(ProviderError::UnexpectedResponse("empty transcription".to_string()));
        }

        Ok(text.trim().to_string())
    }

    async fn delete_remote(&self, file: &RemoteFile, credential: &Credential) {
        let result = self
            .client
            .delete(self.endpoint(&format!("v1beta/{}", file.name)))
            .header(API_KEY_HEADER, credential.expose())
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(file = %file.name, "Deleted uploaded file");
            }
            Ok(response) => {
                tracing::warn!(file = %file.name, status = %response.status(), "Failed to delete uploaded file");
            }
            Err(e) => {
                tracing::warn!(file = %file.name, error = %e, "Failed to delete uploaded file");
            }
        }
    }
}

#[async_trait]
impl TranscriptionProvider for GeminiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
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
        if let Some(progress) = progress {
            progress.report(0.0, "Uploading to Gemini API...").await;
        }

        let uploaded = self.upload(audio_path, credential).await?;
        tracing::debug!(file = %uploaded.name, "Audio uploaded to Gemini");

        if let Some(progress) = progress {
            progress.report(0.4, "Gemini is transcribing...").await;
        }

        let mime_type = AudioFormat::from_path(audio_path)
            .unwrap_or(AudioFormat::Mp3)
            .mime_type();

        // The remote copy is removed whether or not generation succeeds
        let result = match self.wait_until_active(uploaded.clone(), credential).await {
            Ok(active) => self.generate(&active, mime_type, credential).await,
            Err(e) => Err(e),
        };
        self.delete_remote(&uploaded, credential).await;

        let text = result?;

        if let Some(progress) = progress {
            progress.report(1.0, "Gemini transcription received").await;
        }

        tracing::info!(chars = text.len(), "Gemini transcription completed");
        Ok(text)
    }
}
