use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod ffmpeg;

pub use ffmpeg::FfmpegExtractor;

/// Audio produced from a job's source media
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioArtifact {
    /// Location inside the scratch directory
    pub path: PathBuf,

    /// Encoded format
    pub format: AudioFormat,

    /// Size on disk in bytes
    pub size_bytes: u64,
}

/// Supported audio formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioFormat {
    Mp3,
    M4a,
    Wav,
    Flac,
    Ogg,
    Webm,
}

impl AudioFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::M4a => "m4a",
            AudioFormat::Wav => "wav",
            AudioFormat::Flac => "flac",
            AudioFormat::Ogg => "ogg",
            AudioFormat::Webm => "webm",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "mp3" => Some(AudioFormat::Mp3),
            "m4a" | "aac" => Some(AudioFormat::M4a),
            "wav" => Some(AudioFormat::Wav),
            "flac" => Some(AudioFormat::Flac),
            "ogg" => Some(AudioFormat::Ogg),
            "webm" => Some(AudioFormat::Webm),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }

    /// Get MIME type for the format
    pub fn mime_type(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "audio/mpeg",
            AudioFormat::M4a => "audio/mp4",
            AudioFormat::Wav => "audio/wav",
            AudioFormat::Flac => "audio/flac",
            AudioFormat::Ogg => "audio/ogg",
            AudioFormat::Webm => "audio/webm",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("source file does not exist: {0}")]
    SourceMissing(PathBuf),
    #[error("source file is empty: {0}")]
    EmptySource(PathBuf),
    #[error("no audio stream in {0}")]
    NoAudioStream(PathBuf),
    #[error("{tool} failed: {stderr}")]
    ToolFailed { tool: String, stderr: String },
    #[error("could not read media duration: {0}")]
    InvalidProbe(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Media conversion capability used by the job runner.
///
/// Converts source media to audio, reports audio durations and cuts
/// time-range chunks out of an audio file.
#[async_trait]
pub trait MediaExtractor: Send + Sync {
    /// Convert `source` into an audio file written at `target`
    async fn extract_audio(&self, source: &Path, target: &Path) -> Result<AudioArtifact, ExtractionError>;

    /// Total playing time of an audio file
    async fn probe_duration(&self, audio: &Path) -> Result<Duration, ExtractionError>;

    /// Copy `[start, start + length)` of `audio` into `target`
    async fn cut_segment(
        &self,
        audio: &Path,
        start: Duration,
        length: Duration,
        target: &Path,
    ) -> Result<(), ExtractionError>;

    /// Format of every artifact this extractor produces
    fn output_format(&self) -> AudioFormat {
        AudioFormat::Mp3
    }
}
