use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tokio::process::Command;

use super::{AudioArtifact, AudioFormat, ExtractionError, MediaExtractor};
use crate::config::FfmpegConfig;

/// ffmpeg/ffprobe backed extractor producing MP3 audio
pub struct FfmpegExtractor {
    config: FfmpegConfig,
}

impl FfmpegExtractor {
    pub fn new(config: FfmpegConfig) -> Self {
        Self { config }
    }

    /// Check if the file exists and is non-empty
    async fn validate_file(&self, path: &Path) -> Result<(), ExtractionError> {
        let metadata = match fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ExtractionError::SourceMissing(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };

        if !metadata.is_file() {
            return Err(ExtractionError::SourceMissing(path.to_path_buf()));
        }

        if metadata.len() == 0 {
            return Err(ExtractionError::EmptySource(path.to_path_buf()));
        }

        Ok(())
    }

    /// Run a tool and turn a non-zero exit into an error carrying stderr
    async fn run(&self, program: &str, args: &[&str]) -> Result<Vec<u8>, ExtractionError> {
        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExtractionError::ToolFailed {
                tool: program.to_string(),
                stderr: last_lines(&stderr, 5),
            });
        }

        Ok(output.stdout)
    }

    /// Confirm the source has at least one audio stream
    async fn ensure_audio_stream(&self, path: &Path) -> Result<(), ExtractionError> {
        let stdout = self
            .run(
                &self.config.ffprobe_bin,
                &[
                    "-v", "quiet",
                    "-print_format", "json",
                    "-show_streams",
                    &path.to_string_lossy(),
                ],
            )
            .await?;

        let info: serde_json::Value = serde_json::from_slice(&stdout)
            .map_err(|e| ExtractionError::InvalidProbe(e.to_string()))?;

        let has_audio = info["streams"]
            .as_array()
            .map(|streams| {
                streams
                    .iter()
                    .any(|stream| stream["codec_type"].as_str() == Some("audio"))
            })
            .unwrap_or(false);

        if !has_audio {
            return Err(ExtractionError::NoAudioStream(path.to_path_buf()));
        }

        Ok(())
    }
}

#[async_trait]
impl MediaExtractor for FfmpegExtractor {
    async fn extract_audio(&self, source: &Path, target: &Path) -> Result<AudioArtifact, ExtractionError> {
        self.validate_file(source).await?;
        self.ensure_audio_stream(source).await?;

        tracing::debug!(source = %source.display(), target = %target.display(), "Converting media to MP3");

        let sample_rate = self.config.sample_rate.to_string();
        let channels = self.config.channels.to_string();
        self.run(
            &self.config.ffmpeg_bin,
            &[
                "-i", &source.to_string_lossy(),
                "-vn", // No video
                "-acodec", "libmp3lame",
                "-ar", &sample_rate,
                "-ac", &channels,
                "-b:a", &self.config.bitrate,
                "-y", // Overwrite output file
                &target.to_string_lossy(),
            ],
        )
        .await?;

        let size_bytes = fs::metadata(target).await?.len();

        Ok(AudioArtifact {
            path: target.to_path_buf(),
            format: AudioFormat::Mp3,
            size_bytes,
        })
    }

    async fn probe_duration(&self, audio: &Path) -> Result<Duration, ExtractionError> {
        let stdout = self
            .run(
                &self.config.ffprobe_bin,
                &[
                    "-v", "error",
                    "-show_entries", "format=duration",
                    "-of", "default=noprint_wrappers=1:nokey=1",
                    &audio.to_string_lossy(),
                ],
            )
            .await?;

        parse_duration(&String::from_utf8_lossy(&stdout))
    }

    async fn cut_segment(
        &self,
        audio: &Path,
        start: Duration,
        length: Duration,
        target: &Path,
    ) -> Result<(), ExtractionError> {
        let start = format!("{:.3}", start.as_secs_f64());
        let length = format!("{:.3}", length.as_secs_f64());

        self.run(
            &self.config.ffmpeg_bin,
            &[
                "-ss", &start,
                "-t", &length,
                "-i", &audio.to_string_lossy(),
                "-acodec", "copy",
                "-y",
                &target.to_string_lossy(),
            ],
        )
        .await?;

        Ok(())
    }
}

/// Parse ffprobe's bare `format=duration` output
fn parse_duration(raw: &str) -> Result<Duration, ExtractionError> {
    let seconds: f64 = raw
        .trim()
        .parse()
        .map_err(|_| ExtractionError::InvalidProbe(format!("not a number: {:?}", raw.trim())))?;

    if !seconds.is_finite() || seconds < 0.0 {
        return Err(ExtractionError::InvalidProbe(format!("bad duration {}", seconds)));
    }

    Ok(Duration::from_secs_f64(seconds))
}

fn last_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.trim().lines().collect();
    lines[lines.len().saturating_sub(count)..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn extractor() -> FfmpegExtractor {
        FfmpegExtractor::new(crate::Config::default().ffmpeg)
    }

    fn ffmpeg_available() -> bool {
        std::process::Command::new("ffmpeg")
            .arg("-version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("300.000000\n").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1.5").unwrap(), Duration::from_millis(1500));
        assert!(parse_duration("N/A").is_err());
        assert!(parse_duration("").is_err());
        assert!(parse_duration("-4").is_err());
    }

    #[test]
    fn test_last_lines_keeps_tail() {
        assert_eq!(last_lines("a\nb\nc\n", 2), "b\nc");
        assert_eq!(last_lines("only", 5), "only");
    }

    #[tokio::test]
    async fn test_missing_source_is_rejected_before_running_tools() {
        let dir = TempDir::new().unwrap();
        let err = extractor()
            .extract_audio(&dir.path().join("nope.mp4"), &dir.path().join("out.mp3"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::SourceMissing(_)));
    }

    #[tokio::test]
    async fn test_empty_source_is_rejected() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("empty.mp4");
        fs_err::write(&source, b"").unwrap();

        let err = extractor()
            .extract_audio(&source, &dir.path().join("out.mp3"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::EmptySource(_)));
    }

    #[tokio::test]
    async fn test_extract_and_cut_generated_tone() {
        if !ffmpeg_available() {
            return;
        }

        let dir = TempDir::new().unwrap();
        let source = dir.path().join("tone.wav");
        let status = std::process::Command::new("ffmpeg")
            .args(["-f", "lavfi", "-i", "sine=frequency=440:duration=3", "-y"])
            .arg(&source)
            .output()
            .unwrap()
            .status;
        assert!(status.success());

        let extractor = extractor();
        let audio = dir.path().join("tone_audio.mp3");
        let artifact = extractor.extract_audio(&source, &audio).await.unwrap();
        assert_eq!(artifact.format, AudioFormat::Mp3);
        assert!(artifact.size_bytes > 0);

        let duration = extractor.probe_duration(&audio).await.unwrap();
        assert!(duration.as_secs_f64() > 2.5 && duration.as_secs_f64() < 3.5);

        let chunk = dir.path().join("tone_chunk_0.mp3");
        extractor
            .cut_segment(&audio, Duration::ZERO, Duration::from_secs(1), &chunk)
            .await
            .unwrap();
        assert!(chunk.exists());
    }
}
