use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::providers::ProviderKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Worker and filesystem settings
    pub app: AppConfig,

    /// Audio conversion settings
    pub ffmpeg: FfmpegConfig,

    /// Speech-to-text provider endpoints
    pub providers: ProvidersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Scratch directory for uploads, audio artifacts and chunks
    pub scratch_dir: Option<PathBuf>,

    /// Directory holding persisted job records (in-memory store when unset)
    pub state_dir: Option<PathBuf>,

    /// Number of concurrent job runners
    pub workers: usize,

    /// Soft execution ceiling per job, in seconds
    pub soft_time_limit_secs: u64,

    /// Hard execution ceiling per job, in seconds
    pub hard_time_limit_secs: u64,

    /// Lease (visibility) timeout for a delivered job, in seconds
    pub lease_timeout_secs: u64,

    /// Deliveries allowed before a job is failed outright
    pub max_deliveries: u32,

    /// Default provider when none is given
    pub default_provider: ProviderKind,

    /// Emit logs as JSON
    pub json_logs: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FfmpegConfig {
    /// ffmpeg binary
    pub ffmpeg_bin: String,

    /// ffprobe binary
    pub ffprobe_bin: String,

    /// Audio bitrate passed to the encoder
    pub bitrate: String,

    /// Output sample rate in Hz
    pub sample_rate: u32,

    /// Output channel count
    pub channels: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    pub gemini: GeminiConfig,
    pub whisper: WhisperConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiConfig {
    /// API root, e.g. https://generativelanguage.googleapis.com
    pub base_url: String,

    /// Generation model
    pub model: String,

    /// Longest audio sent in one call; unlimited when unset
    pub max_chunk_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhisperConfig {
    /// API root, e.g. https://api.openai.com/v1
    pub base_url: String,

    /// Transcription model
    pub model: String,

    /// Chat model used for the transcript cleanup pass
    pub cleanup_model: String,

    /// Longest audio sent in one call; unlimited when unset
    pub max_chunk_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app: AppConfig {
                scratch_dir: None,
                state_dir: None,
                workers: 2,
                soft_time_limit_secs: 3300,
                hard_time_limit_secs: 3600,
                lease_timeout_secs: 3900,
                max_deliveries: 3,
                default_provider: ProviderKind::Gemini,
                json_logs: false,
            },
            ffmpeg: FfmpegConfig {
                ffmpeg_bin: "ffmpeg".to_string(),
                ffprobe_bin: "ffprobe".to_string(),
                bitrate: "192k".to_string(),
                sample_rate: 44100,
                channels: 2,
            },
            providers: ProvidersConfig {
                gemini: GeminiConfig {
                    base_url: "https://generativelanguage.googleapis.com".to_string(),
                    model: "gemini-1.5-flash".to_string(),
                    max_chunk_secs: None,
                },
                whisper: WhisperConfig {
                    base_url: "https://api.openai.com/v1".to_string(),
                    model: "whisper-1".to_string(),
                    cleanup_model: "gpt-4o-mini".to_string(),
                    max_chunk_secs: Some(600),
                },
            },
        }
    }
}

impl Config {
    /// Load configuration from file or create default
    pub async fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            let content = fs_err::read_to_string(&config_path)
                .context("Failed to read config file")?;

            let config: Config = serde_yaml::from_str(&content)
                .context("Failed to parse config file")?;

            config.validate()?;
            Ok(config)
        } else {
            let config = Self::default();
            config.save().await?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub async fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            fs_err::create_dir_all(parent)?;
        }

        let content = serde_yaml::to_string(self)
            .context("Failed to serialize config")?;

        fs_err::write(&config_path, content)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Get configuration file path
    pub fn config_path() -> Result<PathBuf> {
        // First try current directory for easy testing
        let local_config = PathBuf::from("config.yaml");
        if local_config.exists() {
            return Ok(local_config);
        }

        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?;

        Ok(config_dir.join("media-transcriptor").join("config.yaml"))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.app.workers == 0 {
            anyhow::bail!("At least one worker must be configured");
        }

        if self.app.soft_time_limit_secs >= self.app.hard_time_limit_secs {
            anyhow::bail!("Soft time limit must be shorter than the hard time limit");
        }

        // A lease must outlive the job it guards, or a live job could be redelivered
        if self.app.lease_timeout_secs <= self.app.hard_time_limit_secs {
            anyhow::bail!("Lease timeout must be longer than the hard time limit");
        }

        if self.app.max_deliveries == 0 {
            anyhow::bail!("max_deliveries must be at least 1");
        }

        for (name, base_url) in [
            ("gemini", &self.providers.gemini.base_url),
            ("whisper", &self.providers.whisper.base_url),
        ] {
            Url::parse(base_url)
                .with_context(|| format!("Invalid base_url for provider {}", name))?;
        }

        if matches!(self.providers.gemini.max_chunk_secs, Some(0))
            || matches!(self.providers.whisper.max_chunk_secs, Some(0))
        {
            anyhow::bail!("max_chunk_secs must be positive when set");
        }

        Ok(())
    }

    /// Display current configuration
    pub fn display(&self) {
        println!("Current Configuration:");
        println!("  Scratch Dir: {}", self.scratch_dir().display());
        match &self.app.state_dir {
            Some(dir) => println!("  State Dir: {}", dir.display()),
            None => println!("  State Dir: (in-memory)"),
        }
        println!("  Workers: {}", self.app.workers);
        println!(
            "  Time Limits: soft {}s / hard {}s (lease {}s)",
            self.app.soft_time_limit_secs, self.app.hard_time_limit_secs, self.app.lease_timeout_secs
        );
        println!("  Default Provider: {}", self.app.default_provider);
        println!("  Gemini Model: {}", self.providers.gemini.model);
        println!(
            "  Whisper Model: {} (cleanup: {})",
            self.providers.whisper.model, self.providers.whisper.cleanup_model
        );
    }

    /// Scratch directory, falling back to the system temp dir
    pub fn scratch_dir(&self) -> PathBuf {
        self.app
            .scratch_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("media-transcriptor"))
    }

    pub fn soft_time_limit(&self) -> Duration {
        Duration::from_secs(self.app.soft_time_limit_secs)
    }

    pub fn hard_time_limit(&self) -> Duration {
        Duration::from_secs(self.app.hard_time_limit_secs)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.app.lease_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_lease_must_outlive_hard_limit() {
        let mut config = Config::default();
        config.app.lease_timeout_secs = config.app.hard_time_limit_secs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_soft_limit_must_be_shorter_than_hard_limit() {
        let mut config = Config::default();
        config.app.soft_time_limit_secs = 4000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        let mut config = Config::default();
        config.providers.whisper.base_url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_roundtrip_keeps_provider() {
        let mut config = Config::default();
        config.app.default_provider = ProviderKind::Whisper;
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.app.default_provider, ProviderKind::Whisper);
        assert_eq!(parsed.providers.whisper.max_chunk_secs, Some(600));
    }
}
