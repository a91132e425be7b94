use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::jobs::JobId;
use crate::providers::ProviderKind;

#[derive(Parser)]
#[command(
    name = "transcriptor",
    about = "Media Transcriptor - Turn video and audio files into cleaned-up transcripts",
    version,
    long_about = "Runs media files through an asynchronous transcription pipeline: ffmpeg extracts the audio, long recordings are split into chunks, and a speech-to-text provider (Google Gemini or OpenAI Whisper) produces the transcript."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Disable progress indicators
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Transcribe a local audio or video file
    Transcribe {
        /// Media file to transcribe
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Speech-to-text provider (defaults to the configured one)
        #[arg(short, long, value_enum, env = "TRANSCRIPTOR_PROVIDER")]
        provider: Option<ProviderKind>,

        /// Use this job ID instead of a generated one
        #[arg(long, value_name = "ID", value_parser = parse_job_id)]
        job_id: Option<JobId>,

        /// Output file path (prints to console if not specified)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show a job stored in the configured state directory
    Status {
        /// Job ID to look up
        #[arg(value_name = "ID", value_parser = parse_job_id)]
        job_id: JobId,
    },

    /// Show or initialise the configuration file
    Config {
        /// Show current configuration
        #[arg(short, long)]
        show: bool,
    },

    /// List supported transcription providers
    Providers,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// Transcript text only
    Text,
    /// Full job record as JSON
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

fn parse_job_id(value: &str) -> Result<JobId, String> {
    value.parse()
}
