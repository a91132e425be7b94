//! Media Transcriptor - an asynchronous transcription job pipeline
//!
//! This library accepts uploaded media files, converts them to audio with ffmpeg,
//! dispatches the audio (split into chunks when needed) to a pluggable speech-to-text
//! provider and tracks every job through a persisted, event-emitting state machine.

pub mod chunking;
pub mod cli;
pub mod config;
pub mod credentials;
pub mod extractors;
pub mod jobs;
pub mod output;
pub mod providers;
pub mod queue;
pub mod service;
pub mod utils;
pub mod worker;

pub use chunking::{Chunk, ChunkPlanner};
pub use cli::{Cli, Commands, OutputFormat};
pub use config::Config;
pub use extractors::{AudioArtifact, MediaExtractor};
pub use jobs::{Job, JobDescriptor, JobId, JobStateMachine, JobStatus, JobView};
pub use providers::{Credential, ProviderKind, ProviderRegistry, TranscriptionProvider};
pub use queue::{InMemoryJobQueue, JobQueue, Lease};
pub use service::{Submission, SubmitError, TranscriptionService};
pub use worker::{JobRunner, WorkerPool};

/// Result type used at the binary edge
pub type Result<T> = anyhow::Result<T>;

/// Failures that terminate a job inside the pipeline.
///
/// Every variant ends up as the `failed` job's error text; none of them is ever
/// surfaced to whoever submitted the job.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Audio extraction failed: {0}")]
    Extraction(#[from] extractors::ExtractionError),

    #[error("Chunking failed: {0}")]
    Chunking(String),

    #[error("Transcription failed: {0}")]
    Provider(#[from] providers::ProviderError),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Gave up after {0} deliveries")]
    DeliveryLimit(u32),

    #[error("Persistence error: {0}")]
    Persistence(#[from] jobs::StoreError),
}
