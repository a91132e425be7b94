//! Job execution: the runner driving a single job and the pool of workers
//! feeding it from the queue.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::Instrument;

use crate::chunking::{Chunk, ChunkPlanner};
use crate::credentials::CredentialStore;
use crate::extractors::{AudioArtifact, ExtractionError, MediaExtractor};
use crate::jobs::{JobDescriptor, JobId, JobStateMachine, JobStatus};
use crate::providers::{
    Credential, ProgressReporter, ProviderError, ProviderLimits, ProviderRegistry,
    TranscriptionProvider,
};
use crate::PipelineError;

pub mod pool;
pub mod scratch;

pub use pool::WorkerPool;
pub use scratch::{ArtifactTracker, ScratchDir};

const TRANSCRIPTION_BAND: (u8, u8) = (40, 90);

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed(String),
    /// Another delivery already finished the job
    AlreadyFinished,
}

/// How the extracted audio is dispatched to the provider
enum Dispatch {
    Whole,
    Split(Vec<Chunk>),
}

/// Drives one job from its source file to a terminal state
pub struct JobRunner {
    machine: Arc<JobStateMachine>,
    credentials: Arc<dyn CredentialStore>,
    extractor: Arc<dyn MediaExtractor>,
    providers: ProviderRegistry,
    planner: ChunkPlanner,
    scratch: ScratchDir,
    soft_time_limit: Duration,
}

impl JobRunner {
    pub fn new(
        machine: Arc<JobStateMachine>,
        credentials: Arc<dyn CredentialStore>,
        extractor: Arc<dyn MediaExtractor>,
        providers: ProviderRegistry,
        scratch: ScratchDir,
        soft_time_limit: Duration,
    ) -> Self {
        Self {
            machine,
            credentials,
            extractor,
            providers,
            planner: ChunkPlanner::new(),
            scratch,
            soft_time_limit,
        }
    }

    pub fn machine(&self) -> &Arc<JobStateMachine> {
        &self.machine
    }

    /// Run the whole pipeline for `descriptor`.
    ///
    /// Files are removed before the terminal state is written. The only error
    /// returned is [`PipelineError::Persistence`], when that terminal state
    /// could not be stored.
    pub async fn run(&self, descriptor: &JobDescriptor) -> Result<RunOutcome, PipelineError> {
        let span = tracing::info_span!(
            "run_job",
            job_id = %descriptor.job_id,
            provider = %descriptor.provider
        );

        async {
            let mut artifacts = self.scratch.tracker(&descriptor.job_id);
            artifacts.track(&descriptor.source_path);

            let result = self.execute(descriptor, &mut artifacts).await;
            artifacts.cleanup();
            drop(artifacts);

            let id = &descriptor.job_id;
            match result {
                Ok(text) => {
                    if self.machine.finish_success(id, &text).await? {
                        Ok(RunOutcome::Completed)
                    } else {
                        Ok(RunOutcome::AlreadyFinished)
                    }
                }
                Err(e) => {
                    let reason = e.to_string();
                    tracing::error!(error = %reason, "Job failed");
                    if self.machine.finish_failure(id, &reason).await? {
                        Ok(RunOutcome::Failed(reason))
                    } else {
                        Ok(RunOutcome::AlreadyFinished)
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Fail a job without running it, removing whatever it left on disk
    pub async fn abandon(
        &self,
        descriptor: &JobDescriptor,
        error: &PipelineError,
    ) -> Result<bool, PipelineError> {
        let mut artifacts = self.scratch.tracker(&descriptor.job_id);
        artifacts.track(&descriptor.source_path);
        artifacts.cleanup();
        Ok(self.machine.finish_failure(&descriptor.job_id, &error.to_string()).await?)
    }

    async fn execute(
        &self,
        descriptor: &JobDescriptor,
        artifacts: &mut ArtifactTracker,
    ) -> Result<String, PipelineError> {
        let id = &descriptor.job_id;
        let deadline = SoftDeadline::start(self.soft_time_limit);

        self.progress(id, 10, "Starting transcription...").await;

        let provider = self
            .providers
            .get(descriptor.provider)
            .ok_or_else(|| ProviderError::UnknownProvider(descriptor.provider.to_string()))?;

        let credential = self
            .credentials
            .get_credential(&descriptor.credential_ref, descriptor.provider)
            .await
            .map_err(|e| PipelineError::Credential(e.to_string()))?
            .ok_or_else(|| {
                PipelineError::Credential(format!("no {} API key available", descriptor.provider))
            })?;

        deadline.check("audio extraction")?;
        self.progress(id, 20, "Extracting audio from video...").await;

        self.scratch.prepare(id).map_err(ExtractionError::Io)?;
        let audio_name = format!("audio.{}", self.extractor.output_format().as_str());
        let audio_path = self.scratch.artifact_path(id, &audio_name);
        artifacts.track(&audio_path);
        let audio = self.extractor.extract_audio(&descriptor.source_path, &audio_path).await?;

        let size_mb = audio.size_bytes as f64 / (1024.0 * 1024.0);
        tracing::info!(size_bytes = audio.size_bytes, "Audio extracted");
        self.progress(
            id,
            30,
            &format!("Audio extracted ({:.1}MB). Starting transcription...", size_mb),
        )
        .await;

        deadline.check("chunk planning")?;
        let dispatch = self.plan(&audio, provider.limits()).await?;

        let transcripts = match dispatch {
            Dispatch::Whole => {
                deadline.check("transcription")?;
                let band = Band::for_chunk(0, 1);
                self.progress(id, band.low, &format!("Transcribing with {}...", provider.kind()))
                    .await;
                let reporter = BandReporter::new(&self.machine, id, band);
                vec![provider.transcribe(&audio.path, &credential, Some(&reporter)).await?]
            }
            Dispatch::Split(chunks) => {
                self.transcribe_chunks(
                    id,
                    provider.as_ref(),
                    &credential,
                    &audio,
                    &chunks,
                    &deadline,
                    artifacts,
                )
                .await?
            }
        };

        deadline.check("cleanup pass")?;
        self.progress(id, TRANSCRIPTION_BAND.1, "Transcription received").await;
        let text = provider.refine(join_transcripts(&transcripts), &credential).await;

        deadline.check("saving")?;
        self.progress(id, 95, "Saving transcription...").await;

        Ok(text)
    }

    async fn plan(
        &self,
        audio: &AudioArtifact,
        limits: ProviderLimits,
    ) -> Result<Dispatch, PipelineError> {
        let Some(max) = limits.max_chunk_duration else {
            return Ok(Dispatch::Whole);
        };

        let total = self
            .extractor
            .probe_duration(&audio.path)
            .await
            .map_err(|e| PipelineError::Chunking(e.to_string()))?;

        if !self.planner.needs_split(total, Some(max)) {
            tracing::debug!(duration_secs = total.as_secs_f64(), "Audio fits in one request");
            return Ok(Dispatch::Whole);
        }

        let chunks = self.planner.plan(total, max)?;
        tracing::info!(
            duration_secs = total.as_secs_f64(),
            chunks = chunks.len(),
            "Splitting audio"
        );
        Ok(Dispatch::Split(chunks))
    }

    #[allow(clippy::too_many_arguments)]
    async fn transcribe_chunks(
        &self,
        id: &JobId,
        provider: &dyn TranscriptionProvider,
        credential: &Credential,
        audio: &AudioArtifact,
        chunks: &[Chunk],
        deadline: &SoftDeadline,
        artifacts: &mut ArtifactTracker,
    ) -> Result<Vec<String>, PipelineError> {
        let total = chunks.len();
        let mut transcripts = Vec::with_capacity(total);

        for chunk in chunks {
            deadline.check("chunk transcription")?;

            let band = Band::for_chunk(chunk.index, total);
            self.progress(
                id,
                band.low,
                &format!("Transcribing chunk {}/{}...", chunk.index + 1, total),
            )
            .await;

            let chunk_name = format!("chunk_{}.{}", chunk.index, audio.format.as_str());
            let chunk_path = self.scratch.artifact_path(id, &chunk_name);
            artifacts.track(&chunk_path);

            let result = async {
                self.extractor
                    .cut_segment(&audio.path, chunk.start, chunk.duration, &chunk_path)
                    .await
                    .map_err(|e| PipelineError::Chunking(e.to_string()))?;
                let reporter = BandReporter::new(&self.machine, id, band);
                Ok::<_, PipelineError>(provider.transcribe(&chunk_path, credential, Some(&reporter)).await?)
            }
            .await;

            artifacts.remove_now(&chunk_path);
            let text = result?;
            tracing::debug!(chunk = chunk.index, chars = text.len(), "Chunk transcribed");
            transcripts.push(text);
        }

        Ok(transcripts)
    }

    async fn progress(&self, id: &JobId, progress: u8, message: &str) {
        report_progress(&self.machine, id, progress, message).await;
    }
}

/// Join chunk transcripts in order, one space between non-empty pieces
pub fn join_transcripts(parts: &[String]) -> String {
    parts
        .iter()
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

async fn report_progress(machine: &JobStateMachine, id: &JobId, progress: u8, message: &str) {
    if let Err(e) = machine.advance(id, JobStatus::Processing, progress, message).await {
        tracing::warn!(error = %e, progress, "Failed to record progress");
    }
}

/// Slice of the transcription progress range owned by one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Band {
    low: u8,
    high: u8,
}

impl Band {
    fn for_chunk(index: usize, total: usize) -> Self {
        let (start, end) = TRANSCRIPTION_BAND;
        let span = (end - start) as usize;
        let total = total.max(1);
        Self {
            low: start + (span * index / total) as u8,
            high: start + (span * (index + 1) / total) as u8,
        }
    }

    fn scale(&self, fraction: f32) -> u8 {
        let fraction = if fraction.is_finite() { fraction.clamp(0.0, 1.0) } else { 0.0 };
        self.low + ((self.high - self.low) as f32 * fraction).round() as u8
    }
}

/// Maps a provider's fractional progress into the job's progress band
struct BandReporter<'a> {
    machine: &'a JobStateMachine,
    job_id: &'a JobId,
    band: Band,
}

impl<'a> BandReporter<'a> {
    fn new(machine: &'a JobStateMachine, job_id: &'a JobId, band: Band) -> Self {
        Self { machine, job_id, band }
    }
}

#[async_trait]
impl ProgressReporter for BandReporter<'_> {
    async fn report(&self, fraction: f32, message: &str) {
        report_progress(self.machine, self.job_id, self.band.scale(fraction), message).await;
    }
}

/// Cooperative time ceiling checked between stages
struct SoftDeadline {
    started: Instant,
    limit: Duration,
}

impl SoftDeadline {
    fn start(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    fn check(&self, stage: &str) -> Result<(), PipelineError> {
        let elapsed = self.started.elapsed();
        if elapsed >= self.limit {
            return Err(PipelineError::Timeout(format!(
                "soft time limit of {}s exceeded before {}",
                self.limit.as_secs(),
                stage
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable collaborators for runner and pool tests

    use super::*;
    use crate::extractors::{AudioFormat, ExtractionError};
    use crate::providers::ProviderKind;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeExtractor {
        pub duration: Duration,
        pub extract_delay: Duration,
        pub fail_extraction: bool,
        pub calls: Mutex<Vec<String>>,
        pub cuts: Mutex<Vec<(Duration, Duration)>>,
    }

    impl FakeExtractor {
        pub fn with_duration(duration: Duration) -> Self {
            Self {
                duration,
                ..Default::default()
            }
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MediaExtractor for FakeExtractor {
        async fn extract_audio(&self, source: &Path, target: &Path) -> Result<AudioArtifact, ExtractionError> {
            self.calls.lock().unwrap().push("extract".to_string());
            if !self.extract_delay.is_zero() {
                tokio::time::sleep(self.extract_delay).await;
            }
            if self.fail_extraction {
                return Err(ExtractionError::NoAudioStream(source.to_path_buf()));
            }
            // ffmpeg refuses to overwrite its own input
            if source == target {
                return Err(ExtractionError::ToolFailed {
                    tool: "ffmpeg".to_string(),
                    stderr: "Output same as Input".to_string(),
                });
            }
            if !source.exists() {
                return Err(ExtractionError::SourceMissing(source.to_path_buf()));
            }
            fs_err::write(target, vec![0u8; 2048])?;
            Ok(AudioArtifact {
                path: target.to_path_buf(),
                format: AudioFormat::Mp3,
                size_bytes: 2048,
            })
        }

        async fn probe_duration(&self, _audio: &Path) -> Result<Duration, ExtractionError> {
            self.calls.lock().unwrap().push("probe".to_string());
            Ok(self.duration)
        }

        async fn cut_segment(
            &self,
            _audio: &Path,
            start: Duration,
            length: Duration,
            target: &Path,
        ) -> Result<(), ExtractionError> {
            self.cuts.lock().unwrap().push((start, length));
            fs_err::write(target, b"chunk")?;
            Ok(())
        }
    }

    /// Provider answering each call from a script; `Err` entries fail that call
    pub struct FakeProvider {
        pub kind: ProviderKind,
        pub limit: Option<Duration>,
        pub script: Mutex<Vec<Result<String, String>>>,
        pub seen: Mutex<Vec<PathBuf>>,
        /// Files handed over earlier that still existed at a later call
        pub lingering: Mutex<Vec<PathBuf>>,
        pub refined: Mutex<Vec<String>>,
        pub delay: Duration,
    }

    impl FakeProvider {
        pub fn new(kind: ProviderKind, limit: Option<Duration>, script: Vec<Result<&str, &str>>) -> Self {
            Self {
                kind,
                limit,
                script: Mutex::new(
                    script
                        .into_iter()
                        .rev()
                        .map(|r| r.map(str::to_string).map_err(str::to_string))
                        .collect(),
                ),
                seen: Mutex::new(Vec::new()),
                lingering: Mutex::new(Vec::new()),
                refined: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl TranscriptionProvider for FakeProvider {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        fn limits(&self) -> ProviderLimits {
            ProviderLimits {
                max_chunk_duration: self.limit,
            }
        }

        async fn transcribe(
            &self,
            audio_path: &Path,
            _credential: &Credential,
            progress: Option<&dyn ProgressReporter>,
        ) -> Result<String, ProviderError> {
            assert!(audio_path.exists(), "provider received a missing file");
            {
                let mut seen = self.seen.lock().unwrap();
                let still_there = seen.iter().filter(|path| path.exists()).cloned();
                self.lingering.lock().unwrap().extend(still_there);
                seen.push(audio_path.to_path_buf());
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if let Some(progress) = progress {
                progress.report(0.5, "halfway").await;
            }
            let next = self.script.lock().unwrap().pop();
            match next {
                Some(Ok(text)) => Ok(text),
                Some(Err(message)) => Err(ProviderError::ApiRequestFailed(message)),
                None => Err(ProviderError::UnexpectedResponse("script exhausted".to_string())),
            }
        }

        async fn refine(&self, transcript: String, _credential: &Credential) -> String {
            self.refined.lock().unwrap().push(transcript.clone());
            transcript
        }
    }
}
