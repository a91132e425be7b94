//! Submission and status queries: the surface collaborators talk to.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::jobs::{Job, JobDescriptor, JobId, JobStateMachine, JobView, StoreError};
use crate::providers::ProviderKind;
use crate::queue::{JobQueue, QueueError};
use crate::utils::sanitize_filename;
use crate::worker::ScratchDir;

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("invalid submission: {0}")]
    Invalid(String),
    #[error("job {0} already exists")]
    DuplicateJob(JobId),
    #[error("could not stage upload: {0}")]
    Staging(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// How an uploaded file gets into the scratch directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    /// Take ownership of the upload (it is a temporary file)
    Move,
    /// Leave the caller's file in place
    Copy,
}

/// A request to transcribe one file
#[derive(Debug, Clone)]
pub struct Submission<'a> {
    pub upload_path: &'a Path,
    /// Original name of the file, as the owner knows it
    pub filename: &'a str,
    pub provider: ProviderKind,
    pub credential_ref: &'a str,
    pub job_id: Option<JobId>,
    pub ingest: Ingest,
}

pub struct TranscriptionService {
    machine: Arc<JobStateMachine>,
    queue: Arc<dyn JobQueue>,
    scratch: ScratchDir,
}

impl TranscriptionService {
    pub fn new(machine: Arc<JobStateMachine>, queue: Arc<dyn JobQueue>, scratch: ScratchDir) -> Self {
        Self {
            machine,
            queue,
            scratch,
        }
    }

    /// Stage the upload in the job's scratch directory, persist a `queued`
    /// job and hand it to the queue. Returns immediately with the job ID.
    pub async fn submit(&self, submission: Submission<'_>) -> Result<JobId, SubmitError> {
        let filename = sanitize_filename(submission.filename);
        if filename.is_empty() || filename.chars().all(|c| c == '.') {
            return Err(SubmitError::Invalid("filename is empty".to_string()));
        }
        if submission.credential_ref.trim().is_empty() {
            return Err(SubmitError::Invalid("credential reference is empty".to_string()));
        }
        if !submission.upload_path.is_file() {
            return Err(SubmitError::Invalid(format!(
                "upload not found: {}",
                submission.upload_path.display()
            )));
        }

        let job_id = submission.job_id.unwrap_or_else(JobId::generate);
        if self.machine.store().load(&job_id).await?.is_some() {
            return Err(SubmitError::DuplicateJob(job_id));
        }

        let job_dir = self.scratch.prepare(&job_id)?;
        let source_path = self.scratch.source_path(&job_id, &filename);
        if let Err(e) = stage(submission.upload_path, &source_path, submission.ingest).await {
            discard(&job_dir).await;
            return Err(e.into());
        }

        let descriptor = JobDescriptor {
            job_id: job_id.clone(),
            source_path,
            provider: submission.provider,
            credential_ref: submission.credential_ref.to_string(),
        };

        if let Err(e) = self.machine.create(&Job::new(&descriptor, submission.filename)).await {
            discard(&job_dir).await;
            return Err(e.into());
        }

        if let Err(e) = self.queue.enqueue(descriptor.clone()).await {
            discard(&job_dir).await;
            let reason = format!("could not enqueue job: {}", e);
            if let Err(store_error) = self.machine.finish_failure(&job_id, &reason).await {
                tracing::error!(job_id = %job_id, error = %store_error, "Failed to mark unqueued job as failed");
            }
            return Err(e.into());
        }

        tracing::info!(job_id = %job_id, provider = %submission.provider, filename = %submission.filename, "Job submitted");
        Ok(job_id)
    }

    pub async fn status(&self, job_id: &JobId) -> Result<Option<JobView>, StoreError> {
        Ok(self.machine.store().load(job_id).await?.map(|job| job.view()))
    }

    /// Poll until the job reaches a terminal state
    pub async fn wait_for_completion(&self, job_id: &JobId, poll: Duration) -> Result<JobView, StoreError> {
        loop {
            match self.status(job_id).await? {
                Some(view) if view.status.is_terminal() => return Ok(view),
                Some(_) => {}
                None => {
                    return Err(StoreError::Unavailable(format!("job {} disappeared", job_id)));
                }
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Re-enqueue every unfinished job found in the store, e.g. after a
    /// restart. Returns how many were queued.
    pub async fn recover(&self) -> Result<usize, SubmitError> {
        let mut recovered = 0;
        for job in self.machine.store().list_unfinished().await? {
            match self.queue.enqueue(job.descriptor()).await {
                Ok(()) => recovered += 1,
                Err(QueueError::Duplicate(_)) => {}
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "Could not recover job");
                }
            }
        }

        if recovered > 0 {
            tracing::info!(count = recovered, "Recovered unfinished jobs");
        }
        Ok(recovered)
    }
}

async fn stage(from: &Path, to: &Path, ingest: Ingest) -> std::io::Result<()> {
    match ingest {
        Ingest::Copy => {
            tokio::fs::copy(from, to).await?;
        }
        Ingest::Move => {
            // rename fails across filesystems
            if tokio::fs::rename(from, to).await.is_err() {
                tokio::fs::copy(from, to).await?;
                tokio::fs::remove_file(from).await?;
            }
        }
    }
    Ok(())
}

async fn discard(job_dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(job_dir).await {
        tracing::warn!(path = %job_dir.display(), error = %e, "Failed to remove staged upload");
    }
}
