use chrono::Utc;
use std::sync::Arc;

use super::{Job, JobId, JobStatus, JobStore, NotificationSink, StatusEvent, StoreError, ERROR_PREFIX};

/// Owns job lifecycle transitions.
///
/// Status only moves forward (`queued -> processing -> completed | failed`),
/// progress never decreases, and terminal jobs are never touched again, which
/// makes every operation safe to repeat after a redelivery.
pub struct JobStateMachine {
    store: Arc<dyn JobStore>,
    notifier: Arc<dyn NotificationSink>,
}

impl JobStateMachine {
    pub fn new(store: Arc<dyn JobStore>, notifier: Arc<dyn NotificationSink>) -> Self {
        Self { store, notifier }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Persist a newly submitted job and announce it as queued
    pub async fn create(&self, job: &Job) -> Result<(), StoreError> {
        self.store.save(job).await?;
        self.emit(job);
        Ok(())
    }

    /// Record progress on a non-terminal job.
    ///
    /// Lower progress than already stored is accepted but clamped; `status`
    /// cannot move the job backwards and terminal statuses are ignored here
    /// (use [`finish_success`](Self::finish_success) / [`finish_failure`](Self::finish_failure)).
    pub async fn advance(
        &self,
        job_id: &JobId,
        status: JobStatus,
        progress: u8,
        message: &str,
    ) -> Result<(), StoreError> {
        if status.is_terminal() {
            tracing::warn!(job_id = %job_id, status = %status, "advance() cannot finish a job");
            return Ok(());
        }

        let Some(mut job) = self.store.load(job_id).await? else {
            tracing::warn!(job_id = %job_id, "Progress update for unknown job");
            return Ok(());
        };

        if job.is_terminal() {
            tracing::debug!(job_id = %job_id, status = %job.status, "Ignoring progress on finished job");
            return Ok(());
        }

        if status.rank() > job.status.rank() {
            job.status = status;
        }
        job.progress = job.progress.max(progress.min(100));
        job.message = message.to_string();

        self.store.save(&job).await?;
        self.emit(&job);
        Ok(())
    }

    /// Count a delivery and move the job to `processing`.
    ///
    /// Returns the updated record, or `None` when the job is unknown or
    /// already terminal and must not run again.
    pub async fn begin_attempt(&self, job_id: &JobId) -> Result<Option<Job>, StoreError> {
        let Some(mut job) = self.store.load(job_id).await? else {
            return Ok(None);
        };
        if job.is_terminal() {
            return Ok(None);
        }

        job.deliveries += 1;
        job.status = JobStatus::Processing;
        self.store.save(&job).await?;
        Ok(Some(job))
    }

    /// Terminal success. Returns whether the transition was applied.
    pub async fn finish_success(&self, job_id: &JobId, text: &str) -> Result<bool, StoreError> {
        let Some(mut job) = self.load_unfinished(job_id).await? else {
            return Ok(false);
        };

        job.status = JobStatus::Completed;
        job.progress = 100;
        job.message = "Transcription completed!".to_string();
        job.result_text = Some(text.to_string());
        job.error = None;
        job.completed_at = Some(Utc::now());

        self.store.save(&job).await?;
        tracing::info!(job_id = %job_id, chars = text.len(), "Job completed");
        self.emit(&job);
        Ok(true)
    }

    /// Terminal failure; progress keeps its last value. Returns whether the
    /// transition was applied.
    pub async fn finish_failure(&self, job_id: &JobId, error: &str) -> Result<bool, StoreError> {
        let Some(mut job) = self.load_unfinished(job_id).await? else {
            return Ok(false);
        };

        job.status = JobStatus::Failed;
        job.message = format!("Transcription failed: {}", error);
        job.result_text = None;
        job.error = Some(format!("{}{}", ERROR_PREFIX, error));
        job.completed_at = Some(Utc::now());

        self.store.save(&job).await?;
        tracing::warn!(job_id = %job_id, error = %error, "Job failed");
        self.emit(&job);
        Ok(true)
    }

    async fn load_unfinished(&self, job_id: &JobId) -> Result<Option<Job>, StoreError> {
        match self.store.load(job_id).await? {
            None => {
                tracing::warn!(job_id = %job_id, "Job vanished before it could be finished");
                Ok(None)
            }
            Some(job) if job.is_terminal() => {
                tracing::debug!(job_id = %job_id, status = %job.status, "Job already finished");
                Ok(None)
            }
            Some(job) => Ok(Some(job)),
        }
    }

    fn emit(&self, job: &Job) {
        self.notifier.publish(StatusEvent {
            job_id: job.id.clone(),
            status: job.status,
            progress: job.progress,
            message: job.message.clone(),
        });
    }
}
