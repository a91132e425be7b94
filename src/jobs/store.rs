use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use super::{Job, JobId};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt job record: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence for job records; the source of truth for status queries
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn load(&self, id: &JobId) -> Result<Option<Job>, StoreError>;

    async fn save(&self, job: &Job) -> Result<(), StoreError>;

    /// Jobs that have not reached a terminal state, oldest first
    async fn list_unfinished(&self) -> Result<Vec<Job>, StoreError>;
}

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn load(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn save(&self, job: &Job) -> Result<(), StoreError> {
        self.jobs.write().await.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn list_unfinished(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| !job.is_terminal())
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }
}

/// One JSON document per job inside a directory.
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// reader never sees a half-written record.
pub struct JsonFileJobStore {
    dir: PathBuf,
}

impl JsonFileJobStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs_err::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn record_path(&self, id: &JobId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    async fn read_record(path: &Path) -> Result<Job, StoreError> {
        let bytes = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl JobStore for JsonFileJobStore {
    async fn load(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        match Self::read_record(&self.record_path(id)).await {
            Ok(job) => Ok(Some(job)),
            Err(StoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn save(&self, job: &Job) -> Result<(), StoreError> {
        let path = self.record_path(&job.id);
        let tmp = self.dir.join(format!(".{}.json.tmp", job.id));
        let content = serde_json::to_vec_pretty(job)?;

        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn list_unfinished(&self) -> Result<Vec<Job>, StoreError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut jobs = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_record = path.extension().and_then(|ext| ext.to_str()) == Some("json")
                && !entry.file_name().to_string_lossy().starts_with('.');
            if !is_record {
                continue;
            }

            match Self::read_record(&path).await {
                Ok(job) if !job.is_terminal() => jobs.push(job),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable job record");
                }
            }
        }

        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }
}
