use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::providers::ProviderKind;

pub mod notify;
pub mod state;
pub mod store;

pub use notify::{BroadcastNotifier, NotificationSink, NullNotifier, StatusEvent};
pub use state::JobStateMachine;
pub use store::{InMemoryJobStore, JobStore, JsonFileJobStore, StoreError};

/// Prefix separating a failure description from a transcript
pub const ERROR_PREFIX: &str = "Error: ";

const MAX_JOB_ID_LEN: usize = 100;

/// Opaque job identifier, safe to embed in file names
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for JobId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > MAX_JOB_ID_LEN {
            return Err(format!("job id must be 1-{} characters", MAX_JOB_ID_LEN));
        }
        if !s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(format!("job id contains unsupported characters: {}", s));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for JobId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> Self {
        id.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Position along `queued -> processing -> terminal`
    fn rank(&self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Processing => 1,
            JobStatus::Completed | JobStatus::Failed => 2,
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a worker needs to run a job; handed out by the queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub job_id: JobId,
    pub source_path: PathBuf,
    pub provider: ProviderKind,
    /// Opaque handle resolved by the credential store, never the secret itself
    pub credential_ref: String,
}

/// Persisted job record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub source_path: PathBuf,
    /// Name of the file as uploaded
    pub filename: String,
    pub provider: ProviderKind,
    pub credential_ref: String,
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
    pub result_text: Option<String>,
    pub error: Option<String>,
    /// Number of times the job has been leased to a worker
    pub deliveries: u32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(descriptor: &JobDescriptor, filename: impl Into<String>) -> Self {
        Self {
            id: descriptor.job_id.clone(),
            source_path: descriptor.source_path.clone(),
            filename: filename.into(),
            provider: descriptor.provider,
            credential_ref: descriptor.credential_ref.clone(),
            status: JobStatus::Queued,
            progress: 0,
            message: "Queued".to_string(),
            result_text: None,
            error: None,
            deliveries: 0,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn descriptor(&self) -> JobDescriptor {
        JobDescriptor {
            job_id: self.id.clone(),
            source_path: self.source_path.clone(),
            provider: self.provider,
            credential_ref: self.credential_ref.clone(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn view(&self) -> JobView {
        JobView {
            id: self.id.clone(),
            filename: self.filename.clone(),
            provider: self.provider,
            status: self.status,
            text: self.result_text.clone().or_else(|| self.error.clone()),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

/// Status query result exposed to collaborators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub id: JobId,
    pub filename: String,
    pub provider: ProviderKind,
    pub status: JobStatus,
    pub text: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}
