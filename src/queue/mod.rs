//! Lease-based work queue.
//!
//! Delivery is at-least-once: a leased job stays invisible to other workers
//! until it is acknowledged or its lease expires, after which it is handed
//! out again.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::jobs::{JobDescriptor, JobId};

/// Temporary ownership of one job by one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub descriptor: JobDescriptor,
    pub token: Uuid,
    pub worker: String,
    /// 1 for the first delivery, incremented on every redelivery
    pub delivery: u32,
    pub expires_at: Instant,
}

impl Lease {
    pub fn job_id(&self) -> &JobId {
        &self.descriptor.job_id
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("job {0} is already queued or running")]
    Duplicate(JobId),
    #[error("invalid job descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("lease for job {0} expired or was never granted")]
    LeaseLost(JobId),
}

/// Counts of jobs waiting and in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueDepth {
    pub pending: usize,
    pub leased: usize,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, descriptor: JobDescriptor) -> Result<(), QueueError>;

    /// Claim the next available job for `worker`, if any
    async fn try_lease(&self, worker: &str) -> Result<Option<Lease>, QueueError>;

    /// Block until work may be available or `max_wait` elapses
    async fn wait_for_work(&self, max_wait: Duration);

    /// Remove a finished job for good
    async fn ack(&self, lease: &Lease) -> Result<(), QueueError>;

    async fn depth(&self) -> QueueDepth;
}

#[derive(Debug)]
struct Pending {
    descriptor: JobDescriptor,
    deliveries: u32,
}

#[derive(Debug)]
struct InFlight {
    descriptor: JobDescriptor,
    deliveries: u32,
    token: Uuid,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<Pending>,
    leased: HashMap<JobId, InFlight>,
}

impl QueueState {
    fn contains(&self, id: &JobId) -> bool {
        self.leased.contains_key(id) || self.pending.iter().any(|p| &p.descriptor.job_id == id)
    }

    /// Return expired leases to the queue
    fn reap_expired(&mut self, now: Instant) {
        let expired: Vec<JobId> = self
            .leased
            .iter()
            .filter(|(_, flight)| flight.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            if let Some(flight) = self.leased.remove(&id) {
                tracing::warn!(job_id = %id, deliveries = flight.deliveries, "Lease expired, job will be redelivered");
                self.pending.push_back(Pending {
                    descriptor: flight.descriptor,
                    deliveries: flight.deliveries,
                });
            }
        }
    }
}

/// Process-local queue. Durability comes from the job store: unfinished
/// records are re-enqueued on startup.
pub struct InMemoryJobQueue {
    lease_timeout: Duration,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl InMemoryJobQueue {
    pub fn new(lease_timeout: Duration) -> Self {
        Self {
            lease_timeout,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    fn validate(descriptor: &JobDescriptor) -> Result<(), QueueError> {
        if descriptor.source_path.as_os_str().is_empty() {
            return Err(QueueError::InvalidDescriptor("empty source path".to_string()));
        }
        if descriptor.credential_ref.trim().is_empty() {
            return Err(QueueError::InvalidDescriptor("empty credential reference".to_string()));
        }
        Ok(())
    }

    async fn remove_lease(&self, lease: &Lease) -> Result<InFlight, QueueError> {
        let mut state = self.state.lock().await;
        match state.leased.get(lease.job_id()) {
            Some(flight) if flight.token == lease.token => {}
            _ => return Err(QueueError::LeaseLost(lease.job_id().clone())),
        }
        state
            .leased
            .remove(lease.job_id())
            .ok_or_else(|| QueueError::LeaseLost(lease.job_id().clone()))
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, descriptor: JobDescriptor) -> Result<(), QueueError> {
        Self::validate(&descriptor)?;

        {
            let mut state = self.state.lock().await;
            if state.contains(&descriptor.job_id) {
                return Err(QueueError::Duplicate(descriptor.job_id));
            }
            tracing::info!(job_id = %descriptor.job_id, provider = %descriptor.provider, "Enqueued job");
            state.pending.push_back(Pending {
                descriptor,
                deliveries: 0,
            });
        }

        self.notify.notify_one();
        Ok(())
    }

    async fn try_lease(&self, worker: &str) -> Result<Option<Lease>, QueueError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.reap_expired(now);

        let Some(next) = state.pending.pop_front() else {
            return Ok(None);
        };

        let token = Uuid::new_v4();
        let expires_at = now + self.lease_timeout;
        let deliveries = next.deliveries + 1;
        state.leased.insert(
            next.descriptor.job_id.clone(),
            InFlight {
                descriptor: next.descriptor.clone(),
                deliveries,
                token,
                expires_at,
            },
        );

        tracing::debug!(job_id = %next.descriptor.job_id, worker = %worker, delivery = deliveries, "Leased job");

        Ok(Some(Lease {
            descriptor: next.descriptor,
            token,
            worker: worker.to_string(),
            delivery: deliveries,
            expires_at,
        }))
    }

    async fn wait_for_work(&self, max_wait: Duration) {
        let _ = tokio::time::timeout(max_wait, self.notify.notified()).await;
    }

    async fn ack(&self, lease: &Lease) -> Result<(), QueueError> {
        self.remove_lease(lease).await?;
        tracing::debug!(job_id = %lease.job_id(), "Acknowledged job");
        Ok(())
    }

    async fn depth(&self) -> QueueDepth {
        let state = self.state.lock().await;
        QueueDepth {
            pending: state.pending.len(),
            leased: state.leased.len(),
        }
    }
}
