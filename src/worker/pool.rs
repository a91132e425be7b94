use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{JobRunner, RunOutcome};
use crate::queue::{JobQueue, Lease};
use crate::PipelineError;

const IDLE_POLL: Duration = Duration::from_secs(1);

/// Bounded set of workers pulling leases from a [`JobQueue`].
///
/// Each worker holds at most one lease and runs it to completion under the
/// hard time limit before looking for more work.
pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    runner: Arc<JobRunner>,
    workers: usize,
    hard_time_limit: Duration,
    max_deliveries: u32,
    idle_poll: Duration,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        runner: Arc<JobRunner>,
        workers: usize,
        hard_time_limit: Duration,
        max_deliveries: u32,
    ) -> Self {
        Self {
            queue,
            runner,
            workers: workers.max(1),
            hard_time_limit,
            max_deliveries,
            idle_poll: IDLE_POLL,
        }
    }

    /// Override how often idle workers re-check the queue
    pub fn with_idle_poll(mut self, idle_poll: Duration) -> Self {
        self.idle_poll = idle_poll;
        self
    }

    /// Start the workers. They stop once `shutdown` is cancelled, finishing
    /// any job already in hand first.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        tracing::info!(workers = self.workers, "Starting worker pool");
        (0..self.workers)
            .map(|index| {
                let pool = self.clone();
                let shutdown = shutdown.clone();
                let name = format!("worker-{}", index);
                tokio::spawn(async move { pool.work(name, shutdown).await })
            })
            .collect()
    }

    /// Spawn the workers and wait until all of them have exited
    pub async fn run_until(self: Arc<Self>, shutdown: CancellationToken) {
        let handles = self.spawn(shutdown);
        for result in futures_util::future::join_all(handles).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }
    }

    async fn work(&self, name: String, shutdown: CancellationToken) {
        tracing::debug!(worker = %name, "Worker started");

        while !shutdown.is_cancelled() {
            match self.queue.try_lease(&name).await {
                Ok(Some(lease)) => self.process(lease).await,
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.queue.wait_for_work(self.idle_poll) => {}
                    }
                }
                Err(e) => {
                    tracing::error!(worker = %name, error = %e, "Failed to lease job");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.idle_poll) => {}
                    }
                }
            }
        }

        tracing::debug!(worker = %name, "Worker stopped");
    }

    /// Handle one lease end to end. The lease is acknowledged once the job is
    /// terminal; if the terminal state could not be stored it is left to
    /// expire so the job comes back.
    pub async fn process(&self, lease: Lease) {
        let span = tracing::info_span!(
            "job",
            job_id = %lease.job_id(),
            worker = %lease.worker,
            delivery = lease.delivery
        );

        async {
            let machine = self.runner.machine();
            let job = match machine.begin_attempt(lease.job_id()).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    tracing::info!("Job already finished or unknown, acknowledging without work");
                    self.ack(&lease).await;
                    return;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Could not start job, leaving lease to expire");
                    return;
                }
            };

            if job.deliveries > self.max_deliveries {
                let error = PipelineError::DeliveryLimit(self.max_deliveries);
                tracing::warn!(deliveries = job.deliveries, "Delivery limit reached");
                if self.runner.abandon(&lease.descriptor, &error).await.is_ok() {
                    self.ack(&lease).await;
                }
                return;
            }

            match tokio::time::timeout(self.hard_time_limit, self.runner.run(&lease.descriptor)).await {
                Ok(Ok(outcome)) => {
                    match &outcome {
                        RunOutcome::Completed => tracing::info!("Job completed"),
                        RunOutcome::Failed(reason) => tracing::info!(reason = %reason, "Job failed"),
                        RunOutcome::AlreadyFinished => tracing::info!("Job finished by another delivery"),
                    }
                    self.ack(&lease).await;
                }
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "Could not store final job state, leaving lease to expire");
                }
                Err(_) => {
                    let error = PipelineError::Timeout(format!(
                        "hard time limit of {}s exceeded",
                        self.hard_time_limit.as_secs()
                    ));
                    tracing::error!("{}", error);
                    match self.runner.abandon(&lease.descriptor, &error).await {
                        Ok(_) => self.ack(&lease).await,
                        Err(e) => tracing::error!(error = %e, "Could not record timeout"),
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn ack(&self, lease: &Lease) {
        if let Err(e) = self.queue.ack(lease).await {
            tracing::warn!(error = %e, "Acknowledgement rejected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentialStore;
    use crate::jobs::{
        InMemoryJobStore, Job, JobDescriptor, JobStateMachine, JobStatus, JobStore, NullNotifier,
    };
    use crate::providers::{ProviderKind, ProviderRegistry};
    use crate::queue::InMemoryJobQueue;
    use crate::worker::testing::{FakeExtractor, FakeProvider};
    use crate::worker::ScratchDir;
    use tempfile::TempDir;

    struct Setup {
        _dir: TempDir,
        scratch: ScratchDir,
        store: Arc<InMemoryJobStore>,
        queue: Arc<InMemoryJobQueue>,
        runner: Arc<JobRunner>,
        provider: Arc<FakeProvider>,
    }

    fn setup(provider: FakeProvider) -> Setup {
        let dir = TempDir::new().unwrap();
        let scratch = ScratchDir::create(dir.path()).unwrap();
        let store = Arc::new(InMemoryJobStore::new());
        let machine = Arc::new(JobStateMachine::new(store.clone(), Arc::new(NullNotifier)));
        let provider = Arc::new(provider);
        let mut providers = ProviderRegistry::new();
        providers.register(provider.clone());

        let runner = Arc::new(JobRunner::new(
            machine,
            Arc::new(StaticCredentialStore::new().with("owner", ProviderKind::Gemini, "key")),
            Arc::new(FakeExtractor::with_duration(Duration::from_secs(30))),
            providers,
            scratch.clone(),
            Duration::from_secs(3300),
        ));

        Setup {
            _dir: dir,
            scratch,
            store,
            queue: Arc::new(InMemoryJobQueue::new(Duration::from_secs(3900))),
            runner,
            provider,
        }
    }

    async fn submit(setup: &Setup, id: &str) -> JobDescriptor {
        let job_id: crate::jobs::JobId = id.parse().unwrap();
        setup.scratch.prepare(&job_id).unwrap();
        let source_path = setup.scratch.source_path(&job_id, "clip.mp4");
        fs_err::write(&source_path, b"video").unwrap();
        let descriptor = JobDescriptor {
            job_id,
            source_path,
            provider: ProviderKind::Gemini,
            credential_ref: "owner".to_string(),
        };
        setup.store.save(&Job::new(&descriptor, "clip.mp4")).await.unwrap();
        setup.queue.enqueue(descriptor.clone()).await.unwrap();
        descriptor
    }

    fn pool(setup: &Setup, max_deliveries: u32, hard_limit: Duration) -> WorkerPool {
        WorkerPool::new(setup.queue.clone(), setup.runner.clone(), 2, hard_limit, max_deliveries)
            .with_idle_poll(Duration::from_millis(10))
    }

    async fn status(setup: &Setup, id: &str) -> Job {
        setup.store.load(&id.parse().unwrap()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_process_completes_and_acks() {
        let setup = setup(FakeProvider::new(ProviderKind::Gemini, None, vec![Ok("transcript")]));
        submit(&setup, "one").await;
        let pool = pool(&setup, 3, Duration::from_secs(3600));

        let lease = setup.queue.try_lease("test").await.unwrap().unwrap();
        pool.process(lease).await;

        let job = status(&setup, "one").await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.deliveries, 1);
        assert_eq!(setup.queue.depth().await, Default::default());
    }

    #[tokio::test]
    async fn test_redelivered_terminal_job_is_acked_without_work() {
        let setup = setup(FakeProvider::new(ProviderKind::Gemini, None, vec![Ok("first"), Ok("second")]));
        let descriptor = submit(&setup, "dup").await;
        let pool = pool(&setup, 3, Duration::from_secs(3600));

        let lease = setup.queue.try_lease("test").await.unwrap().unwrap();
        pool.process(lease).await;

        // Same job delivered again, e.g. after a lost acknowledgement
        setup.queue.enqueue(descriptor).await.unwrap();
        let again = setup.queue.try_lease("test").await.unwrap().unwrap();
        pool.process(again).await;

        assert_eq!(setup.provider.seen.lock().unwrap().len(), 1);
        assert_eq!(status(&setup, "dup").await.result_text.as_deref(), Some("first"));
        assert_eq!(setup.queue.depth().await, Default::default());
    }

    #[tokio::test]
    async fn test_job_past_delivery_limit_is_failed() {
        let setup = setup(FakeProvider::new(ProviderKind::Gemini, None, vec![Ok("never")]));
        let descriptor = submit(&setup, "flaky").await;
        let mut job = status(&setup, "flaky").await;
        job.deliveries = 3;
        setup.store.save(&job).await.unwrap();

        let lease = setup.queue.try_lease("test").await.unwrap().unwrap();
        pool(&setup, 3, Duration::from_secs(3600)).process(lease).await;

        let job = status(&setup, "flaky").await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("Error: Gave up after 3 deliveries"));
        assert!(setup.provider.seen.lock().unwrap().is_empty());
        assert!(!descriptor.source_path.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_time_limit_fails_job_and_removes_files() {
        let mut provider = FakeProvider::new(ProviderKind::Gemini, None, vec![Ok("too slow")]);
        provider.delay = Duration::from_secs(7200);
        let setup = setup(provider);
        submit(&setup, "stuck").await;

        let lease = setup.queue.try_lease("test").await.unwrap().unwrap();
        pool(&setup, 3, Duration::from_secs(3600)).process(lease).await;

        let job = status(&setup, "stuck").await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("hard time limit"));
        assert!(fs_err::read_dir(setup.scratch.root()).unwrap().next().is_none());
        assert_eq!(setup.queue.depth().await, Default::default());
    }

    #[tokio::test]
    async fn test_pool_drains_queue_and_stops_on_shutdown() {
        let setup = setup(FakeProvider::new(
            ProviderKind::Gemini,
            None,
            vec![Ok("a"), Ok("b"), Ok("c")],
        ));
        for id in ["j1", "j2", "j3"] {
            submit(&setup, id).await;
        }

        let shutdown = CancellationToken::new();
        let pool = Arc::new(pool(&setup, 3, Duration::from_secs(3600)));
        let handle = tokio::spawn(pool.run_until(shutdown.clone()));

        for _ in 0..200 {
            let done = setup.store.list_unfinished().await.unwrap().is_empty();
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown.cancel();
        handle.await.unwrap();

        for id in ["j1", "j2", "j3"] {
            assert_eq!(status(&setup, id).await.status, JobStatus::Completed);
        }
    }
}
