//! Background jobs: the queue, the worker that drains it, and status tracking.
//!
//! Jobs are delivered at least once. Handlers must tolerate seeing the same
//! job twice.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{JobError, PublishError};
use crate::publish::{CreateDatasetRequest, DatasetChanges};

/// Work executed in the background.
#[derive(Debug, Clone)]
pub enum Job {
    /// Build and validate a dataset with no live channel attached.
    CreateDataset { request: Box<CreateDatasetRequest> },
    /// Create the remote repository of a persisted dataset.
    CreateRepository { dataset_id: Uuid },
    /// Apply changes to a persisted dataset.
    UpdateDataset {
        dataset_id: Uuid,
        changes: DatasetChanges,
    },
}

impl Job {
    /// Short label used in logs and job status.
    pub fn name(&self) -> &'static str {
        match self {
            Job::CreateDataset { .. } => "create_dataset",
            Job::CreateRepository { .. } => "create_repository",
            Job::UpdateDataset { .. } => "update_dataset",
        }
    }
}

/// A job together with the identifier clients poll with.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: String,
    pub job: Job,
}

impl QueuedJob {
    /// Wrap `job` under a fresh random id.
    pub fn new(job: Job) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), job)
    }

    /// Wrap `job` under a caller-chosen id, such as a dataset's job id.
    pub fn with_id(id: impl Into<String>, job: Job) -> Self {
        Self { id: id.into(), job }
    }
}

/// Accepts jobs for background execution.
pub trait JobQueue: Send + Sync {
    fn enqueue(&self, job: QueuedJob) -> Result<(), JobError>;
}

/// Executes dequeued jobs.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run one job, returning a short summary on success.
    async fn handle(&self, job: &QueuedJob) -> Result<String, PublishError>;
}

/// Status of a background job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Tracked state of one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundJob {
    pub id: String,
    pub name: String,
    pub status: JobStatus,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Times the job has been picked up by a worker.
    #[serde(default)]
    pub attempts: u32,
}

impl BackgroundJob {
    /// A pending job enqueued now.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: JobStatus::Pending,
            enqueued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            attempts: 0,
        }
    }

    /// Mark running and count the attempt.
    pub fn start(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
        self.attempts += 1;
    }

    pub fn complete(&mut self, result: impl Into<String>) {
        self.status = JobStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.result = Some(result.into());
        self.error = None;
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error = Some(error.into());
    }

    /// Completed or failed.
    pub fn is_finished(&self) -> bool {
        matches!(self.status, JobStatus::Completed | JobStatus::Failed)
    }
}

/// How long finished jobs stay pollable by default.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(3600);

/// Shared job tracking. Finished jobs are kept for the retention period so
/// clients can poll them, then evicted.
#[derive(Debug)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<String, BackgroundJob>>,
    retention: Duration,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

impl JobRegistry {
    /// Create a registry that keeps finished jobs for `retention`.
    pub fn new(retention: Duration) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            retention,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, BackgroundJob>> {
        // A panic while holding the lock leaves only status bookkeeping behind.
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Track a newly queued job. Re-registering a known id resets it to pending.
    pub fn register(&self, id: &str, name: &str) {
        let mut jobs = self.lock();
        match jobs.get_mut(id) {
            Some(job) => {
                job.status = JobStatus::Pending;
                job.enqueued_at = Utc::now();
                job.completed_at = None;
            }
            None => {
                jobs.insert(id.to_string(), BackgroundJob::new(id, name));
            }
        }
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut BackgroundJob)) -> Result<(), JobError> {
        let mut jobs = self.lock();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| JobError::NotFound { id: id.to_string() })?;
        f(job);
        Ok(())
    }

    /// Mark a tracked job as running.
    pub fn start(&self, id: &str) -> Result<(), JobError> {
        self.update(id, BackgroundJob::start)
    }

    /// Mark a tracked job as completed with a short summary.
    pub fn complete(&self, id: &str, result: impl Into<String>) -> Result<(), JobError> {
        self.update(id, |job| job.complete(result))
    }

    /// Mark a tracked job as failed.
    pub fn fail(&self, id: &str, error: impl Into<String>) -> Result<(), JobError> {
        self.update(id, |job| job.fail(error))
    }

    /// Snapshot of a tracked job.
    pub fn get(&self, id: &str) -> Option<BackgroundJob> {
        self.lock().get(id).cloned()
    }

    /// Number of tracked jobs, finished ones included.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop finished jobs older than the retention period. Returns how many
    /// were dropped.
    pub fn evict_expired(&self) -> usize {
        let now = Utc::now();
        let retention = self.retention;
        let mut jobs = self.lock();
        let before = jobs.len();
        jobs.retain(|_, job| {
            let expired = job
                .completed_at
                .and_then(|at| (now - at).to_std().ok())
                .is_some_and(|age| age >= retention);
            !(job.is_finished() && expired)
        });
        before - jobs.len()
    }
}

/// In-process queue feeding a [`JobWorker`] over an unbounded channel.
pub struct ChannelJobQueue {
    tx: mpsc::UnboundedSender<QueuedJob>,
    registry: Arc<JobRegistry>,
}

impl ChannelJobQueue {
    /// Create the queue and the receiving end for its worker.
    pub fn new(registry: Arc<JobRegistry>) -> (Self, mpsc::UnboundedReceiver<QueuedJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, registry }, rx)
    }
}

impl JobQueue for ChannelJobQueue {
    fn enqueue(&self, job: QueuedJob) -> Result<(), JobError> {
        self.registry.register(&job.id, job.job.name());
        let id = job.id.clone();
        let name = job.job.name();
        self.tx.send(job).map_err(|_| {
            let _ = self.registry.fail(&id, "job queue is closed");
            JobError::QueueClosed
        })?;
        debug!(job_id = %id, job = name, "Job enqueued");
        Ok(())
    }
}

/// Pulls jobs off the channel and runs them one at a time.
pub struct JobWorker {
    rx: mpsc::UnboundedReceiver<QueuedJob>,
    handler: Arc<dyn JobHandler>,
    registry: Arc<JobRegistry>,
}

impl JobWorker {
    /// A worker running jobs from `rx` through `handler`, tracked in `registry`.
    pub fn new(
        rx: mpsc::UnboundedReceiver<QueuedJob>,
        handler: Arc<dyn JobHandler>,
        registry: Arc<JobRegistry>,
    ) -> Self {
        Self {
            rx,
            handler,
            registry,
        }
    }

    /// Run until every sender is dropped.
    pub async fn run(mut self) {
        info!("Job worker started");
        while let Some(job) = self.rx.recv().await {
            self.execute(job).await;
        }
        info!("Job worker stopped");
    }

    /// Run the worker on its own task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run every job queued so far, including ones queued while draining.
    /// Returns how many jobs ran.
    pub async fn drain(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.rx.try_recv() {
            self.execute(job).await;
            ran += 1;
        }
        ran
    }

    async fn execute(&self, job: QueuedJob) {
        if let Err(e) = self.registry.start(&job.id) {
            warn!(job_id = %job.id, error = %e, "Running untracked job");
            self.registry.register(&job.id, job.job.name());
            let _ = self.registry.start(&job.id);
        }
        info!(job_id = %job.id, job = job.job.name(), "Running job");
        match self.handler.handle(&job).await {
            Ok(summary) => {
                info!(job_id = %job.id, summary = %summary, "Job completed");
                let _ = self.registry.complete(&job.id, summary);
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Job failed");
                let _ = self.registry.fail(&job.id, e.to_string());
            }
        }
        let evicted = self.registry.evict_expired();
        if evicted > 0 {
            debug!(evicted, "Evicted finished jobs");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _job: &QueuedJob) -> Result<String, PublishError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(PublishError::DatasetNotFound { id: Uuid::nil() })
            } else {
                Ok("done".into())
            }
        }
    }

    fn create_repo() -> Job {
        Job::CreateRepository {
            dataset_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn test_background_job_lifecycle() {
        let mut job = BackgroundJob::new("j1", "create_repository");
        assert_eq!(job.status, JobStatus::Pending);
        assert!(!job.is_finished());

        job.start();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempts, 1);

        job.complete("ok");
        assert!(job.is_finished());
        assert_eq!(job.result.as_deref(), Some("ok"));
    }

    #[test]
    fn test_registry_tracks_many_jobs() {
        let registry = JobRegistry::default();
        for i in 0..500 {
            registry.register(&format!("job-{i}"), "x");
        }
        assert_eq!(registry.len(), 500);
        registry.start("job-0").unwrap();
        assert_eq!(registry.get("job-0").unwrap().status, JobStatus::Running);
    }

    #[test]
    fn test_registry_reregister_resets_to_pending() {
        let registry = JobRegistry::default();
        registry.register("a", "x");
        registry.start("a").unwrap();
        registry.fail("a", "boom").unwrap();
        registry.register("a", "x");
        let job = registry.get("a").unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.completed_at.is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_unknown_job() {
        let registry = JobRegistry::default();
        assert!(matches!(
            registry.start("missing"),
            Err(JobError::NotFound { .. })
        ));
        assert!(registry.get("missing").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_evict_expired_keeps_unfinished_and_recent() {
        let registry = JobRegistry::new(Duration::ZERO);
        registry.register("a", "x");
        registry.register("b", "x");
        registry.complete("a", "ok").unwrap();
        assert_eq!(registry.evict_expired(), 1);
        assert!(registry.get("a").is_none());
        assert!(registry.get("b").is_some());

        let registry = JobRegistry::default();
        registry.register("c", "x");
        registry.complete("c", "ok").unwrap();
        assert_eq!(registry.evict_expired(), 0);
        assert!(registry.get("c").is_some());
    }

    #[test]
    fn test_job_status_display() {
        assert_eq!(JobStatus::Pending.to_string(), "pending");
        assert_eq!(JobStatus::Failed.to_string(), "failed");
    }

    #[tokio::test]
    async fn test_worker_drains_and_tracks() {
        let registry = Arc::new(JobRegistry::default());
        let (queue, rx) = ChannelJobQueue::new(registry.clone());
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let mut worker = JobWorker::new(rx, handler.clone(), registry.clone());

        let job = QueuedJob::with_id("job-1", create_repo());
        queue.enqueue(job).unwrap();
        assert_eq!(registry.get("job-1").unwrap().status, JobStatus::Pending);

        assert_eq!(worker.drain().await, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        let tracked = registry.get("job-1").unwrap();
        assert_eq!(tracked.status, JobStatus::Completed);
        assert_eq!(tracked.result.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn test_worker_records_failure() {
        let registry = Arc::new(JobRegistry::default());
        let (queue, rx) = ChannelJobQueue::new(registry.clone());
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let mut worker = JobWorker::new(rx, handler, registry.clone());

        queue
            .enqueue(QueuedJob::with_id("job-2", create_repo()))
            .unwrap();
        worker.drain().await;
        let tracked = registry.get("job-2").unwrap();
        assert_eq!(tracked.status, JobStatus::Failed);
        assert!(tracked.error.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_worker_evicts_expired_jobs() {
        let registry = Arc::new(JobRegistry::new(Duration::ZERO));
        let (queue, rx) = ChannelJobQueue::new(registry.clone());
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let mut worker = JobWorker::new(rx, handler.clone(), registry.clone());

        for i in 0..3 {
            queue
                .enqueue(QueuedJob::with_id(format!("job-{i}"), create_repo()))
                .unwrap();
        }
        assert_eq!(worker.drain().await, 3);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_after_worker_dropped() {
        let registry = Arc::new(JobRegistry::default());
        let (queue, rx) = ChannelJobQueue::new(registry.clone());
        drop(rx);
        let err = queue
            .enqueue(QueuedJob::with_id("job-3", create_repo()))
            .unwrap_err();
        assert!(matches!(err, JobError::QueueClosed));
        assert_eq!(registry.get("job-3").unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_spawned_worker_stops_when_queue_dropped() {
        let registry = Arc::new(JobRegistry::default());
        let (queue, rx) = ChannelJobQueue::new(registry.clone());
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let handle = JobWorker::new(rx, handler.clone(), registry.clone()).spawn();
        queue
            .enqueue(QueuedJob::with_id("job-4", create_repo()))
            .unwrap();
        drop(queue);
        handle.await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.get("job-4").unwrap().status, JobStatus::Completed);
    }
}
