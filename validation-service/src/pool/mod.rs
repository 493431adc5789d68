//! The Worker Pool (§4.2, §5): `W` workers consuming a bounded FIFO
//! queue of capacity `Q`, owning the TAP device pool and the credential
//! manager, serializing job execution through the Sandbox Runner.

pub mod credential;
pub mod tap;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{oneshot, Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use validation_common::model::{Job, JobId, JobStatus};

use crate::job_store::JobStore;
use crate::sandbox::{SandboxJobContext, SandboxOutcome, SandboxRunner};
use credential::CredentialManager;
use tap::TapPool;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("queue is at capacity")]
    QueueFull,
    #[error("pool is not ready: {0}")]
    NotReady(String),
    #[error("job {0} not found")]
    UnknownJob(JobId),
    #[error("job {0} has already terminated")]
    AlreadyTerminal(JobId),
    #[error(transparent)]
    Store(#[from] crate::job_store::JobStoreError),
}

struct QueuedJob {
    job_id: JobId,
    task_spec_json: Vec<u8>,
    workspace_path: std::path::PathBuf,
    log_path: std::path::PathBuf,
    timeout_s: u32,
    net_checks: bool,
    stream_log: bool,
    quiet_kernel: bool,
    completion: oneshot::Sender<Job>,
    /// Held for the job's entire in-flight lifetime (queued + running);
    /// dropped only once the job reaches a terminal state. This is what
    /// makes admission capacity `W + Q` rather than just the queue's own
    /// buffer, matching scenario 6 in spec.md §8 (`W=2, Q=0` admits
    /// exactly two concurrent jobs before rejecting the third).
    _admission: tokio::sync::OwnedSemaphorePermit,
}

/// The bounded FIFO queue. Admission capacity (`workers + queue_capacity`)
/// is enforced once at submission time via `admission`; the `VecDeque`
/// itself is simply the wait-list consumed in order by idle workers.
struct JobQueue {
    entries: Mutex<VecDeque<QueuedJob>>,
    admission: Arc<Semaphore>,
    notify: Notify,
}

impl JobQueue {
    fn new(workers: usize, queue_capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            admission: Arc::new(Semaphore::new(workers + queue_capacity)),
            notify: Notify::new(),
        }
    }

    fn try_reserve(self: &Arc<Self>) -> Result<tokio::sync::OwnedSemaphorePermit, PoolError> {
        self.admission
            .clone()
            .try_acquire_owned()
            .map_err(|_| PoolError::QueueFull)
    }

    fn push(&self, job: QueuedJob) {
        self.entries.lock().unwrap().push_back(job);
        self.notify.notify_one();
    }

    /// O(1) removal of a still-queued job, used by cancellation.
    fn remove(&self, job_id: JobId) -> Option<QueuedJob> {
        let mut entries = self.entries.lock().unwrap();
        let position = entries.iter().position(|job| job.job_id == job_id)?;
        entries.remove(position)
    }

    async fn pop(&self) -> QueuedJob {
        loop {
            {
                let mut entries = self.entries.lock().unwrap();
                if let Some(job) = entries.pop_front() {
                    return job;
                }
            }
            self.notify.notified().await;
        }
    }

    fn depth(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

pub struct PoolMetrics {
    pub queue_depth: prometheus::IntGauge,
    pub workers_idle: prometheus::IntGauge,
    pub workers_running: prometheus::IntGauge,
    pub jobs_submitted_total: prometheus::IntCounter,
    pub jobs_failed_total: prometheus::IntCounter,
    pub jobs_timed_out_total: prometheus::IntCounter,
}

impl PoolMetrics {
    pub fn register(registry: &prometheus::Registry) -> Self {
        let queue_depth = prometheus::IntGauge::new("queue_depth", "jobs waiting in queue").unwrap();
        let workers_idle = prometheus::IntGauge::new("workers_idle", "idle workers").unwrap();
        let workers_running =
            prometheus::IntGauge::new("workers_running", "workers currently running a job").unwrap();
        let jobs_submitted_total =
            prometheus::IntCounter::new("jobs_submitted_total", "jobs accepted for execution").unwrap();
        let jobs_failed_total =
            prometheus::IntCounter::new("jobs_failed_total", "jobs that terminated with status=fail").unwrap();
        let jobs_timed_out_total =
            prometheus::IntCounter::new("jobs_timed_out_total", "jobs terminated by timeout").unwrap();

        for metric in [&queue_depth, &workers_idle, &workers_running] {
            let _ = registry.register(Box::new(metric.clone()));
        }
        for metric in [&jobs_submitted_total, &jobs_failed_total, &jobs_timed_out_total] {
            let _ = registry.register(Box::new(metric.clone()));
        }

        Self {
            queue_depth,
            workers_idle,
            workers_running,
            jobs_submitted_total,
            jobs_failed_total,
            jobs_timed_out_total,
        }
    }
}

pub struct WorkerPool {
    queue: Arc<JobQueue>,
    job_store: JobStore,
    tap_pool: Arc<TapPool>,
    credentials: Arc<CredentialManager>,
    sandbox: Arc<dyn SandboxRunner>,
    metrics: Arc<PoolMetrics>,
    sequence: AtomicU64,
    workers_total: usize,
    running_jobs: Mutex<std::collections::HashMap<JobId, CancellationToken>>,
}

impl WorkerPool {
    pub fn start(
        workers: usize,
        queue_capacity: usize,
        job_store: JobStore,
        tap_pool: Arc<TapPool>,
        credentials: Arc<CredentialManager>,
        sandbox: Arc<dyn SandboxRunner>,
        metrics: Arc<PoolMetrics>,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            queue: Arc::new(JobQueue::new(workers, queue_capacity)),
            job_store,
            tap_pool,
            credentials,
            sandbox,
            metrics,
            sequence: AtomicU64::new(0),
            workers_total: workers,
            running_jobs: Mutex::new(std::collections::HashMap::new()),
        });

        for worker_index in 0..workers {
            let pool = pool.clone();
            tokio::spawn(async move { pool.worker_loop(worker_index).await });
        }

        pool
    }

    pub fn workers_total(&self) -> usize {
        self.workers_total
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    pub fn workers_idle(&self) -> usize {
        self.workers_total - self.running_jobs.lock().unwrap().len()
    }

    pub fn token_ready(&self) -> bool {
        self.credentials.is_ready()
    }

    /// Blocking-with-queueing submission (§4.1): returns only once the
    /// job reaches a terminal status, or immediately with an error if it
    /// cannot even be queued.
    pub async fn submit(
        &self,
        job_id: JobId,
        task_id: String,
        task_spec: validation_common::invariant::TaskSpec,
        submission_path: std::path::PathBuf,
        workspace_path: std::path::PathBuf,
        log_path: std::path::PathBuf,
        timeout_s: u32,
        net_checks: bool,
        stream_log: bool,
        quiet_kernel: bool,
    ) -> Result<Job, PoolError> {
        if !self.credentials.is_ready() {
            return Err(PoolError::NotReady("credential manager not ready".to_string()));
        }

        let admission = self.queue.try_reserve()?;

        let task_spec_json = serde_json::to_vec(&task_spec).unwrap_or_default();
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let job = Job {
            job_id,
            task_id,
            status: JobStatus::Queued,
            sequence,
            enqueued_at: chrono::Utc::now(),
            started_at: None,
            finished_at: None,
            task_spec,
            submission_path,
            log_path: log_path.clone(),
            result: None,
            log_tail: String::new(),
            tap_device: None,
            timeout_s,
            net_checks,
            stream_log,
            quiet_kernel,
        };

        let (completion_tx, completion_rx) = oneshot::channel();
        let queued = QueuedJob {
            job_id,
            task_spec_json,
            workspace_path,
            log_path,
            timeout_s,
            net_checks,
            stream_log,
            quiet_kernel,
            completion: completion_tx,
            _admission: admission,
        };

        self.queue.push(queued);
        self.job_store.insert(job)?;
        self.metrics.jobs_submitted_total.inc();
        self.metrics.queue_depth.set(self.queue.depth() as i64);

        completion_rx
            .await
            .map_err(|_| PoolError::NotReady("worker dropped job before completion".to_string()))
    }

    /// O(1): removes a still-queued job without involving any worker.
    pub fn cancel_queued(&self, job_id: JobId) -> Result<(), PoolError> {
        let queued = self.queue.remove(job_id).ok_or(PoolError::UnknownJob(job_id))?;
        let job = self.job_store.with_job_mut(job_id, |job| {
            job.status = JobStatus::Cancelled;
            job.finished_at = Some(chrono::Utc::now());
        })?;
        let _ = queued.completion.send(job);
        Ok(())
    }

    /// Signals the owning worker to escalate cancellation to the
    /// Sandbox Runner (graceful shutdown, then hard kill after a grace
    /// period) for a currently-running job.
    pub fn cancel_running(&self, job_id: JobId) -> Result<(), PoolError> {
        let token = self
            .running_jobs
            .lock()
            .unwrap()
            .get(&job_id)
            .cloned()
            .ok_or(PoolError::UnknownJob(job_id))?;
        token.cancel();
        Ok(())
    }

    async fn worker_loop(self: Arc<Self>, _worker_index: usize) {
        loop {
            let queued = self.queue.pop().await;
            self.metrics.queue_depth.set(self.queue.depth() as i64);
            self.run_one(queued).await;
        }
    }

    async fn run_one(self: &Arc<Self>, queued: QueuedJob) {
        let job_id = queued.job_id;

        let tap_handle = match self.tap_pool.checkout() {
            Ok(handle) => handle,
            Err(_) => {
                let job = self
                    .job_store
                    .with_job_mut(job_id, |job| {
                        job.status = JobStatus::Failed;
                        job.finished_at = Some(chrono::Utc::now());
                        job.result = Some(validation_common::model::ValidationResult::fail_closed(
                            "no TAP device available",
                            job.log_path.display().to_string(),
                        ));
                    })
                    .expect("job was just inserted");
                self.metrics.jobs_failed_total.inc();
                let _ = queued.completion.send(job);
                return;
            }
        };

        let token = match self.credentials.current_token().await {
            Ok(token) => token,
            Err(err) => {
                let job = self
                    .job_store
                    .with_job_mut(job_id, |job| {
                        job.status = JobStatus::Failed;
                        job.finished_at = Some(chrono::Utc::now());
                        job.result = Some(validation_common::model::ValidationResult::fail_closed(
                            &format!("credential manager: {err}"),
                            job.log_path.display().to_string(),
                        ));
                    })
                    .expect("job was just inserted");
                self.metrics.jobs_failed_total.inc();
                let _ = queued.completion.send(job);
                return;
            }
        };

        let cancellation = CancellationToken::new();
        self.running_jobs
            .lock()
            .unwrap()
            .insert(job_id, cancellation.clone());
        self.metrics.workers_running.inc();

        let _ = self.job_store.with_job_mut(job_id, |job| {
            job.status = JobStatus::Running;
            job.started_at = Some(chrono::Utc::now());
            job.tap_device = Some(tap_handle.device().to_string());
        });

        let ctx = SandboxJobContext {
            job_id: job_id.to_string(),
            workspace_path: queued.workspace_path,
            task_spec_json: queued.task_spec_json,
            timeout_s: queued.timeout_s,
            tap_device: tap_handle.device().to_string(),
            access_token: token,
            net_checks: queued.net_checks,
            quiet_kernel: queued.quiet_kernel,
            stream_log: queued.stream_log,
            log_path: queued.log_path,
            cancellation: cancellation.clone(),
        };

        let SandboxOutcome { result, log_tail } = self.sandbox.run_job(ctx).await;

        self.running_jobs.lock().unwrap().remove(&job_id);
        self.metrics.workers_running.dec();
        drop(tap_handle);

        if result.status == validation_common::model::ResultStatus::Fail {
            self.metrics.jobs_failed_total.inc();
        }
        if cancellation.is_cancelled() {
            self.metrics.jobs_timed_out_total.inc();
        }

        let final_status = if cancellation.is_cancelled() && result.total_invariants == 0 {
            JobStatus::Cancelled
        } else {
            JobStatus::Done
        };

        let job = self
            .job_store
            .with_job_mut(job_id, |job| {
                job.status = final_status;
                job.finished_at = Some(chrono::Utc::now());
                job.result = Some(result);
                job.log_tail = log_tail;
                job.tap_device = None;
            })
            .expect("job was just inserted");

        let _ = queued.completion.send(job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use credential::{CredentialManager, MintedToken, TokenMinter};

    struct InstantMinter;

    #[async_trait]
    impl TokenMinter for InstantMinter {
        async fn mint(&self) -> Result<MintedToken, String> {
            Ok(MintedToken {
                token: "test-token".to_string(),
                lifetime: std::time::Duration::from_secs(3600),
            })
        }
    }

    struct FixedOutcomeRunner {
        status: validation_common::model::ResultStatus,
    }

    #[async_trait]
    impl SandboxRunner for FixedOutcomeRunner {
        async fn run_job(&self, ctx: SandboxJobContext) -> SandboxOutcome {
            let result = match self.status {
                validation_common::model::ResultStatus::Pass => {
                    validation_common::model::ValidationResult {
                        status: validation_common::model::ResultStatus::Pass,
                        score: 1.0,
                        passed_invariants: 1,
                        total_invariants: 1,
                        detail: vec![],
                        logs_ref: ctx.log_path.display().to_string(),
                    }
                }
                validation_common::model::ResultStatus::Fail => {
                    validation_common::model::ValidationResult::fail_closed(
                        "forced failure",
                        ctx.log_path.display().to_string(),
                    )
                }
            };
            SandboxOutcome {
                result,
                log_tail: String::new(),
            }
        }
    }

    struct SlowRunner {
        delay: std::time::Duration,
    }

    #[async_trait]
    impl SandboxRunner for SlowRunner {
        async fn run_job(&self, ctx: SandboxJobContext) -> SandboxOutcome {
            tokio::time::sleep(self.delay).await;
            SandboxOutcome {
                result: validation_common::model::ValidationResult::from_detail(
                    vec![],
                    ctx.log_path.display().to_string(),
                ),
                log_tail: String::new(),
            }
        }
    }

    async fn make_pool(
        workers: usize,
        queue_capacity: usize,
        status: validation_common::model::ResultStatus,
    ) -> (Arc<WorkerPool>, tempfile::TempDir) {
        make_pool_with_runner(
            workers,
            queue_capacity,
            Arc::new(FixedOutcomeRunner { status }),
        )
        .await
    }

    async fn make_pool_with_runner(
        workers: usize,
        queue_capacity: usize,
        sandbox: Arc<dyn SandboxRunner>,
    ) -> (Arc<WorkerPool>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let job_store = JobStore::new(dir.path().join("jobs"));
        let tap_pool = TapPool::new("tap-val", workers.max(1)).unwrap();
        let credentials = Arc::new(CredentialManager::new(
            Arc::new(InstantMinter),
            0.2,
            std::time::Duration::from_millis(500),
        ));
        credentials.current_token().await.unwrap();
        let registry = prometheus::Registry::new();
        let metrics = Arc::new(PoolMetrics::register(&registry));
        let pool = WorkerPool::start(
            workers,
            queue_capacity,
            job_store,
            tap_pool,
            credentials,
            sandbox,
            metrics,
        );
        (pool, dir)
    }

    fn empty_task_spec() -> validation_common::invariant::TaskSpec {
        validation_common::invariant::TaskSpec {
            invariants: vec![],
            extra: Default::default(),
        }
    }

    #[tokio::test]
    async fn happy_path_job_completes_with_pass() {
        let (pool, dir) = make_pool(1, 4, validation_common::model::ResultStatus::Pass).await;
        let job = pool
            .submit(
                JobId::new(),
                "task-a".to_string(),
                empty_task_spec(),
                dir.path().join("sub.zip"),
                dir.path().join("workspace"),
                dir.path().join("job.log"),
                30,
                false,
                false,
                false,
            )
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(
            job.result.unwrap().status,
            validation_common::model::ResultStatus::Pass
        );
    }

    #[tokio::test]
    async fn queue_full_rejects_without_creating_a_job() {
        // W=1, Q=0: total admission capacity is 1. The first submission
        // occupies it for the duration of a deliberately slow sandbox
        // run, so the second is guaranteed to observe capacity exhausted.
        let (pool, dir) = make_pool_with_runner(
            1,
            0,
            Arc::new(SlowRunner {
                delay: std::time::Duration::from_millis(200),
            }),
        )
        .await;

        let pool_for_first = pool.clone();
        let dir_path = dir.path().to_path_buf();
        let first = tokio::spawn(async move {
            pool_for_first
                .submit(
                    JobId::new(),
                    "task-a".to_string(),
                    empty_task_spec(),
                    dir_path.join("sub1.zip"),
                    dir_path.join("workspace1"),
                    dir_path.join("job1.log"),
                    30,
                    false,
                    false,
                    false,
                )
                .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let second = pool
            .submit(
                JobId::new(),
                "task-a".to_string(),
                empty_task_spec(),
                dir.path().join("sub2.zip"),
                dir.path().join("workspace2"),
                dir.path().join("job2.log"),
                30,
                false,
                false,
                false,
            )
            .await;

        assert!(matches!(second, Err(PoolError::QueueFull)));
        let job_count = std::fs::read_dir(dir.path().join("jobs"))
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(job_count, 1, "rejected submission must not create a job record");

        let _ = first.await;
    }

    #[tokio::test]
    async fn cancel_queued_job_is_immediate_and_needs_no_worker() {
        let (pool, dir) = make_pool(0, 4, validation_common::model::ResultStatus::Pass).await;
        let pool_for_submit = pool.clone();
        let dir_path = dir.path().to_path_buf();
        let submit_task = tokio::spawn(async move {
            pool_for_submit
                .submit(
                    JobId::new(),
                    "task-a".to_string(),
                    empty_task_spec(),
                    dir_path.join("sub.zip"),
                    dir_path.join("workspace"),
                    dir_path.join("job.log"),
                    30,
                    false,
                    false,
                    false,
                )
                .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let jobs = pool.job_store.active();
        assert_eq!(jobs.len(), 1);
        let job_id = jobs[0].job_id;

        pool.cancel_queued(job_id).unwrap();
        let job = submit_task.await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
    }
}
