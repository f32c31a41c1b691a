//! Bounded work queue with a fixed-size supervised worker pool.
//!
//! The pool defaults to one worker: the downstream transcription and LLM
//! calls are resource-heavy, so concurrency is explicit backpressure here.
//!
//! Concurrency discipline: a single mutex guards enqueue/dequeue bookkeeping
//! only. A worker releases the lock before executing the job handler, so the
//! long-running pipeline stage never blocks the queue. A worker whose task
//! dies is respawned by its supervisor to keep pool capacity constant.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::domain::{Job, JobStatus, QueueStats};

/// Errors from queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue is full ({capacity} jobs)")]
    Full { capacity: usize },

    #[error("Job for {0} is already queued or running")]
    Duplicate(PathBuf),

    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Job {0} already started, cannot cancel")]
    AlreadyRunning(Uuid),
}

/// Executes one job. Implemented by the pipeline orchestrator.
///
/// On success the handler returns the job's resolved content hash (if it got
/// far enough to compute one) so the queue can record it. A handler error is
/// recorded on the job and logged; it never crashes the worker or the pool.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn run(&self, job: &Job) -> anyhow::Result<Option<String>>;
}

/// Queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Worker pool size (MAX_CONCURRENT_PROCESSING)
    pub pool_size: usize,

    /// Maximum queued jobs before enqueue is rejected
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            pool_size: 1,
            capacity: 100,
        }
    }
}

/// Bookkeeping guarded by the queue mutex
struct QueueState {
    /// FIFO of jobs not yet picked up
    queued: VecDeque<Uuid>,

    /// Every job we know about, including finished ones
    jobs: HashMap<Uuid, Job>,

    /// Count of jobs currently executing in workers
    running: usize,
}

impl QueueState {
    /// Finished jobs are kept for status queries but trimmed to a bound
    fn trim_finished(&mut self, keep: usize) {
        let mut finished: Vec<(Uuid, chrono::DateTime<chrono::Utc>)> = self
            .jobs
            .iter()
            .filter(|(_, j)| matches!(j.status, JobStatus::Done | JobStatus::Error))
            .map(|(id, j)| (*id, j.enqueued_at))
            .collect();

        if finished.len() <= keep {
            return;
        }
        finished.sort_by(|a, b| b.1.cmp(&a.1));
        for (id, _) in finished.into_iter().skip(keep) {
            self.jobs.remove(&id);
        }
    }
}

struct QueueInner {
    state: Mutex<QueueState>,
    notify: Notify,
    running_flag: AtomicBool,
    config: QueueConfig,
}

/// Bounded FIFO job queue with a worker pool.
pub struct WorkQueue {
    inner: Arc<QueueInner>,
    supervisors: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkQueue {
    pub fn new(config: QueueConfig) -> Self {
        tracing::info!(
            pool_size = config.pool_size,
            capacity = config.capacity,
            "Work queue initialized"
        );
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    queued: VecDeque::new(),
                    jobs: HashMap::new(),
                    running: 0,
                }),
                notify: Notify::new(),
                running_flag: AtomicBool::new(false),
                config,
            }),
            supervisors: Mutex::new(Vec::new()),
        }
    }

    /// Add a file to the queue.
    ///
    /// Rejected (non-fatally) when the queue is full or an equivalent job for
    /// the same path is already queued or running.
    pub fn enqueue(&self, file_path: &Path) -> Result<Uuid, QueueError> {
        let mut state = self.inner.state.lock().expect("queue mutex poisoned");

        let duplicate = state.jobs.values().any(|j| {
            j.file_path == file_path && matches!(j.status, JobStatus::Queued | JobStatus::Running)
        });
        if duplicate {
            return Err(QueueError::Duplicate(file_path.to_path_buf()));
        }

        if state.queued.len() >= self.inner.config.capacity {
            return Err(QueueError::Full {
                capacity: self.inner.config.capacity,
            });
        }

        let job = Job::new(file_path.to_path_buf());
        let id = job.job_id;
        state.queued.push_back(id);
        state.jobs.insert(id, job);
        drop(state);

        self.inner.notify.notify_one();
        tracing::debug!(job_id = %id, path = %file_path.display(), "Job enqueued");
        Ok(id)
    }

    /// Best-effort cancel: only a job still waiting in the FIFO can be
    /// removed. A running job is past its commit point.
    pub fn cancel(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut state = self.inner.state.lock().expect("queue mutex poisoned");

        match state.jobs.get(&job_id).map(|j| j.status) {
            None => Err(QueueError::NotFound(job_id)),
            Some(JobStatus::Queued) => {
                state.queued.retain(|id| *id != job_id);
                state.jobs.remove(&job_id);
                tracing::info!(job_id = %job_id, "Job canceled");
                Ok(())
            }
            Some(_) => Err(QueueError::AlreadyRunning(job_id)),
        }
    }

    /// Point-in-time counters
    pub fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock().expect("queue mutex poisoned");
        let done = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Done)
            .count();
        let errored = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Error)
            .count();
        QueueStats {
            queued: state.queued.len(),
            running: state.running,
            capacity: self.inner.config.capacity,
            pool_size: self.inner.config.pool_size,
            done,
            errored,
        }
    }

    /// Status of a known job
    pub fn job_status(&self, job_id: Uuid) -> Option<JobStatus> {
        let state = self.inner.state.lock().expect("queue mutex poisoned");
        state.jobs.get(&job_id).map(|j| j.status)
    }

    /// Whether any live (queued or running) job targets this path
    pub fn has_live_job(&self, file_path: &Path) -> bool {
        let state = self.inner.state.lock().expect("queue mutex poisoned");
        state.jobs.values().any(|j| {
            j.file_path == file_path && matches!(j.status, JobStatus::Queued | JobStatus::Running)
        })
    }

    /// Start the worker pool. Each worker gets a supervisor task that
    /// respawns it if its task dies, so pool capacity stays constant.
    pub fn start_workers(&self, handler: Arc<dyn JobHandler>) {
        if self.inner.running_flag.swap(true, Ordering::SeqCst) {
            tracing::warn!("Workers are already running");
            return;
        }

        let mut supervisors = self.supervisors.lock().expect("queue mutex poisoned");
        for worker_id in 0..self.inner.config.pool_size {
            let inner = Arc::clone(&self.inner);
            let handler = Arc::clone(&handler);

            supervisors.push(tokio::spawn(async move {
                while inner.running_flag.load(Ordering::SeqCst) {
                    let task = tokio::spawn(worker_loop(
                        worker_id,
                        Arc::clone(&inner),
                        Arc::clone(&handler),
                    ));
                    match task.await {
                        Ok(()) => break, // clean shutdown
                        Err(e) => {
                            tracing::error!(worker_id, error = %e, "Worker died, respawning");
                        }
                    }
                }
            }));
        }

        tracing::info!("Started {} worker(s)", self.inner.config.pool_size);
    }

    /// Stop workers after they finish their current job.
    pub async fn shutdown(&self) {
        self.inner.running_flag.store(false, Ordering::SeqCst);
        self.inner.notify.notify_waiters();

        let handles: Vec<JoinHandle<()>> = {
            let mut supervisors = self.supervisors.lock().expect("queue mutex poisoned");
            supervisors.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("Worker pool stopped");
    }
}

/// Worker loop: pull FIFO, execute outside the lock, record outcome.
async fn worker_loop(worker_id: usize, inner: Arc<QueueInner>, handler: Arc<dyn JobHandler>) {
    loop {
        if !inner.running_flag.load(Ordering::SeqCst) {
            return;
        }

        // Pop under the lock, then release it before running the job
        let job = {
            let mut state = inner.state.lock().expect("queue mutex poisoned");
            match state.queued.pop_front() {
                Some(id) => {
                    state.running += 1;
                    let job = state.jobs.get_mut(&id).expect("queued id without job");
                    job.status = JobStatus::Running;
                    Some(job.clone())
                }
                None => None,
            }
        };

        let Some(job) = job else {
            // Nothing queued; park until an enqueue wakes us. The timeout
            // doubles as the shutdown poll so a missed wakeup cannot hang us.
            let _ = tokio::time::timeout(
                std::time::Duration::from_millis(500),
                inner.notify.notified(),
            )
            .await;
            continue;
        };

        tracing::info!(worker_id, job_id = %job.job_id, path = %job.file_path.display(), "Job started");
        let result = handler.run(&job).await;

        let mut state = inner.state.lock().expect("queue mutex poisoned");
        state.running -= 1;
        if let Some(stored) = state.jobs.get_mut(&job.job_id) {
            match &result {
                Ok(hash) => {
                    stored.status = JobStatus::Done;
                    stored.content_hash = hash.clone();
                }
                Err(_) => stored.status = JobStatus::Error,
            }
        }
        state.trim_finished(100);
        drop(state);

        if let Err(e) = result {
            // Per-job errors are recorded and swallowed; the pool lives on
            tracing::error!(worker_id, job_id = %job.job_id, error = %e, "Job failed");
        } else {
            tracing::info!(worker_id, job_id = %job.job_id, "Job finished");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct NoopHandler;

    #[async_trait]
    impl JobHandler for NoopHandler {
        async fn run(&self, _job: &Job) -> anyhow::Result<Option<String>> {
            Ok(None)
        }
    }

    #[test]
    fn test_enqueue_rejects_duplicates() {
        let queue = WorkQueue::new(QueueConfig::default());
        let path = PathBuf::from("/watch/a.m4a");

        queue.enqueue(&path).unwrap();
        assert!(matches!(
            queue.enqueue(&path),
            Err(QueueError::Duplicate(_))
        ));
    }

    #[test]
    fn test_enqueue_rejects_when_full() {
        let queue = WorkQueue::new(QueueConfig {
            pool_size: 1,
            capacity: 2,
        });

        queue.enqueue(Path::new("/watch/a.m4a")).unwrap();
        queue.enqueue(Path::new("/watch/b.m4a")).unwrap();
        assert!(matches!(
            queue.enqueue(Path::new("/watch/c.m4a")),
            Err(QueueError::Full { capacity: 2 })
        ));
    }

    #[test]
    fn test_cancel_queued_only() {
        let queue = WorkQueue::new(QueueConfig::default());
        let id = queue.enqueue(Path::new("/watch/a.m4a")).unwrap();

        queue.cancel(id).unwrap();
        assert!(queue.job_status(id).is_none());
        assert!(matches!(queue.cancel(id), Err(QueueError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_workers_drain_queue() {
        let queue = WorkQueue::new(QueueConfig::default());
        let a = queue.enqueue(Path::new("/watch/a.m4a")).unwrap();
        let b = queue.enqueue(Path::new("/watch/b.m4a")).unwrap();

        queue.start_workers(Arc::new(NoopHandler));

        // Wait for both to finish
        for _ in 0..100 {
            let stats = queue.stats();
            if stats.done == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(queue.job_status(a), Some(JobStatus::Done));
        assert_eq!(queue.job_status(b), Some(JobStatus::Done));
        queue.shutdown().await;
    }

    struct ConcurrencyProbe {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for ConcurrencyProbe {
        async fn run(&self, _job: &Job) -> anyhow::Result<Option<String>> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_pool_size_bounds_concurrency() {
        let queue = WorkQueue::new(QueueConfig {
            pool_size: 2,
            capacity: 100,
        });

        let probe = Arc::new(ConcurrencyProbe {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });

        for i in 0..20 {
            queue
                .enqueue(&PathBuf::from(format!("/watch/{i}.m4a")))
                .unwrap();
        }

        queue.start_workers(Arc::clone(&probe) as Arc<dyn JobHandler>);

        for _ in 0..200 {
            if queue.stats().done == 20 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(queue.stats().done, 20);
        assert!(probe.peak.load(Ordering::SeqCst) <= 2);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_handler_error_does_not_kill_pool() {
        let queue = WorkQueue::new(QueueConfig::default());
        let bad = queue.enqueue(Path::new("/watch/bad.m4a")).unwrap();
        let good = queue.enqueue(Path::new("/watch/good.m4a")).unwrap();

        // Single worker hits the failing job first, then still processes
        // the next one
        struct Mixed;
        #[async_trait]
        impl JobHandler for Mixed {
            async fn run(&self, job: &Job) -> anyhow::Result<Option<String>> {
                if job.file_path.to_string_lossy().contains("bad") {
                    anyhow::bail!("stage blew up")
                }
                Ok(None)
            }
        }

        queue.start_workers(Arc::new(Mixed));

        for _ in 0..100 {
            let stats = queue.stats();
            if stats.done + stats.errored == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(queue.job_status(bad), Some(JobStatus::Error));
        assert_eq!(queue.job_status(good), Some(JobStatus::Done));
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = WorkQueue::new(QueueConfig::default());

        let order = Arc::new(Mutex::new(Vec::new()));

        struct Recorder {
            order: Arc<Mutex<Vec<PathBuf>>>,
        }
        #[async_trait]
        impl JobHandler for Recorder {
            async fn run(&self, job: &Job) -> anyhow::Result<Option<String>> {
                self.order.lock().unwrap().push(job.file_path.clone());
                Ok(None)
            }
        }

        for name in ["first", "second", "third"] {
            queue
                .enqueue(&PathBuf::from(format!("/watch/{name}.m4a")))
                .unwrap();
        }

        queue.start_workers(Arc::new(Recorder {
            order: Arc::clone(&order),
        }));

        for _ in 0..100 {
            if queue.stats().done == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let seen = order.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                PathBuf::from("/watch/first.m4a"),
                PathBuf::from("/watch/second.m4a"),
                PathBuf::from("/watch/third.m4a"),
            ]
        );
        queue.shutdown().await;
    }
}
