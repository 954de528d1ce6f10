//! Job executor with retry and dead-letter handling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::queue::{QueueError, WorkQueue};
use super::types::{Job, JobKind, JobResult, JobStatus};

/// Job handler function type.
pub type JobHandler = Arc<dyn Fn(&Job) -> JobResult + Send + Sync>;

/// Job executor configuration.
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// How often to poll when the queue is empty
    pub poll_interval: Duration,
    /// Name for logging
    pub name: String,
    /// Restrict this executor to some kinds
    pub kinds: Option<Vec<JobKind>>,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            name: "bundle-worker".to_string(),
            kinds: None,
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_kinds(mut self, kinds: Vec<JobKind>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl JobExecutorHandle {
    /// Request graceful shutdown and wait for the current job to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_deferred: u64,
    /// Failed attempts that will be retried
    pub jobs_retried: u64,
    pub jobs_dead_lettered: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

impl ExecutorStats {
    fn record(&mut self, outcome: &Execution) {
        self.jobs_processed += 1;
        match outcome {
            Execution::Succeeded => self.jobs_succeeded += 1,
            Execution::Deferred => self.jobs_deferred += 1,
            Execution::Retrying(_) => self.jobs_retried += 1,
            Execution::DeadLettered(_) => self.jobs_dead_lettered += 1,
        }
    }
}

/// How one claimed job was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Execution {
    Succeeded,
    Deferred,
    Retrying(String),
    DeadLettered(String),
}

/// Background job executor.
///
/// Claims ready jobs from a work queue, runs the handler registered for the
/// job's kind, and settles the job: completed, retried with backoff, or
/// dead-lettered once its retry budget is spent.
pub struct JobExecutor<Q: WorkQueue> {
    queue: Q,
    handlers: HashMap<JobKind, JobHandler>,
}

impl<Q: WorkQueue + Clone> Clone for JobExecutor<Q> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            handlers: self.handlers.clone(),
        }
    }
}

impl<Q: WorkQueue + 'static> JobExecutor<Q> {
    pub fn new(queue: Q) -> Self {
        Self {
            queue,
            handlers: HashMap::new(),
        }
    }

    pub fn register_handler<F>(&mut self, kind: JobKind, handler: F)
    where
        F: Fn(&Job) -> JobResult + Send + Sync + 'static,
    {
        self.handlers.insert(kind, Arc::new(handler));
    }

    pub fn handles(&self, kind: JobKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    /// Spawn the executor in a background thread.
    pub fn spawn(self, config: JobExecutorConfig) -> std::io::Result<JobExecutorHandle>
    where
        Q: Send,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || executor_loop(self, config, shutdown_rx, stats_clone))?;

        Ok(JobExecutorHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }

    /// Spawn `workers` executors sharing the same queue and handlers.
    pub fn spawn_pool(self, config: JobExecutorConfig, workers: usize) -> std::io::Result<Vec<JobExecutorHandle>>
    where
        Q: Clone + Send,
    {
        (0..workers.max(1))
            .map(|n| {
                let config = config.clone().with_name(format!("{}-{n}", config.name));
                self.clone().spawn(config)
            })
            .collect()
    }

    /// Run ready jobs on the calling thread until the queue has nothing ready
    /// or `max_jobs` have run.
    pub fn drain(&self, max_jobs: usize) -> Result<ExecutorStats, QueueError> {
        let mut stats = ExecutorStats::default();
        while (stats.jobs_processed as usize) < max_jobs {
            let Some(mut job) = self.queue.claim_next(None)? else {
                break;
            };
            let outcome = self.execute_one(&mut job)?;
            stats.record(&outcome);
        }
        Ok(stats)
    }

    /// Run one claimed job and settle it in the queue.
    pub fn execute_one(&self, job: &mut Job) -> Result<Execution, QueueError> {
        let Some(handler) = self.handlers.get(&job.kind()) else {
            // A kind without a handler is a wiring bug; retrying cannot fix it.
            let reason = format!("no handler for job kind: {}", job.kind());
            error!(job_id = %job.id(), kind = %job.kind(), "no handler registered");
            self.queue.dead_letter(job.clone(), reason.clone())?;
            job.status = JobStatus::DeadLettered {
                error: reason.clone(),
                attempts: job.attempt,
            };
            return Ok(Execution::DeadLettered(reason));
        };

        let started = Utc::now();
        match handler(job) {
            JobResult::Success => {
                job.mark_completed(started);
                self.queue.update(job)?;
                debug!(job_id = %job.id(), kind = %job.kind(), "job completed");
                Ok(Execution::Succeeded)
            }
            JobResult::Deferred => {
                job.mark_completed(started);
                self.queue.update(job)?;
                debug!(job_id = %job.id(), kind = %job.kind(), "job deferred");
                Ok(Execution::Deferred)
            }
            JobResult::Failure(error) => {
                job.mark_failed(error.clone(), started);
                if matches!(job.status, JobStatus::DeadLettered { .. }) {
                    warn!(job_id = %job.id(), kind = %job.kind(), error = %error, "job dead-lettered");
                    self.queue.dead_letter(job.clone(), error.clone())?;
                    Ok(Execution::DeadLettered(error))
                } else {
                    self.queue.update(job)?;
                    debug!(
                        job_id = %job.id(),
                        kind = %job.kind(),
                        attempt = job.attempt,
                        error = %error,
                        "job failed, retry scheduled"
                    );
                    Ok(Execution::Retrying(error))
                }
            }
        }
    }
}

fn executor_loop<Q: WorkQueue + 'static>(
    executor: JobExecutor<Q>,
    config: JobExecutorConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<ExecutorStats>>,
) {
    info!(executor = %config.name, "job executor started");
    let start_time = Instant::now();

    let update = |f: &dyn Fn(&mut ExecutorStats)| {
        if let Ok(mut s) = stats.lock() {
            f(&mut s);
        }
    };

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }
        update(&|s| s.uptime_secs = start_time.elapsed().as_secs());

        match executor.queue.claim_next(config.kinds.as_deref()) {
            Ok(Some(mut job)) => {
                debug!(
                    executor = %config.name,
                    job_id = %job.id(),
                    kind = %job.kind(),
                    entity_id = %job.descriptor.entity_id,
                    "claimed job"
                );
                update(&|s| s.current_running += 1);

                let result = executor.execute_one(&mut job);

                update(&|s| s.current_running = s.current_running.saturating_sub(1));
                match result {
                    Ok(outcome) => update(&|s| s.record(&outcome)),
                    Err(e) => {
                        error!(executor = %config.name, job_id = %job.id(), error = %e, "failed to settle job");
                    }
                }
            }
            Ok(None) => thread::sleep(config.poll_interval),
            Err(e) => {
                error!(executor = %config.name, error = %e, "failed to claim job");
                thread::sleep(config.poll_interval);
            }
        }
    }

    info!(executor = %config.name, "job executor stopped");
}
