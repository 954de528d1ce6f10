//! Job queue abstraction and the in-memory implementation.
//!
//! [`JobQueue`] is the surface the bundle pipeline talks to: enqueue, delayed
//! enqueue, cancel, and listing what is queued or running for a kind.
//! [`WorkQueue`] adds what workers need to claim and settle jobs.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use lcms_core::EntityId;

use super::types::{DeadLetterEntry, Job, JobDescriptor, JobId, JobKind, JobOptions, JobStatus, RetryPolicy};

/// Queue error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("queue backend error: {0}")]
    Storage(String),
}

/// Producer-side queue operations.
pub trait JobQueue: Send + Sync {
    /// Enqueue a job that is ready immediately.
    fn enqueue(&self, kind: JobKind, entity_id: EntityId, options: JobOptions) -> Result<JobId, QueueError>;

    /// Enqueue a job that may not run before `at`.
    fn schedule(
        &self,
        kind: JobKind,
        entity_id: EntityId,
        options: JobOptions,
        at: DateTime<Utc>,
    ) -> Result<JobId, QueueError>;

    /// Cancel a job that has not started. Returns whether anything was cancelled.
    fn cancel(&self, job_id: JobId) -> Result<bool, QueueError>;

    /// Jobs of `kind` waiting to run, delayed and retry-pending jobs included.
    fn list_queued(&self, kind: JobKind) -> Result<Vec<JobDescriptor>, QueueError>;

    /// Jobs of `kind` currently claimed by a worker.
    fn list_running(&self, kind: JobKind) -> Result<Vec<JobDescriptor>, QueueError>;

    /// Waiting and running jobs of `kind`.
    ///
    /// Backends override this to read both sets in one snapshot, so a job
    /// claimed between the two reads is not missed.
    fn list_active(&self, kind: JobKind) -> Result<Vec<JobDescriptor>, QueueError> {
        let mut jobs = self.list_queued(kind)?;
        jobs.extend(self.list_running(kind)?);
        Ok(jobs)
    }

    /// Forget completed and cancelled jobs last touched before `before`.
    /// Returns how many were dropped.
    fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize, QueueError>;
}

/// Worker-side queue operations.
pub trait WorkQueue: JobQueue {
    /// Claim the oldest ready job, optionally restricted to `kinds`.
    fn claim_next(&self, kinds: Option<&[JobKind]>) -> Result<Option<Job>, QueueError>;

    fn get(&self, job_id: JobId) -> Result<Option<Job>, QueueError>;

    /// Persist a job after a run.
    fn update(&self, job: &Job) -> Result<(), QueueError>;

    /// Every job of `kind` the queue still knows about, in creation order.
    fn list_by_kind(&self, kind: JobKind, limit: usize) -> Result<Vec<Job>, QueueError>;

    fn dead_letter(&self, job: Job, reason: String) -> Result<(), QueueError>;

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError>;

    /// Move a dead-lettered job back to pending with a fresh attempt budget.
    fn retry_dead_letter(&self, job_id: JobId) -> Result<Job, QueueError>;

    fn stats(&self) -> Result<QueueStats, QueueError>;
}

impl<Q> JobQueue for Arc<Q>
where
    Q: JobQueue + ?Sized,
{
    fn enqueue(&self, kind: JobKind, entity_id: EntityId, options: JobOptions) -> Result<JobId, QueueError> {
        (**self).enqueue(kind, entity_id, options)
    }

    fn schedule(
        &self,
        kind: JobKind,
        entity_id: EntityId,
        options: JobOptions,
        at: DateTime<Utc>,
    ) -> Result<JobId, QueueError> {
        (**self).schedule(kind, entity_id, options, at)
    }

    fn cancel(&self, job_id: JobId) -> Result<bool, QueueError> {
        (**self).cancel(job_id)
    }

    fn list_queued(&self, kind: JobKind) -> Result<Vec<JobDescriptor>, QueueError> {
        (**self).list_queued(kind)
    }

    fn list_running(&self, kind: JobKind) -> Result<Vec<JobDescriptor>, QueueError> {
        (**self).list_running(kind)
    }

    fn list_active(&self, kind: JobKind) -> Result<Vec<JobDescriptor>, QueueError> {
        (**self).list_active(kind)
    }

    fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize, QueueError> {
        (**self).purge_finished(before)
    }
}

impl<Q> WorkQueue for Arc<Q>
where
    Q: WorkQueue + ?Sized,
{
    fn claim_next(&self, kinds: Option<&[JobKind]>) -> Result<Option<Job>, QueueError> {
        (**self).claim_next(kinds)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        (**self).get(job_id)
    }

    fn update(&self, job: &Job) -> Result<(), QueueError> {
        (**self).update(job)
    }

    fn list_by_kind(&self, kind: JobKind, limit: usize) -> Result<Vec<Job>, QueueError> {
        (**self).list_by_kind(kind, limit)
    }

    fn dead_letter(&self, job: Job, reason: String) -> Result<(), QueueError> {
        (**self).dead_letter(job, reason)
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        (**self).list_dead_letters(limit)
    }

    fn retry_dead_letter(&self, job_id: JobId) -> Result<Job, QueueError> {
        (**self).retry_dead_letter(job_id)
    }

    fn stats(&self) -> Result<QueueStats, QueueError> {
        (**self).stats()
    }
}

/// Queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub cancelled: usize,
}

/// Retry policy applied to newly enqueued jobs, by kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicies {
    by_kind: HashMap<JobKind, RetryPolicy>,
}

impl Default for RetryPolicies {
    /// Children: three attempts, five seconds apart. Bundles: no retry.
    fn default() -> Self {
        Self::new(RetryPolicy::fixed(3, Duration::from_secs(5)))
    }
}

impl RetryPolicies {
    /// `child` for every child kind; bundles never retry.
    pub fn new(child: RetryPolicy) -> Self {
        let by_kind = JobKind::ALL
            .into_iter()
            .map(|kind| {
                let policy = if kind.is_bundle() {
                    RetryPolicy::no_retry()
                } else {
                    child.clone()
                };
                (kind, policy)
            })
            .collect();
        Self { by_kind }
    }

    pub fn with(mut self, kind: JobKind, policy: RetryPolicy) -> Self {
        self.by_kind.insert(kind, policy);
        self
    }

    pub fn for_kind(&self, kind: JobKind) -> RetryPolicy {
        self.by_kind.get(&kind).cloned().unwrap_or_default()
    }
}

/// In-memory job queue for tests/dev.
#[derive(Debug)]
pub struct InMemoryJobQueue {
    jobs: RwLock<HashMap<JobId, Job>>,
    dead_letters: RwLock<HashMap<JobId, DeadLetterEntry>>,
    policies: RetryPolicies,
}

fn poisoned<T>(_: T) -> QueueError {
    QueueError::Storage("lock poisoned".to_string())
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::with_policies(RetryPolicies::default())
    }

    pub fn with_policies(policies: RetryPolicies) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            dead_letters: RwLock::new(HashMap::new()),
            policies,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Insert a fully built job as-is.
    pub fn submit(&self, job: Job) -> Result<JobId, QueueError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let id = job.id();
        if jobs.contains_key(&id) {
            return Err(QueueError::AlreadyExists(id));
        }
        jobs.insert(id, job);
        Ok(id)
    }

    fn build(&self, kind: JobKind, entity_id: EntityId, options: JobOptions) -> Job {
        Job::new(kind, entity_id, options).with_retry_policy(self.policies.for_kind(kind))
    }

    fn descriptors(
        &self,
        kind: JobKind,
        filter: impl Fn(&JobStatus) -> bool,
    ) -> Result<Vec<JobDescriptor>, QueueError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut matching: Vec<&Job> = jobs
            .values()
            .filter(|j| j.kind() == kind && filter(&j.status))
            .collect();
        matching.sort_by_key(|j| (j.created_at, j.id()));
        Ok(matching.into_iter().map(|j| j.descriptor.clone()).collect())
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue for InMemoryJobQueue {
    fn enqueue(&self, kind: JobKind, entity_id: EntityId, options: JobOptions) -> Result<JobId, QueueError> {
        self.submit(self.build(kind, entity_id, options))
    }

    fn schedule(
        &self,
        kind: JobKind,
        entity_id: EntityId,
        options: JobOptions,
        at: DateTime<Utc>,
    ) -> Result<JobId, QueueError> {
        self.submit(self.build(kind, entity_id, options).scheduled_at(at))
    }

    fn cancel(&self, job_id: JobId) -> Result<bool, QueueError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        match jobs.get_mut(&job_id) {
            Some(job) if job.status.is_waiting() => {
                job.mark_cancelled();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn list_queued(&self, kind: JobKind) -> Result<Vec<JobDescriptor>, QueueError> {
        self.descriptors(kind, JobStatus::is_waiting)
    }

    fn list_running(&self, kind: JobKind) -> Result<Vec<JobDescriptor>, QueueError> {
        self.descriptors(kind, |s| matches!(s, JobStatus::Running))
    }

    fn list_active(&self, kind: JobKind) -> Result<Vec<JobDescriptor>, QueueError> {
        self.descriptors(kind, |s| s.is_waiting() || matches!(s, JobStatus::Running))
    }

    fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let len = jobs.len();
        jobs.retain(|_, job| {
            !(matches!(job.status, JobStatus::Completed | JobStatus::Cancelled) && job.updated_at < before)
        });
        Ok(len - jobs.len())
    }
}

impl WorkQueue for InMemoryJobQueue {
    fn claim_next(&self, kinds: Option<&[JobKind]>) -> Result<Option<Job>, QueueError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;

        // Oldest ready job first; delayed jobs are ordered by when they became ready.
        let next = jobs
            .values()
            .filter(|j| {
                j.status.is_waiting()
                    && j.is_ready()
                    && kinds.is_none_or(|ks| ks.contains(&j.kind()))
            })
            .min_by_key(|j| (j.scheduled_at.unwrap_or(j.created_at), j.created_at, j.id()))
            .map(|j| j.id());

        Ok(next.and_then(|id| {
            jobs.get_mut(&id).map(|job| {
                job.mark_running();
                job.clone()
            })
        }))
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        Ok(jobs.get(&job_id).cloned())
    }

    fn update(&self, job: &Job) -> Result<(), QueueError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        match jobs.get_mut(&job.id()) {
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(QueueError::NotFound(job.id())),
        }
    }

    fn list_by_kind(&self, kind: JobKind, limit: usize) -> Result<Vec<Job>, QueueError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut result: Vec<_> = jobs.values().filter(|j| j.kind() == kind).cloned().collect();
        result.sort_by_key(|j| (j.created_at, j.id()));
        result.truncate(limit);
        Ok(result)
    }

    fn dead_letter(&self, mut job: Job, reason: String) -> Result<(), QueueError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let mut dead = self.dead_letters.write().map_err(poisoned)?;

        job.status = JobStatus::DeadLettered {
            error: reason.clone(),
            attempts: job.attempt,
        };
        job.updated_at = Utc::now();

        jobs.remove(&job.id());
        dead.insert(job.id(), DeadLetterEntry::new(job, reason));
        Ok(())
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        let dead = self.dead_letters.read().map_err(poisoned)?;
        let mut result: Vec<_> = dead.values().cloned().collect();
        result.sort_by_key(|e| e.dead_lettered_at);
        result.truncate(limit);
        Ok(result)
    }

    fn retry_dead_letter(&self, job_id: JobId) -> Result<Job, QueueError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let mut dead = self.dead_letters.write().map_err(poisoned)?;

        let entry = dead.remove(&job_id).ok_or(QueueError::NotFound(job_id))?;
        let mut job = entry.job;
        job.status = JobStatus::Pending;
        job.attempt = 0;
        job.scheduled_at = None;
        job.updated_at = Utc::now();
        job.history.clear();

        jobs.insert(job.id(), job.clone());
        Ok(job)
    }

    fn stats(&self) -> Result<QueueStats, QueueError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let dead = self.dead_letters.read().map_err(poisoned)?;

        let mut stats = QueueStats::default();
        for job in jobs.values() {
            match &job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed { .. } => stats.failed += 1,
                JobStatus::DeadLettered { .. } => stats.dead_lettered += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats.dead_lettered += dead.len();
        Ok(stats)
    }
}
