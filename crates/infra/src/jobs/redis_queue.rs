//! Redis-backed work queue (shared between worker processes).
//!
//! ## Layout
//!
//! - `<prefix>:job:<id>`: the serialized [`Job`]
//! - `<prefix>:queued:<kind>`: sorted set of waiting job ids, scored by the
//!   unix-millis instant they become claimable
//! - `<prefix>:running:<kind>`: set of claimed job ids
//! - `<prefix>:dead`: hash of dead-letter entries by job id
//!
//! Claiming runs as one Lua script: it picks the oldest ready id across the
//! requested kinds and moves it from `queued` to `running` in a single step,
//! so a job is never absent from both indexes and two workers never claim
//! the same id. Terminal jobs are deleted outright.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use redis::Commands;
use tracing::{debug, instrument};

use lcms_core::EntityId;

use super::queue::{JobQueue, QueueError, QueueStats, RetryPolicies, WorkQueue};
use super::types::{DeadLetterEntry, Job, JobDescriptor, JobId, JobKind, JobOptions, JobStatus};

const DEFAULT_PREFIX: &str = "lcms:jobs";

/// Claims skipped over because their payload was missing, before giving up.
const CLAIM_ATTEMPTS: usize = 5;

/// KEYS: the queued sets, then the running sets, of the requested kinds.
/// ARGV: now (unix millis), key prefix.
/// Returns nil when nothing is ready, else `{id, payload}` with a nil
/// payload when the job key has vanished.
const CLAIM_SCRIPT: &str = r"
local n = #KEYS / 2
local best, best_score, best_i
for i = 1, n do
  local head = redis.call('ZRANGEBYSCORE', KEYS[i], '-inf', ARGV[1], 'WITHSCORES', 'LIMIT', 0, 1)
  if head[1] then
    local score = tonumber(head[2])
    if best_score == nil or score < best_score then
      best, best_score, best_i = head[1], score, i
    end
  end
end
if best == nil then
  return false
end
redis.call('ZREM', KEYS[best_i], best)
local payload = redis.call('GET', ARGV[2] .. ':job:' .. best)
if not payload then
  return {best, false}
end
redis.call('SADD', KEYS[n + best_i], best)
return {best, payload}
";

#[derive(Debug, Clone)]
pub struct RedisJobQueue {
    client: Arc<redis::Client>,
    prefix: String,
    policies: RetryPolicies,
    claim: Arc<redis::Script>,
}

fn backend(e: impl std::fmt::Display) -> QueueError {
    QueueError::Storage(e.to_string())
}

impl RedisJobQueue {
    /// `redis_url` e.g. `redis://localhost:6379`.
    pub fn new(redis_url: impl AsRef<str>, prefix: Option<String>) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(backend)?;
        Ok(Self {
            client: Arc::new(client),
            prefix: prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            policies: RetryPolicies::default(),
            claim: Arc::new(redis::Script::new(CLAIM_SCRIPT)),
        })
    }

    pub fn with_policies(mut self, policies: RetryPolicies) -> Self {
        self.policies = policies;
        self
    }

    fn conn(&self) -> Result<redis::Connection, QueueError> {
        self.client.get_connection().map_err(backend)
    }

    fn job_key(&self, id: JobId) -> String {
        format!("{}:job:{id}", self.prefix)
    }

    fn queued_key(&self, kind: JobKind) -> String {
        format!("{}:queued:{kind}", self.prefix)
    }

    fn running_key(&self, kind: JobKind) -> String {
        format!("{}:running:{kind}", self.prefix)
    }

    fn dead_key(&self) -> String {
        format!("{}:dead", self.prefix)
    }

    fn ready_score(job: &Job) -> i64 {
        job.scheduled_at.unwrap_or(job.created_at).timestamp_millis()
    }

    fn load(&self, conn: &mut redis::Connection, id: &str) -> Result<Option<Job>, QueueError> {
        let raw: Option<String> = conn.get(format!("{}:job:{id}", self.prefix)).map_err(backend)?;
        raw.map(|s| serde_json::from_str(&s).map_err(backend)).transpose()
    }

    fn load_many(&self, conn: &mut redis::Connection, ids: Vec<String>) -> Result<Vec<Job>, QueueError> {
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.load(conn, &id)? {
                jobs.push(job);
            }
        }
        jobs.sort_by_key(|j| (j.created_at, j.id()));
        Ok(jobs)
    }

    /// Writes the job and moves its id to the index matching its status.
    fn store(&self, conn: &mut redis::Connection, job: &Job) -> Result<(), QueueError> {
        let id = job.id().to_string();
        let queued = self.queued_key(job.kind());
        let running = self.running_key(job.kind());
        let mut pipe = redis::pipe();
        pipe.atomic();

        match &job.status {
            JobStatus::Pending | JobStatus::Failed { .. } => {
                let payload = serde_json::to_string(job).map_err(backend)?;
                pipe.set(self.job_key(job.id()), payload)
                    .srem(&running, &id)
                    .zadd(&queued, &id, Self::ready_score(job));
            }
            JobStatus::Running => {
                let payload = serde_json::to_string(job).map_err(backend)?;
                pipe.set(self.job_key(job.id()), payload)
                    .zrem(&queued, &id)
                    .sadd(&running, &id);
            }
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::DeadLettered { .. } => {
                pipe.del(self.job_key(job.id())).zrem(&queued, &id).srem(&running, &id);
            }
        }
        pipe.query::<()>(conn).map_err(backend)
    }

    fn insert(&self, job: Job) -> Result<JobId, QueueError> {
        let mut conn = self.conn()?;
        let id = job.id();
        self.store(&mut conn, &job)?;
        debug!(job_id = %id, kind = %job.kind(), "job enqueued");
        Ok(id)
    }

    fn build(&self, kind: JobKind, entity_id: EntityId, options: JobOptions) -> Job {
        Job::new(kind, entity_id, options).with_retry_policy(self.policies.for_kind(kind))
    }
}

impl JobQueue for RedisJobQueue {
    #[instrument(skip(self, options), fields(prefix = %self.prefix), err)]
    fn enqueue(&self, kind: JobKind, entity_id: EntityId, options: JobOptions) -> Result<JobId, QueueError> {
        self.insert(self.build(kind, entity_id, options))
    }

    #[instrument(skip(self, options), fields(prefix = %self.prefix), err)]
    fn schedule(
        &self,
        kind: JobKind,
        entity_id: EntityId,
        options: JobOptions,
        at: DateTime<Utc>,
    ) -> Result<JobId, QueueError> {
        self.insert(self.build(kind, entity_id, options).scheduled_at(at))
    }

    fn cancel(&self, job_id: JobId) -> Result<bool, QueueError> {
        let mut conn = self.conn()?;
        let Some(mut job) = self.load(&mut conn, &job_id.to_string())? else {
            return Ok(false);
        };
        let removed: i64 = conn
            .zrem(self.queued_key(job.kind()), job_id.to_string())
            .map_err(backend)?;
        if removed == 0 {
            return Ok(false);
        }
        job.mark_cancelled();
        self.store(&mut conn, &job)?;
        Ok(true)
    }

    fn list_queued(&self, kind: JobKind) -> Result<Vec<JobDescriptor>, QueueError> {
        let mut conn = self.conn()?;
        let ids: Vec<String> = conn.zrange(self.queued_key(kind), 0, -1).map_err(backend)?;
        Ok(self
            .load_many(&mut conn, ids)?
            .into_iter()
            .map(|j| j.descriptor)
            .collect())
    }

    fn list_running(&self, kind: JobKind) -> Result<Vec<JobDescriptor>, QueueError> {
        let mut conn = self.conn()?;
        let ids: Vec<String> = conn.smembers(self.running_key(kind)).map_err(backend)?;
        Ok(self
            .load_many(&mut conn, ids)?
            .into_iter()
            .map(|j| j.descriptor)
            .collect())
    }

    fn list_active(&self, kind: JobKind) -> Result<Vec<JobDescriptor>, QueueError> {
        let mut conn = self.conn()?;
        let (mut ids, running): (Vec<String>, Vec<String>) = redis::pipe()
            .atomic()
            .zrange(self.queued_key(kind), 0, -1)
            .smembers(self.running_key(kind))
            .query(&mut conn)
            .map_err(backend)?;
        ids.extend(running);
        Ok(self
            .load_many(&mut conn, ids)?
            .into_iter()
            .map(|j| j.descriptor)
            .collect())
    }

    /// Terminal jobs are deleted when they are stored, so there is nothing left to purge.
    fn purge_finished(&self, _before: DateTime<Utc>) -> Result<usize, QueueError> {
        Ok(0)
    }
}

impl WorkQueue for RedisJobQueue {
    #[instrument(skip(self), fields(prefix = %self.prefix), err)]
    fn claim_next(&self, kinds: Option<&[JobKind]>) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn()?;
        let kinds = kinds.unwrap_or(&JobKind::ALL);

        for _ in 0..CLAIM_ATTEMPTS {
            let mut invocation = self.claim.prepare_invoke();
            for kind in kinds {
                invocation.key(self.queued_key(*kind));
            }
            for kind in kinds {
                invocation.key(self.running_key(*kind));
            }
            invocation.arg(Utc::now().timestamp_millis()).arg(&self.prefix);

            let claimed: Option<(String, Option<String>)> = invocation.invoke(&mut conn).map_err(backend)?;
            let Some((id, payload)) = claimed else {
                return Ok(None);
            };
            let Some(payload) = payload else {
                debug!(job_id = %id, "dropped queued id without a payload");
                continue;
            };
            let mut job: Job = serde_json::from_str(&payload).map_err(backend)?;
            job.mark_running();
            self.store(&mut conn, &job)?;
            return Ok(Some(job));
        }
        Ok(None)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn()?;
        self.load(&mut conn, &job_id.to_string())
    }

    fn update(&self, job: &Job) -> Result<(), QueueError> {
        let mut conn = self.conn()?;
        let exists: bool = conn.exists(self.job_key(job.id())).map_err(backend)?;
        if !exists {
            return Err(QueueError::NotFound(job.id()));
        }
        self.store(&mut conn, job)
    }

    fn list_by_kind(&self, kind: JobKind, limit: usize) -> Result<Vec<Job>, QueueError> {
        let mut conn = self.conn()?;
        let mut ids: Vec<String> = conn.zrange(self.queued_key(kind), 0, -1).map_err(backend)?;
        let running: Vec<String> = conn.smembers(self.running_key(kind)).map_err(backend)?;
        ids.extend(running);
        let mut jobs = self.load_many(&mut conn, ids)?;
        jobs.truncate(limit);
        Ok(jobs)
    }

    fn dead_letter(&self, mut job: Job, reason: String) -> Result<(), QueueError> {
        let mut conn = self.conn()?;
        job.status = JobStatus::DeadLettered {
            error: reason.clone(),
            attempts: job.attempt,
        };
        job.updated_at = Utc::now();
        let id = job.id().to_string();
        self.store(&mut conn, &job)?;
        let entry = serde_json::to_string(&DeadLetterEntry::new(job, reason)).map_err(backend)?;
        conn.hset::<_, _, _, ()>(self.dead_key(), id, entry).map_err(backend)
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        let mut conn = self.conn()?;
        let raw: Vec<String> = conn.hvals(self.dead_key()).map_err(backend)?;
        let mut entries = raw
            .iter()
            .map(|s| serde_json::from_str::<DeadLetterEntry>(s).map_err(backend))
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|e| e.dead_lettered_at);
        entries.truncate(limit);
        Ok(entries)
    }

    fn retry_dead_letter(&self, job_id: JobId) -> Result<Job, QueueError> {
        let mut conn = self.conn()?;
        let raw: Option<String> = conn.hget(self.dead_key(), job_id.to_string()).map_err(backend)?;
        let entry: DeadLetterEntry = raw
            .map(|s| serde_json::from_str(&s).map_err(backend))
            .transpose()?
            .ok_or(QueueError::NotFound(job_id))?;

        let mut job = entry.job;
        job.status = JobStatus::Pending;
        job.attempt = 0;
        job.scheduled_at = None;
        job.updated_at = Utc::now();
        job.history.clear();

        self.store(&mut conn, &job)?;
        conn.hdel::<_, _, ()>(self.dead_key(), job_id.to_string()).map_err(backend)?;
        Ok(job)
    }

    /// Completed and cancelled jobs are dropped from Redis, so those counters stay zero.
    fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.conn()?;
        let mut stats = QueueStats::default();
        for kind in JobKind::ALL {
            let queued: usize = conn.zcard(self.queued_key(kind)).map_err(backend)?;
            let running: usize = conn.scard(self.running_key(kind)).map_err(backend)?;
            stats.pending += queued;
            stats.running += running;
        }
        stats.dead_lettered = conn.hlen(self.dead_key()).map_err(backend)?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    /// Runs against `LCMS_TEST_REDIS_URL`; skipped when it is unset.
    fn queue() -> Option<RedisJobQueue> {
        let url = std::env::var("LCMS_TEST_REDIS_URL").ok()?;
        let prefix = format!("lcms:test:{}", JobId::new());
        Some(RedisJobQueue::new(url, Some(prefix)).unwrap())
    }

    #[test]
    fn concurrent_claims_never_share_a_job() {
        let Some(queue) = queue() else {
            return;
        };
        let mut enqueued = HashSet::new();
        for _ in 0..20 {
            enqueued.insert(queue.enqueue(JobKind::DocumentPdf, EntityId::new(), JobOptions::new()).unwrap());
        }

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                thread::spawn(move || {
                    let mut claimed = Vec::new();
                    while let Some(job) = queue.claim_next(Some(&[JobKind::DocumentPdf])).unwrap() {
                        // Never invisible: claimed jobs show up as active.
                        let active = queue.list_active(JobKind::DocumentPdf).unwrap();
                        assert!(active.iter().any(|d| d.id == job.id()));
                        claimed.push(job.id());
                    }
                    claimed
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for worker in workers {
            for id in worker.join().unwrap() {
                assert!(seen.insert(id), "job {id} claimed twice");
            }
        }
        assert_eq!(seen, enqueued);
        assert_eq!(queue.list_running(JobKind::DocumentPdf).unwrap().len(), 20);
        assert!(queue.list_queued(JobKind::DocumentPdf).unwrap().is_empty());
    }

    #[test]
    fn claim_prefers_the_oldest_ready_job_across_kinds() {
        let Some(queue) = queue() else {
            return;
        };
        let first = queue.enqueue(JobKind::MaterialPdf, EntityId::new(), JobOptions::new()).unwrap();
        let later = Utc::now() + chrono::Duration::hours(1);
        queue
            .schedule(JobKind::DocumentPdf, EntityId::new(), JobOptions::new(), later)
            .unwrap();
        thread::sleep(std::time::Duration::from_millis(2));
        let second = queue.enqueue(JobKind::DocumentGdoc, EntityId::new(), JobOptions::new()).unwrap();

        assert_eq!(queue.claim_next(None).unwrap().unwrap().id(), first);
        assert_eq!(queue.claim_next(None).unwrap().unwrap().id(), second);
        assert!(queue.claim_next(None).unwrap().is_none());
    }
}
