//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use lcms_core::{EntityId, impl_uuid_newtype};
use lcms_curriculum::{ArtifactKind, ContentType};

/// Unique job identifier, assigned by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl_uuid_newtype!(JobId, "JobId");

/// Identity of one logical generation request.
///
/// The first job of a request uses its own job id; every requeue and every
/// dependant carries it forward as `initial_request_id`. Ids are UUIDv7, so
/// comparing two of them orders requests by age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl_uuid_newtype!(RequestId, "RequestId");

/// Token for one dispatched child, awaited by a completion barrier.
///
/// Minted per dispatch rather than derived from `(kind, entity)`, so two
/// children for the same entity, or a second dispatch of the same request,
/// are counted separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChildKey(Uuid);

impl_uuid_newtype!(ChildKey, "ChildKey");

impl From<JobId> for RequestId {
    fn from(id: JobId) -> Self {
        Self(*id.as_uuid())
    }
}

/// Job kind for routing to handlers.
///
/// Closed set: every kind the bundle pipeline enqueues has a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    DocumentPdf,
    DocumentGdoc,
    MaterialPdf,
    MaterialGdoc,
    UnitBundlePdf,
    UnitBundleGdoc,
}

impl JobKind {
    pub const ALL: [JobKind; 6] = [
        JobKind::DocumentPdf,
        JobKind::DocumentGdoc,
        JobKind::MaterialPdf,
        JobKind::MaterialGdoc,
        JobKind::UnitBundlePdf,
        JobKind::UnitBundleGdoc,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::DocumentPdf => "document_pdf",
            JobKind::DocumentGdoc => "document_gdoc",
            JobKind::MaterialPdf => "material_pdf",
            JobKind::MaterialGdoc => "material_gdoc",
            JobKind::UnitBundlePdf => "unit_bundle_pdf",
            JobKind::UnitBundleGdoc => "unit_bundle_gdoc",
        }
    }

    /// Composite (orchestrator) kinds, as opposed to per-entity children.
    pub fn is_bundle(&self) -> bool {
        matches!(self, JobKind::UnitBundlePdf | JobKind::UnitBundleGdoc)
    }

    pub fn artifact_kind(&self) -> ArtifactKind {
        match self {
            JobKind::DocumentPdf | JobKind::MaterialPdf | JobKind::UnitBundlePdf => ArtifactKind::Pdf,
            JobKind::DocumentGdoc | JobKind::MaterialGdoc | JobKind::UnitBundleGdoc => ArtifactKind::Gdoc,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options carried by a job from enqueue to execution.
///
/// Opaque to the queue; read by the handlers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_request_id: Option<RequestId>,
    /// Dispatch nested children before anything else.
    #[serde(default)]
    pub with_dependants: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<ContentType>,
    /// Skip the bundle's own result write.
    #[serde(default)]
    pub ignore_result: bool,
    /// Propagate failures instead of recording them.
    #[serde(default)]
    pub raise_errors: bool,
    #[serde(default)]
    pub preview: bool,
    /// Storage folder children upload into.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    /// Remote (Drive) folder children export into.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<String>,
    /// Times this request has been put back to wait.
    #[serde(default)]
    pub deferrals: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_requested_at: Option<DateTime<Utc>>,
    /// Marks a delayed deadline check rather than a real wake-up.
    #[serde(default)]
    pub watchdog: bool,
    /// Barrier slot this child settles, when dispatched under a barrier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub barrier_key: Option<ChildKey>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request(mut self, request: RequestId) -> Self {
        self.initial_request_id = Some(request);
        self
    }

    pub fn with_dependants(mut self, with_dependants: bool) -> Self {
        self.with_dependants = with_dependants;
        self
    }

    pub fn with_content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = Some(content_type);
        self
    }

    pub fn with_preview(mut self, preview: bool) -> Self {
        self.preview = preview;
        self
    }

    pub fn with_folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = Some(folder.into());
        self
    }

    pub fn with_folder_id(mut self, folder_id: impl Into<String>) -> Self {
        self.folder_id = Some(folder_id.into());
        self
    }

    pub fn ignoring_result(mut self) -> Self {
        self.ignore_result = true;
        self
    }

    pub fn raising_errors(mut self) -> Self {
        self.raise_errors = true;
        self
    }

    pub fn with_barrier_key(mut self, key: ChildKey) -> Self {
        self.barrier_key = Some(key);
        self
    }
}

/// Immutable view of a job handed to handlers and returned by queue listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub id: JobId,
    pub kind: JobKind,
    pub entity_id: EntityId,
    pub options: JobOptions,
}

impl JobDescriptor {
    /// `initial_request_id`, falling back to the job's own id.
    pub fn request_id(&self) -> RequestId {
        self.options
            .initial_request_id
            .unwrap_or_else(|| RequestId::from(self.id))
    }

    /// Whether this job is part of `request`.
    pub fn belongs_to(&self, request: RequestId) -> bool {
        RequestId::from(self.id) == request || self.options.initial_request_id == Some(request)
    }
}

/// Job execution status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be picked up
    Pending,
    Running,
    Completed,
    /// Failed, will be retried
    Failed { error: String, attempt: u32 },
    /// Exhausted retries
    DeadLettered { error: String, attempts: u32 },
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::DeadLettered { .. } | JobStatus::Cancelled
        )
    }

    /// Waiting for a (first or retried) run.
    pub fn is_waiting(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Failed { .. })
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    #[default]
    Fixed,
    /// base * 2^(attempt - 1), capped
    Exponential,
}

/// Queue-level retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, first run included (0 and 1 both mean no retry).
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::no_retry()
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay before the retry that follows `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow(attempt - 1);
                self.base_delay
                    .checked_mul(factor)
                    .unwrap_or(self.max_delay)
                    .min(self.max_delay)
            }
        }
    }

    /// Whether a run that just failed on `attempt` gets another one.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// A queued job: descriptor plus queue bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub descriptor: JobDescriptor,
    pub status: JobStatus,
    pub retry_policy: RetryPolicy,
    /// Current attempt number (starts at 0)
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Not claimable before this instant.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Errors from previous attempts.
    pub history: Vec<JobAttemptRecord>,
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl Job {
    pub fn new(kind: JobKind, entity_id: EntityId, options: JobOptions) -> Self {
        let now = Utc::now();
        Self {
            descriptor: JobDescriptor {
                id: JobId::new(),
                kind,
                entity_id,
                options,
            },
            status: JobStatus::Pending,
            retry_policy: RetryPolicy::default(),
            attempt: 0,
            created_at: now,
            updated_at: now,
            scheduled_at: None,
            history: Vec::new(),
        }
    }

    pub fn id(&self) -> JobId {
        self.descriptor.id
    }

    pub fn kind(&self) -> JobKind {
        self.descriptor.kind
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.scheduled_at = Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
        self
    }

    pub fn is_ready(&self) -> bool {
        match self.scheduled_at {
            Some(at) => Utc::now() >= at,
            None => true,
        }
    }

    /// Whether a failure on the current attempt is the last one.
    pub fn is_final_attempt(&self) -> bool {
        !self.retry_policy.should_retry(self.attempt)
    }

    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.attempt += 1;
        self.updated_at = Utc::now();
    }

    pub fn mark_completed(&mut self, started_at: DateTime<Utc>) {
        let now = Utc::now();
        self.status = JobStatus::Completed;
        self.updated_at = now;
        self.record_attempt(started_at, now, None);
    }

    /// Failed attempt: schedules a retry or dead-letters per the policy.
    pub fn mark_failed(&mut self, error: String, started_at: DateTime<Utc>) {
        let now = Utc::now();
        self.updated_at = now;
        self.record_attempt(started_at, now, Some(error.clone()));

        if self.retry_policy.should_retry(self.attempt) {
            let delay = self.retry_policy.delay_for_attempt(self.attempt);
            self.scheduled_at = Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
            self.status = JobStatus::Failed {
                error,
                attempt: self.attempt,
            };
        } else {
            self.status = JobStatus::DeadLettered {
                error,
                attempts: self.attempt,
            };
        }
    }

    pub fn mark_cancelled(&mut self) {
        self.status = JobStatus::Cancelled;
        self.updated_at = Utc::now();
    }

    fn record_attempt(&mut self, started_at: DateTime<Utc>, finished_at: DateTime<Utc>, error: Option<String>) {
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at,
            success: error.is_none(),
            error,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
        });
    }
}

/// What a handler reports back to the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Success,
    /// The handler put a follow-up job on the queue and gave up its turn.
    /// Not a failure: never retried, never dead-lettered.
    Deferred,
    Failure(String),
}

/// Entry in the dead-letter queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job: Job,
    pub dead_lettered_at: DateTime<Utc>,
    pub reason: String,
}

impl DeadLetterEntry {
    pub fn new(job: Job, reason: String) -> Self {
        Self {
            job,
            dead_lettered_at: Utc::now(),
            reason,
        }
    }
}
