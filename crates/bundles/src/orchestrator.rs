//! Bundle orchestration (fan-out, wait, assemble).
//!
//! A bundle is built by a chain of short, stateless invocations of the same
//! job. Nothing is kept between them except what travels in the job options
//! (request id, deferral count, first request time) and what the shared
//! stores hold (barriers, results, outcomes).
//!
//! ```text
//! invocation
//!   ↓
//! 1. Normalize options (content type tag, bundle defaults)
//!   ↓
//! 2. Under the bundle-type lock:
//!    a. same-self check   → an older request for this entity is active: defer
//!    b. dispatch children (only when `with_dependants`)
//!    c. outstanding check → children still running: defer / wait
//!   ↓
//! 3. generate_bundle() → locator
//!   ↓
//! 4. Write the completed record (unless `ignore_result`), store the outcome
//! ```
//!
//! ## Joining children
//!
//! - `JoinStrategy::Poll`: the bundle re-enqueues itself and scans the queue
//!   for jobs of its nested kinds tagged with its request id until none are
//!   left.
//! - `JoinStrategy::Counter`: dispatch mints one key per child, registers
//!   them as a barrier and only then enqueues the children, each carrying
//!   its key. Each settled child removes its key; the one that empties the
//!   barrier enqueues a single wake-up invocation. A
//!   delayed watchdog invocation fails the bundle if its children are still
//!   outstanding at the deadline.
//!
//! Deferring never blocks a worker. A bundle-type lock held past
//! `lock_timeout` by another invocation is also a deferral, not a failure.
//! Each deferral counts against the configured
//! [`DeferralPolicy`](lcms_infra::DeferralPolicy).
//!
//! ## Failures
//!
//! Errors during dispatch, waiting or assembly either propagate
//! (`raise_errors`) or are recorded as a failed result and outcome, reported
//! to the monitor, and swallowed.

use chrono::Utc;
use serde_json::json;
use tracing::{debug, error, info, warn};

use lcms_core::EntityId;
use lcms_curriculum::{ContentType, ResultRecord, ResultSlot};
use lcms_infra::{JoinStrategy, LockError};
use lcms_infra::barriers::{BarrierState, BarrierTarget, ChildKey};
use lcms_infra::jobs::dedup::{active_duplicates, outstanding_for};
use lcms_infra::jobs::{Job, JobDescriptor, JobId, JobKind, JobOptions, JobResult, RequestId};
use lcms_infra::outcomes::RequestOutcome;
use lcms_observability::ErrorReport;

use crate::error::BundleError;
use crate::nested::NestedJobSet;
use crate::services::BundleServices;

/// Name of the advisory lock serializing dispatch and queue scans for one
/// bundle kind.
pub fn lock_name(kind: JobKind) -> String {
    format!("bundle_generation_{}", kind.as_str())
}

/// One child to enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildSpec {
    pub kind: JobKind,
    pub entity_id: EntityId,
    pub options: JobOptions,
}

/// What one invocation is working on.
#[derive(Debug, Clone, Copy)]
pub struct BundleContext<'a> {
    pub services: &'a BundleServices,
    pub job_id: JobId,
    pub entity_id: EntityId,
    pub request: RequestId,
    pub options: &'a JobOptions,
}

impl BundleContext<'_> {
    /// Options shared by every child of this request.
    pub fn child_options(&self) -> JobOptions {
        let mut options = JobOptions::new()
            .with_request(self.request)
            .with_preview(self.options.preview);
        options.content_type = self.options.content_type;
        options
    }
}

/// A concrete bundle type.
pub trait BundleJob: Send + Sync {
    fn kind(&self) -> JobKind;

    /// Tag of the bundle's records.
    fn content_type(&self) -> ContentType;

    fn nested_jobs(&self) -> NestedJobSet;

    /// Bundle-specific option defaults, applied on every invocation.
    fn normalize(&self, _options: &mut JobOptions) {}

    /// Children to enqueue for this request.
    fn generate_dependants(&self, ctx: &BundleContext<'_>) -> Result<Vec<ChildSpec>, BundleError>;

    /// Assemble the bundle and return its locator.
    fn generate_bundle(&self, ctx: &BundleContext<'_>) -> Result<String, BundleError>;
}

/// What an invocation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleStep {
    /// Re-enqueued itself as `next`.
    Deferred { next: JobId },
    /// Waiting for `remaining` children; the last one wakes the bundle.
    Waiting { remaining: usize },
    Completed { locator: String },
    /// Failure recorded and reported.
    Failed { errors: Vec<String> },
    /// The request was already finished; nothing to do.
    Stale,
}

impl BundleStep {
    pub fn job_result(&self) -> JobResult {
        match self {
            BundleStep::Deferred { .. } | BundleStep::Waiting { .. } => JobResult::Deferred,
            BundleStep::Completed { .. } | BundleStep::Failed { .. } | BundleStep::Stale => JobResult::Success,
        }
    }
}

/// Runs the orchestration state machine for one bundle type.
pub struct BundleOrchestrator<B: BundleJob> {
    bundle: B,
    services: BundleServices,
}

impl<B: BundleJob> BundleOrchestrator<B> {
    pub fn new(bundle: B, services: BundleServices) -> Self {
        Self { bundle, services }
    }

    pub fn bundle(&self) -> &B {
        &self.bundle
    }

    /// Queue handler entry point.
    ///
    /// Propagated errors are recorded against the request before the job is
    /// failed, so callers polling the request see them.
    pub fn handle(&self, job: &Job) -> JobResult {
        let descriptor = &job.descriptor;
        match self.perform(descriptor) {
            Ok(step) => step.job_result(),
            Err(err) => {
                let errors = err.messages();
                error!(
                    job_id = %descriptor.id,
                    kind = %descriptor.kind,
                    entity_id = %descriptor.entity_id,
                    request_id = %descriptor.request_id(),
                    error = %err,
                    "bundle generation raised"
                );
                if let Err(store_err) = self
                    .services
                    .outcomes
                    .store(descriptor.request_id(), RequestOutcome::failure(errors.clone()))
                {
                    error!(job_id = %descriptor.id, error = %store_err, "could not store bundle outcome");
                }
                self.services
                    .monitor
                    .notify(ErrorReport::new(errors.join(": "), self.report_context(descriptor, &descriptor.options)));
                JobResult::Failure(err.to_string())
            }
        }
    }

    /// One invocation of the state machine.
    pub fn perform(&self, descriptor: &JobDescriptor) -> Result<BundleStep, BundleError> {
        if descriptor.kind != self.bundle.kind() {
            return Err(BundleError::UnexpectedKind(descriptor.kind));
        }
        let request = descriptor.request_id();
        let options = self.normalize(descriptor, request);

        if options.watchdog {
            return self.check_deadline(descriptor, request, &options);
        }

        match self.run(descriptor, request, &options) {
            Ok(step) => Ok(step),
            Err(err) => self.fail(descriptor, request, &options, err),
        }
    }

    fn normalize(&self, descriptor: &JobDescriptor, request: RequestId) -> JobOptions {
        let mut options = descriptor.options.clone();
        options.initial_request_id = Some(request);
        options.content_type = Some(self.bundle.content_type());
        options.first_requested_at.get_or_insert_with(Utc::now);
        self.bundle.normalize(&mut options);
        options
    }

    fn context<'a>(&'a self, descriptor: &JobDescriptor, request: RequestId, options: &'a JobOptions) -> BundleContext<'a> {
        BundleContext {
            services: &self.services,
            job_id: descriptor.id,
            entity_id: descriptor.entity_id,
            request,
            options,
        }
    }

    fn run(&self, descriptor: &JobDescriptor, request: RequestId, options: &JobOptions) -> Result<BundleStep, BundleError> {
        let counter = self.services.config.join_strategy == JoinStrategy::Counter;
        if counter && self.barrier_state(request)? == Some(BarrierState::Finished) {
            debug!(job_id = %descriptor.id, request_id = %request, "request already finished");
            return Ok(BundleStep::Stale);
        }

        let ctx = self.context(descriptor, request, options);
        let guard = match self
            .services
            .locks
            .acquire(&lock_name(self.bundle.kind()), self.services.config.lock_timeout)
        {
            Ok(guard) => guard,
            Err(LockError::Timeout { name, waited }) => {
                debug!(job_id = %descriptor.id, request_id = %request, lock = %name, ?waited, "lock busy");
                return self.defer(descriptor, options, options.with_dependants);
            }
            Err(err) => return Err(err.into()),
        };

        if options.with_dependants && self.older_request_active(descriptor, request)? {
            debug!(
                job_id = %descriptor.id,
                entity_id = %descriptor.entity_id,
                request_id = %request,
                "older request for this entity still active"
            );
            return self.defer(descriptor, options, true);
        }

        if options.with_dependants {
            let children = self.bundle.generate_dependants(&ctx)?;
            self.dispatch(descriptor, request, options, children)?;
        }

        match self.services.config.join_strategy {
            JoinStrategy::Poll => {
                if self.has_outstanding(descriptor, request)? {
                    return self.defer(descriptor, options, false);
                }
            }
            JoinStrategy::Counter => match self.services.barriers.snapshot(request)? {
                Some(barrier) => match barrier.state {
                    BarrierState::Pending => {
                        debug!(request_id = %request, remaining = barrier.remaining, "waiting for dependants");
                        return Ok(BundleStep::Waiting {
                            remaining: barrier.remaining,
                        });
                    }
                    BarrierState::Finished => return Ok(BundleStep::Stale),
                    // Claim assembly; a second wake-up now sees Finished.
                    BarrierState::Released => self.finish_barrier(request),
                },
                // Not dispatched through a barrier: fall back to scanning.
                None => {
                    if self.has_outstanding(descriptor, request)? {
                        return self.defer(descriptor, options, false);
                    }
                }
            },
        }
        drop(guard);

        let locator = self.bundle.generate_bundle(&ctx)?;
        if !options.ignore_result {
            self.services.results.write_record(
                descriptor.entity_id,
                ResultSlot::for_preview(options.preview),
                self.bundle.content_type(),
                self.bundle.kind().artifact_kind(),
                &ResultRecord::completed(Some(locator.clone()), Utc::now()),
            )?;
        }
        self.services
            .outcomes
            .store(request, RequestOutcome::success(Some(locator.clone())))?;
        info!(
            job_id = %descriptor.id,
            kind = %descriptor.kind,
            entity_id = %descriptor.entity_id,
            request_id = %request,
            locator = %locator,
            "bundle generated"
        );
        Ok(BundleStep::Completed { locator })
    }

    fn barrier_state(&self, request: RequestId) -> Result<Option<BarrierState>, BundleError> {
        Ok(self.services.barriers.snapshot(request)?.map(|b| b.state))
    }

    /// Whether another request for the same entity, older than ours, is still
    /// in flight. Younger duplicates run after we finish, not the other way
    /// round.
    fn older_request_active(&self, descriptor: &JobDescriptor, request: RequestId) -> Result<bool, BundleError> {
        let queue = &*self.services.queue;
        let duplicates = active_duplicates(queue, descriptor.kind, descriptor.entity_id, descriptor.id)?;
        if duplicates.iter().any(|job| job.request_id() < request) {
            return Ok(true);
        }
        if self.services.config.join_strategy == JoinStrategy::Counter {
            let active = self
                .services
                .barriers
                .active_requests(descriptor.kind, descriptor.entity_id)?;
            return Ok(active.iter().any(|other| *other < request));
        }
        Ok(false)
    }

    fn has_outstanding(&self, descriptor: &JobDescriptor, request: RequestId) -> Result<bool, BundleError> {
        let outstanding = outstanding_for(
            &*self.services.queue,
            self.bundle.nested_jobs().kinds(),
            request,
            descriptor.id,
        )?;
        if !outstanding.is_empty() {
            debug!(request_id = %request, outstanding = outstanding.len(), "dependants outstanding");
        }
        Ok(!outstanding.is_empty())
    }

    fn dispatch(
        &self,
        descriptor: &JobDescriptor,
        request: RequestId,
        options: &JobOptions,
        mut children: Vec<ChildSpec>,
    ) -> Result<(), BundleError> {
        let mut wake = options.clone().with_dependants(false);
        wake.watchdog = false;

        if self.services.config.join_strategy == JoinStrategy::Counter {
            let keys: Vec<ChildKey> = children
                .iter_mut()
                .map(|child| {
                    let key = ChildKey::new();
                    child.options.barrier_key = Some(key);
                    key
                })
                .collect();
            let target = BarrierTarget {
                kind: descriptor.kind,
                entity_id: descriptor.entity_id,
                options: wake.clone(),
            };
            let remaining = self.services.barriers.register(request, target, keys)?;
            let deadline = options
                .first_requested_at
                .and_then(|first| self.services.config.deferral.deadline_at(first));
            if let (true, Some(at)) = (remaining > 0, deadline) {
                let mut watchdog = wake;
                watchdog.watchdog = true;
                let id = self
                    .services
                    .queue
                    .schedule(descriptor.kind, descriptor.entity_id, watchdog, at)?;
                self.services.barriers.set_watchdog(request, id)?;
            }
        }

        for child in &children {
            self.services
                .queue
                .enqueue(child.kind, child.entity_id, child.options.clone())?;
        }
        info!(
            job_id = %descriptor.id,
            entity_id = %descriptor.entity_id,
            request_id = %request,
            dependants = children.len(),
            "dependants dispatched"
        );
        Ok(())
    }

    /// Re-enqueue this request for a later invocation.
    fn defer(&self, descriptor: &JobDescriptor, options: &JobOptions, with_dependants: bool) -> Result<BundleStep, BundleError> {
        let policy = &self.services.config.deferral;
        let now = Utc::now();
        if let Some(reason) = policy.exceeded(options.deferrals, options.first_requested_at, now) {
            return Err(BundleError::DeadlineExceeded(reason));
        }

        let mut next = options.clone().with_dependants(with_dependants);
        next.deferrals += 1;
        next.watchdog = false;
        let at = now + chrono::Duration::from_std(policy.requeue_delay).unwrap_or_default();
        let deferrals = next.deferrals;
        let id = self
            .services
            .queue
            .schedule(descriptor.kind, descriptor.entity_id, next, at)?;
        debug!(
            job_id = %descriptor.id,
            next_job_id = %id,
            request_id = %options.initial_request_id.map(|r| r.to_string()).unwrap_or_default(),
            deferrals,
            "bundle deferred"
        );
        Ok(BundleStep::Deferred { next: id })
    }

    /// Watchdog invocation: fail the bundle if its children are still pending.
    fn check_deadline(&self, descriptor: &JobDescriptor, request: RequestId, options: &JobOptions) -> Result<BundleStep, BundleError> {
        match self.services.barriers.snapshot(request)? {
            Some(barrier) if barrier.state == BarrierState::Pending => {
                let err = BundleError::DeadlineExceeded(format!(
                    "{} dependants still outstanding at the deadline",
                    barrier.remaining
                ));
                self.fail(descriptor, request, options, err)
            }
            _ => Ok(BundleStep::Stale),
        }
    }

    fn fail(
        &self,
        descriptor: &JobDescriptor,
        request: RequestId,
        options: &JobOptions,
        err: BundleError,
    ) -> Result<BundleStep, BundleError> {
        self.finish_barrier(request);
        if options.raise_errors {
            return Err(err);
        }

        let errors = err.messages();
        error!(
            job_id = %descriptor.id,
            kind = %descriptor.kind,
            entity_id = %descriptor.entity_id,
            request_id = %request,
            error = %err,
            "bundle generation failed"
        );
        if !options.ignore_result {
            self.services.results.write_record(
                descriptor.entity_id,
                ResultSlot::for_preview(options.preview),
                self.bundle.content_type(),
                self.bundle.kind().artifact_kind(),
                &ResultRecord::failed(errors.clone(), Utc::now()),
            )?;
        }
        self.services
            .outcomes
            .store(request, RequestOutcome::failure(errors.clone()))?;
        self.services
            .monitor
            .notify(ErrorReport::new(err.to_string(), self.report_context(descriptor, options)));
        Ok(BundleStep::Failed { errors })
    }

    /// Mark the request's barrier finished and cancel its watchdog.
    fn finish_barrier(&self, request: RequestId) {
        match self.services.barriers.finish(request) {
            Ok(Some(watchdog)) => {
                if let Err(err) = self.services.queue.cancel(watchdog) {
                    warn!(request_id = %request, watchdog_job_id = %watchdog, error = %err, "could not cancel watchdog");
                }
            }
            Ok(None) => {}
            Err(err) => warn!(request_id = %request, error = %err, "could not finish barrier"),
        }
    }

    fn report_context(&self, descriptor: &JobDescriptor, options: &JobOptions) -> serde_json::Value {
        json!({
            "job_id": descriptor.id.to_string(),
            "job_kind": descriptor.kind.as_str(),
            "entity_id": descriptor.entity_id.to_string(),
            "request_id": descriptor.request_id().to_string(),
            "job_options": options,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use lcms_curriculum::{ArtifactKind, RecordStatus};
    use lcms_infra::AdvisoryLocks;
    use lcms_infra::barriers::{BarrierStore, Completion};
    use lcms_infra::jobs::{JobQueue, WorkQueue};
    use lcms_infra::outcomes::OutcomeStore;
    use lcms_infra::{BundleConfig, DeferralPolicy};

    use crate::runtime::InMemoryRuntime;

    /// A bundle over an arbitrary list of document ids.
    struct ListBundle {
        children: Vec<EntityId>,
        fail_assembly: bool,
        assembled: Mutex<u32>,
    }

    impl ListBundle {
        fn new(children: Vec<EntityId>) -> Self {
            Self {
                children,
                fail_assembly: false,
                assembled: Mutex::new(0),
            }
        }
    }

    impl BundleJob for ListBundle {
        fn kind(&self) -> JobKind {
            JobKind::UnitBundlePdf
        }

        fn content_type(&self) -> ContentType {
            ContentType::UnitBundle
        }

        fn nested_jobs(&self) -> NestedJobSet {
            NestedJobSet::UNIT_PDF
        }

        fn generate_dependants(&self, ctx: &BundleContext<'_>) -> Result<Vec<ChildSpec>, BundleError> {
            Ok(self
                .children
                .iter()
                .map(|id| ChildSpec {
                    kind: JobKind::DocumentPdf,
                    entity_id: *id,
                    options: ctx.child_options(),
                })
                .collect())
        }

        fn generate_bundle(&self, _ctx: &BundleContext<'_>) -> Result<String, BundleError> {
            if self.fail_assembly {
                return Err(anyhow::anyhow!("merge service down").into());
            }
            *self.assembled.lock().unwrap() += 1;
            Ok("https://storage.test/bundle".to_string())
        }
    }

    fn config(join_strategy: JoinStrategy) -> BundleConfig {
        BundleConfig {
            join_strategy,
            deferral: DeferralPolicy {
                max_deferrals: Some(3),
                deadline: None,
                requeue_delay: Duration::ZERO,
            },
            ..BundleConfig::default()
        }
    }

    fn claim_bundle(runtime: &InMemoryRuntime) -> Job {
        runtime
            .queue
            .claim_next(Some(&[JobKind::UnitBundlePdf]))
            .unwrap()
            .expect("a bundle job is ready")
    }

    /// Claim, perform and settle the next ready bundle job.
    fn step(runtime: &InMemoryRuntime, orchestrator: &BundleOrchestrator<ListBundle>) -> (Job, BundleStep) {
        let mut job = claim_bundle(runtime);
        let step = orchestrator.perform(&job.descriptor).unwrap();
        job.mark_completed(Utc::now());
        runtime.queue.update(&job).unwrap();
        (job, step)
    }

    #[test]
    fn poll_mode_defers_until_children_are_gone() {
        let runtime = InMemoryRuntime::new(config(JoinStrategy::Poll));
        let child = EntityId::new();
        let orchestrator = BundleOrchestrator::new(ListBundle::new(vec![child]), runtime.services.clone());
        let unit = EntityId::new();
        runtime
            .queue
            .enqueue(JobKind::UnitBundlePdf, unit, JobOptions::new().with_dependants(true))
            .unwrap();

        let (first, first_step) = step(&runtime, &orchestrator);
        let request = first.descriptor.request_id();
        assert!(matches!(first_step, BundleStep::Deferred { .. }));
        let queued = runtime.queue.list_queued(JobKind::DocumentPdf).unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].request_id(), request);

        // The child is still queued: defer again, without re-dispatching.
        let (second, second_step) = step(&runtime, &orchestrator);
        assert!(!second.descriptor.options.with_dependants);
        assert!(matches!(second_step, BundleStep::Deferred { .. }));
        assert_eq!(runtime.queue.list_queued(JobKind::DocumentPdf).unwrap().len(), 1);
        assert_eq!(*orchestrator.bundle().assembled.lock().unwrap(), 0);

        runtime.queue.cancel(queued[0].id).unwrap();
        let (third, third_step) = step(&runtime, &orchestrator);
        assert_eq!(third.descriptor.request_id(), request);
        assert_eq!(third.descriptor.options.deferrals, 2);
        assert_eq!(
            third_step,
            BundleStep::Completed {
                locator: "https://storage.test/bundle".to_string()
            }
        );
        assert_eq!(*orchestrator.bundle().assembled.lock().unwrap(), 1);

        let record = runtime
            .services
            .results
            .record(unit, ResultSlot::Links, ContentType::UnitBundle, ArtifactKind::Pdf)
            .unwrap()
            .unwrap();
        assert_eq!(record.status, Some(RecordStatus::Completed));
        assert!(runtime.outcomes.get(request).unwrap().unwrap().ok);
    }

    #[test]
    fn counter_mode_waits_without_requeueing() {
        let runtime = InMemoryRuntime::new(config(JoinStrategy::Counter));
        let orchestrator = BundleOrchestrator::new(ListBundle::new(vec![EntityId::new()]), runtime.services.clone());
        runtime
            .queue
            .enqueue(JobKind::UnitBundlePdf, EntityId::new(), JobOptions::new().with_dependants(true))
            .unwrap();

        let job = claim_bundle(&runtime);
        assert_eq!(orchestrator.perform(&job.descriptor).unwrap(), BundleStep::Waiting { remaining: 1 });
        assert_eq!(orchestrator.perform(&job.descriptor).unwrap().job_result(), JobResult::Deferred);
        // No deadline configured: no watchdog, and nothing requeued.
        assert!(runtime.queue.list_queued(JobKind::UnitBundlePdf).unwrap().is_empty());
    }

    #[test]
    fn busy_lock_defers_instead_of_failing() {
        for strategy in [JoinStrategy::Poll, JoinStrategy::Counter] {
            let mut config = config(strategy);
            config.lock_timeout = Duration::from_millis(20);
            let runtime = InMemoryRuntime::new(config);
            let orchestrator = BundleOrchestrator::new(ListBundle::new(Vec::new()), runtime.services.clone());
            let unit = EntityId::new();
            runtime
                .queue
                .enqueue(JobKind::UnitBundlePdf, unit, JobOptions::new().with_dependants(true))
                .unwrap();

            let held = runtime
                .locks
                .acquire(&lock_name(JobKind::UnitBundlePdf), Duration::from_secs(1))
                .unwrap();
            let (first, first_step) = step(&runtime, &orchestrator);
            assert!(matches!(first_step, BundleStep::Deferred { .. }), "{strategy:?}: {first_step:?}");
            assert!(runtime.monitor.is_empty());
            assert!(runtime.outcomes.get(first.descriptor.request_id()).unwrap().is_none());
            drop(held);

            let (second, second_step) = step(&runtime, &orchestrator);
            assert_eq!(second.descriptor.request_id(), first.descriptor.request_id());
            assert!(second.descriptor.options.with_dependants);
            assert_eq!(second.descriptor.options.deferrals, 1);
            assert!(matches!(second_step, BundleStep::Completed { .. }), "{strategy:?}: {second_step:?}");
        }
    }

    #[test]
    fn busy_lock_still_counts_against_the_budget() {
        let mut config = config(JoinStrategy::Counter);
        config.lock_timeout = Duration::from_millis(5);
        let runtime = InMemoryRuntime::new(config);
        let orchestrator = BundleOrchestrator::new(ListBundle::new(Vec::new()), runtime.services.clone());
        runtime
            .queue
            .enqueue(JobKind::UnitBundlePdf, EntityId::new(), JobOptions::new().with_dependants(true))
            .unwrap();

        let _held = runtime
            .locks
            .acquire(&lock_name(JobKind::UnitBundlePdf), Duration::from_secs(1))
            .unwrap();
        let steps: Vec<BundleStep> = (0..4).map(|_| step(&runtime, &orchestrator).1).collect();
        assert!(steps[..3].iter().all(|s| matches!(s, BundleStep::Deferred { .. })));
        assert!(matches!(&steps[3], BundleStep::Failed { errors } if errors[0].contains("gave up after 3 deferrals")));
    }

    #[test]
    fn duplicate_children_are_awaited_separately() {
        let runtime = InMemoryRuntime::new(config(JoinStrategy::Counter));
        let lesson = EntityId::new();
        let orchestrator = BundleOrchestrator::new(ListBundle::new(vec![lesson, lesson]), runtime.services.clone());
        runtime
            .queue
            .enqueue(JobKind::UnitBundlePdf, EntityId::new(), JobOptions::new().with_dependants(true))
            .unwrap();

        let (bundle, first_step) = step(&runtime, &orchestrator);
        assert_eq!(first_step, BundleStep::Waiting { remaining: 2 });
        let request = bundle.descriptor.request_id();
        let children = runtime.queue.list_queued(JobKind::DocumentPdf).unwrap();
        assert_eq!(children.len(), 2);
        let keys: Vec<ChildKey> = children.iter().filter_map(|c| c.options.barrier_key).collect();
        assert_eq!(keys.len(), 2);
        assert_ne!(keys[0], keys[1]);

        let barriers = &runtime.services.barriers;
        assert_eq!(barriers.complete(request, keys[0]).unwrap(), Completion::Remaining(1));
        assert_eq!(barriers.complete(request, keys[0]).unwrap(), Completion::Remaining(1));
        assert!(matches!(barriers.complete(request, keys[1]).unwrap(), Completion::Released(_)));
    }

    #[test]
    fn bundle_without_children_assembles_immediately() {
        for strategy in [JoinStrategy::Poll, JoinStrategy::Counter] {
            let runtime = InMemoryRuntime::new(config(strategy));
            let orchestrator = BundleOrchestrator::new(ListBundle::new(Vec::new()), runtime.services.clone());
            runtime
                .queue
                .enqueue(JobKind::UnitBundlePdf, EntityId::new(), JobOptions::new().with_dependants(true))
                .unwrap();

            assert!(matches!(step(&runtime, &orchestrator).1, BundleStep::Completed { .. }));
        }
    }

    #[test]
    fn exceeding_the_deferral_budget_fails_the_bundle() {
        let runtime = InMemoryRuntime::new(config(JoinStrategy::Poll));
        let orchestrator = BundleOrchestrator::new(ListBundle::new(vec![EntityId::new()]), runtime.services.clone());
        let unit = EntityId::new();
        runtime
            .queue
            .enqueue(JobKind::UnitBundlePdf, unit, JobOptions::new().with_dependants(true))
            .unwrap();

        let steps: Vec<BundleStep> = (0..4).map(|_| step(&runtime, &orchestrator).1).collect();
        assert!(steps[..3].iter().all(|s| matches!(s, BundleStep::Deferred { .. })));
        let BundleStep::Failed { errors } = &steps[3] else {
            panic!("expected failure, got {:?}", steps[3]);
        };
        assert!(errors[0].contains("gave up after 3 deferrals"));
        assert!(runtime.queue.claim_next(Some(&[JobKind::UnitBundlePdf])).unwrap().is_none());

        let record = runtime
            .services
            .results
            .record(unit, ResultSlot::Links, ContentType::UnitBundle, ArtifactKind::Pdf)
            .unwrap()
            .unwrap();
        assert!(record.is_failed());
        assert_eq!(runtime.monitor.len(), 1);
    }

    #[test]
    fn raised_errors_are_recorded_by_the_handler() {
        let runtime = InMemoryRuntime::new(config(JoinStrategy::Poll));
        let mut bundle = ListBundle::new(Vec::new());
        bundle.fail_assembly = true;
        let orchestrator = BundleOrchestrator::new(bundle, runtime.services.clone());
        let unit = EntityId::new();
        runtime
            .queue
            .enqueue(
                JobKind::UnitBundlePdf,
                unit,
                JobOptions::new().with_dependants(true).raising_errors(),
            )
            .unwrap();

        let job = claim_bundle(&runtime);
        assert!(matches!(orchestrator.handle(&job), JobResult::Failure(_)));

        let outcome = runtime.outcomes.get(job.descriptor.request_id()).unwrap().unwrap();
        assert!(!outcome.ok);
        assert_eq!(outcome.errors, vec!["merge service down".to_string()]);
        assert_eq!(runtime.monitor.len(), 1);
        // Raised errors skip the result map.
        assert!(runtime
            .services
            .results
            .record(unit, ResultSlot::Links, ContentType::UnitBundle, ArtifactKind::Pdf)
            .unwrap()
            .is_none());
    }

    #[test]
    fn wrong_kind_is_rejected() {
        let runtime = InMemoryRuntime::new(config(JoinStrategy::Poll));
        let orchestrator = BundleOrchestrator::new(ListBundle::new(Vec::new()), runtime.services.clone());
        let job = Job::new(JobKind::UnitBundleGdoc, EntityId::new(), JobOptions::new());
        assert!(matches!(
            orchestrator.perform(&job.descriptor),
            Err(BundleError::UnexpectedKind(JobKind::UnitBundleGdoc))
        ));
    }

    #[test]
    fn lock_names_follow_the_bundle_kind() {
        assert_eq!(lock_name(JobKind::UnitBundlePdf), "bundle_generation_unit_bundle_pdf");
    }
}
