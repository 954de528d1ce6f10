//! Handler registration and worker startup.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use lcms_infra::barriers::InMemoryBarriers;
use lcms_infra::external::{InMemoryCurriculum, InMemoryStorage, StaticRenderer};
use lcms_infra::jobs::{InMemoryJobQueue, JobExecutor, JobExecutorHandle, JobKind, WorkQueue};
use lcms_infra::outcomes::InMemoryOutcomeStore;
use lcms_infra::{BundleConfig, InMemoryLocks, InMemoryResultBackend, ResultStore};
use lcms_observability::RecordingMonitor;

use crate::child::ChildArtifactJob;
use crate::orchestrator::BundleOrchestrator;
use crate::services::BundleServices;
use crate::trigger::BundleTrigger;
use crate::unit_gdoc::UnitGdocBundle;
use crate::unit_pdf::UnitPdfBundle;

/// Register a handler for every job kind the bundle pipeline enqueues.
pub fn register_handlers<Q: WorkQueue + 'static>(executor: &mut JobExecutor<Q>, services: &BundleServices) {
    let child = Arc::new(ChildArtifactJob::new(services.clone()));
    for kind in ChildArtifactJob::KINDS {
        let child = child.clone();
        executor.register_handler(kind, move |job| child.handle(job));
    }

    let pdf = BundleOrchestrator::new(UnitPdfBundle, services.clone());
    executor.register_handler(JobKind::UnitBundlePdf, move |job| pdf.handle(job));

    let gdoc = BundleOrchestrator::new(UnitGdocBundle, services.clone());
    executor.register_handler(JobKind::UnitBundleGdoc, move |job| gdoc.handle(job));
}

/// Start `config.workers` executor threads over `queue`.
pub fn spawn_workers<Q>(queue: Q, services: &BundleServices) -> std::io::Result<Vec<JobExecutorHandle>>
where
    Q: WorkQueue + Clone + Send + 'static,
{
    let mut executor = JobExecutor::new(queue);
    register_handlers(&mut executor, services);
    let config = &services.config;
    info!(workers = config.workers, join_strategy = ?config.join_strategy, "starting bundle workers");
    executor.spawn_pool(config.executor_config(), config.workers)
}

/// Fully in-memory wiring for tests/dev.
///
/// Keeps the concrete adapters next to the type-erased [`BundleServices`], so
/// callers can inject failures and inspect state.
pub struct InMemoryRuntime {
    pub queue: Arc<InMemoryJobQueue>,
    pub locks: InMemoryLocks,
    pub outcomes: Arc<InMemoryOutcomeStore>,
    pub barriers: Arc<InMemoryBarriers>,
    pub curriculum: Arc<InMemoryCurriculum>,
    pub renderer: Arc<StaticRenderer>,
    pub storage: Arc<InMemoryStorage>,
    pub monitor: Arc<RecordingMonitor>,
    pub services: BundleServices,
}

impl InMemoryRuntime {
    pub fn new(config: BundleConfig) -> Self {
        let queue = Arc::new(InMemoryJobQueue::with_policies(config.retry_policies()));
        let locks = InMemoryLocks::new();
        let outcomes = Arc::new(InMemoryOutcomeStore::new());
        let barriers = Arc::new(InMemoryBarriers::new());
        let curriculum = Arc::new(InMemoryCurriculum::new());
        let renderer = Arc::new(StaticRenderer::new());
        let storage = Arc::new(InMemoryStorage::default());
        let monitor = Arc::new(RecordingMonitor::new());

        let services = BundleServices {
            queue: queue.clone(),
            locks: Arc::new(locks.clone()),
            results: ResultStore::new(
                Arc::new(InMemoryResultBackend::new()),
                Arc::new(locks.clone()),
                config.lock_timeout,
            ),
            outcomes: outcomes.clone(),
            barriers: barriers.clone(),
            curriculum: curriculum.clone(),
            render: renderer.clone(),
            storage: storage.clone(),
            monitor: monitor.clone(),
            config,
        };

        Self {
            queue,
            locks,
            outcomes,
            barriers,
            curriculum,
            renderer,
            storage,
            monitor,
            services,
        }
    }

    /// An executor over the in-memory queue with every handler registered.
    pub fn executor(&self) -> JobExecutor<Arc<InMemoryJobQueue>> {
        let mut executor = JobExecutor::new(self.queue.clone());
        register_handlers(&mut executor, &self.services);
        executor
    }

    pub fn trigger(&self) -> BundleTrigger {
        BundleTrigger::new(self.services.clone())
    }

    pub fn spawn_workers(&self) -> std::io::Result<Vec<JobExecutorHandle>> {
        spawn_workers(self.queue.clone(), &self.services)
    }

    /// Config with no delays, for driving the queue synchronously.
    pub fn immediate_config() -> BundleConfig {
        let mut config = BundleConfig::default();
        config.deferral.requeue_delay = Duration::ZERO;
        config.child_retry_delay = Duration::ZERO;
        config.lock_timeout = Duration::from_secs(2);
        config
    }
}
