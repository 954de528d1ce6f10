//! Dependencies shared by every bundle handler.

use std::sync::Arc;

use lcms_infra::barriers::BarrierStore;
use lcms_infra::external::{CurriculumRepository, RenderService, StorageService};
use lcms_infra::jobs::JobQueue;
use lcms_infra::outcomes::OutcomeStore;
use lcms_infra::{AdvisoryLocks, BundleConfig, ResultStore};
use lcms_observability::Monitor;

/// Injected ports. Cloning is cheap; every field is shared.
#[derive(Clone)]
pub struct BundleServices {
    pub queue: Arc<dyn JobQueue>,
    pub locks: Arc<dyn AdvisoryLocks>,
    pub results: ResultStore,
    pub outcomes: Arc<dyn OutcomeStore>,
    pub barriers: Arc<dyn BarrierStore>,
    pub curriculum: Arc<dyn CurriculumRepository>,
    pub render: Arc<dyn RenderService>,
    pub storage: Arc<dyn StorageService>,
    pub monitor: Arc<dyn Monitor>,
    pub config: BundleConfig,
}

impl std::fmt::Debug for BundleServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleServices")
            .field("results", &self.results)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
