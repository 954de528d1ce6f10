//! Starting bundle requests and polling their status.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use lcms_core::EntityId;
use lcms_infra::JoinStrategy;
use lcms_infra::jobs::dedup::find_active_request;
use lcms_infra::jobs::{JobId, JobKind, JobOptions, RequestId};
use lcms_infra::outcomes::RequestOutcome;

use crate::error::BundleError;
use crate::orchestrator::lock_name;
use crate::services::BundleServices;

/// A request started (or joined) for one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggeredRequest {
    pub entity_id: EntityId,
    pub request: RequestId,
    /// An in-flight request for the unit was joined instead of starting one.
    pub reused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RequestStatus {
    Waiting,
    Completed { link: Option<String> },
    Failed { errors: Vec<String> },
}

/// What one retention sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub jobs: usize,
    pub barriers: usize,
    pub outcomes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestReport {
    pub request: RequestId,
    #[serde(flatten)]
    pub status: RequestStatus,
    pub dependants: Vec<(JobId, RequestOutcome)>,
}

/// Entry point for callers that want bundles generated.
#[derive(Debug, Clone)]
pub struct BundleTrigger {
    services: BundleServices,
}

impl BundleTrigger {
    pub fn new(services: BundleServices) -> Self {
        Self { services }
    }

    /// Request a `kind` bundle for each unit.
    pub fn request(&self, kind: JobKind, units: &[EntityId]) -> Result<Vec<TriggeredRequest>, BundleError> {
        self.request_with(kind, units, JobOptions::new())
    }

    /// Like [`request`](Self::request), with extra options (preview) applied
    /// to new requests.
    ///
    /// Runs under the bundle-type lock, so a unit with an active request is
    /// joined rather than started twice.
    pub fn request_with(
        &self,
        kind: JobKind,
        units: &[EntityId],
        options: JobOptions,
    ) -> Result<Vec<TriggeredRequest>, BundleError> {
        if !kind.is_bundle() {
            return Err(BundleError::UnexpectedKind(kind));
        }
        let _guard = self
            .services
            .locks
            .acquire(&lock_name(kind), self.services.config.lock_timeout)?;

        let mut triggered = Vec::with_capacity(units.len());
        for &entity_id in units {
            if let Some(request) = self.active_request(kind, entity_id)? {
                triggered.push(TriggeredRequest {
                    entity_id,
                    request,
                    reused: true,
                });
                continue;
            }

            let mut job_options = options.clone().with_dependants(true);
            job_options.first_requested_at = Some(Utc::now());
            let job_id = self.services.queue.enqueue(kind, entity_id, job_options)?;
            info!(kind = %kind, entity_id = %entity_id, request_id = %job_id, "bundle requested");
            triggered.push(TriggeredRequest {
                entity_id,
                request: RequestId::from(job_id),
                reused: false,
            });
        }
        Ok(triggered)
    }

    fn active_request(&self, kind: JobKind, entity_id: EntityId) -> Result<Option<RequestId>, BundleError> {
        if let Some(request) = find_active_request(&*self.services.queue, kind, entity_id)? {
            return Ok(Some(request));
        }
        // A request waiting on its barrier has no job in the queue.
        if self.services.config.join_strategy == JoinStrategy::Counter {
            let active = self.services.barriers.active_requests(kind, entity_id)?;
            return Ok(active.first().copied());
        }
        Ok(None)
    }

    /// Current state of each request.
    pub fn status(&self, requests: &[RequestId]) -> Result<Vec<RequestReport>, BundleError> {
        requests
            .iter()
            .map(|&request| {
                let status = match self.services.outcomes.get(request)? {
                    None => RequestStatus::Waiting,
                    Some(outcome) if outcome.ok => RequestStatus::Completed { link: outcome.link },
                    Some(outcome) => RequestStatus::Failed {
                        errors: outcome.errors,
                    },
                };
                Ok(RequestReport {
                    request,
                    status,
                    dependants: self.services.outcomes.dependants(request)?,
                })
            })
            .collect()
    }

    /// Forget finished jobs, barriers and outcomes older than the configured
    /// retention. Meant to be run periodically.
    pub fn prune(&self) -> Result<PruneReport, BundleError> {
        let before = chrono::Duration::from_std(self.services.config.retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.prune_before(before)
    }

    pub fn prune_before(&self, before: DateTime<Utc>) -> Result<PruneReport, BundleError> {
        let report = PruneReport {
            jobs: self.services.queue.purge_finished(before)?,
            barriers: self.services.barriers.prune(before)?,
            outcomes: self.services.outcomes.prune(before)?,
        };
        info!(
            jobs = report.jobs,
            barriers = report.barriers,
            outcomes = report.outcomes,
            before = %before,
            "finished requests pruned"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lcms_infra::BundleConfig;
    use lcms_infra::jobs::JobQueue;
    use lcms_infra::outcomes::OutcomeStore;

    use crate::runtime::InMemoryRuntime;

    #[test]
    fn second_request_joins_the_first() {
        let runtime = InMemoryRuntime::new(BundleConfig::default());
        let trigger = runtime.trigger();
        let unit = EntityId::new();

        let first = trigger.request(JobKind::UnitBundlePdf, &[unit]).unwrap();
        let second = trigger.request(JobKind::UnitBundlePdf, &[unit]).unwrap();

        assert!(!first[0].reused);
        assert!(second[0].reused);
        assert_eq!(first[0].request, second[0].request);
        assert_eq!(runtime.queue.list_queued(JobKind::UnitBundlePdf).unwrap().len(), 1);
        // Different bundle kinds do not share requests.
        let gdoc = trigger.request(JobKind::UnitBundleGdoc, &[unit]).unwrap();
        assert!(!gdoc[0].reused);
    }

    #[test]
    fn new_requests_start_with_dependants() {
        let runtime = InMemoryRuntime::new(BundleConfig::default());
        let unit = EntityId::new();
        runtime
            .trigger()
            .request_with(JobKind::UnitBundlePdf, &[unit], JobOptions::new().with_preview(true))
            .unwrap();

        let queued = runtime.queue.list_queued(JobKind::UnitBundlePdf).unwrap();
        assert!(queued[0].options.with_dependants);
        assert!(queued[0].options.preview);
        assert!(queued[0].options.first_requested_at.is_some());
    }

    #[test]
    fn child_kinds_cannot_be_triggered() {
        let runtime = InMemoryRuntime::new(BundleConfig::default());
        assert!(matches!(
            runtime.trigger().request(JobKind::DocumentPdf, &[EntityId::new()]),
            Err(BundleError::UnexpectedKind(JobKind::DocumentPdf))
        ));
    }

    #[test]
    fn status_reflects_outcomes() {
        let runtime = InMemoryRuntime::new(BundleConfig::default());
        let trigger = runtime.trigger();
        let waiting = RequestId::new();
        let done = RequestId::new();
        let failed = RequestId::new();
        runtime
            .outcomes
            .store(done, RequestOutcome::success(Some("https://storage.test/b".to_string())))
            .unwrap();
        runtime
            .outcomes
            .store(failed, RequestOutcome::failure(vec!["no lessons".to_string()]))
            .unwrap();
        runtime
            .outcomes
            .store_dependant(done, JobId::new(), RequestOutcome::success(None))
            .unwrap();

        let reports = trigger.status(&[waiting, done, failed]).unwrap();
        assert_eq!(reports[0].status, RequestStatus::Waiting);
        assert_eq!(
            reports[1].status,
            RequestStatus::Completed {
                link: Some("https://storage.test/b".to_string())
            }
        );
        assert_eq!(reports[1].dependants.len(), 1);
        assert_eq!(
            reports[2].status,
            RequestStatus::Failed {
                errors: vec!["no lessons".to_string()]
            }
        );
    }

    #[test]
    fn prune_respects_retention() {
        let runtime = InMemoryRuntime::new(InMemoryRuntime::immediate_config());
        let unit = EntityId::new();
        let trigger = runtime.trigger();
        let request = trigger.request(JobKind::UnitBundlePdf, &[unit]).unwrap()[0].request;
        runtime.queue.cancel(JobId::from_uuid(*request.as_uuid())).unwrap();
        runtime.outcomes.store(request, RequestOutcome::success(None)).unwrap();

        // Default retention is a day: nothing is old enough yet.
        assert_eq!(trigger.prune().unwrap(), PruneReport::default());

        let report = trigger.prune_before(Utc::now() + chrono::Duration::seconds(1)).unwrap();
        assert_eq!(report.jobs, 1);
        assert_eq!(report.outcomes, 1);
        assert_eq!(trigger.status(&[request]).unwrap()[0].status, RequestStatus::Waiting);
        // The unit can be requested afresh.
        assert!(!trigger.request(JobKind::UnitBundlePdf, &[unit]).unwrap()[0].reused);
    }
}
