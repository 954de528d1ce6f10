//! Child artifact jobs: one document or material exported as a PDF or a
//! Google Doc.
//!
//! A child renders, uploads, and merges its record into the entity's result
//! map. Failures are recorded and handed back to the queue, whose retry
//! policy decides whether the child runs again. Once a child is settled
//! (success, or failure on its last attempt) it reports to its request and
//! counts down the request's barrier; the child that empties the barrier
//! wakes the bundle.

use anyhow::{Context, anyhow};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, error, info, warn};

use lcms_core::Entity;
use lcms_curriculum::{ContentType, PAGES_NOT_COMPUTED, ResultRecord, ResultSlot};
use lcms_infra::barriers::Completion;
use lcms_infra::external::{ExportRequest, ExportTarget};
use lcms_infra::jobs::{Job, JobDescriptor, JobKind, JobOptions, JobResult};
use lcms_infra::outcomes::RequestOutcome;
use lcms_observability::ErrorReport;

use crate::error::ChildJobError;
use crate::services::BundleServices;

/// Content type used when a child is run on its own.
const DEFAULT_CONTENT_TYPE: ContentType = ContentType::Full;

pub struct ChildArtifactJob {
    services: BundleServices,
}

impl ChildArtifactJob {
    pub const KINDS: [JobKind; 4] = [
        JobKind::DocumentPdf,
        JobKind::MaterialPdf,
        JobKind::DocumentGdoc,
        JobKind::MaterialGdoc,
    ];

    pub fn new(services: BundleServices) -> Self {
        Self { services }
    }

    /// Queue handler entry point.
    pub fn handle(&self, job: &Job) -> JobResult {
        let descriptor = &job.descriptor;
        match self.perform(descriptor) {
            Ok(record) => match self.settle(descriptor, RequestOutcome::success(record.url)) {
                Ok(()) => JobResult::Success,
                Err(err) => {
                    warn!(job_id = %descriptor.id, error = %err, "could not report settled child");
                    JobResult::Failure(err.message())
                }
            },
            Err(err) => {
                self.record_failure(job, &err);
                JobResult::Failure(err.message())
            }
        }
    }

    /// Render, upload and record one artifact.
    pub fn perform(&self, descriptor: &JobDescriptor) -> Result<ResultRecord, ChildJobError> {
        let options = &descriptor.options;
        let content_type = options.content_type.unwrap_or(DEFAULT_CONTENT_TYPE);
        let curriculum = &self.services.curriculum;

        let record = match descriptor.kind {
            JobKind::DocumentPdf => {
                let document = curriculum.document(descriptor.entity_id)?;
                let target = ExportTarget::Document(&document);
                self.export_pdf(target, options, content_type, "documents", &document.pdf_filename())?
                    .0
            }
            JobKind::MaterialPdf => {
                let material = curriculum.material(descriptor.entity_id)?;
                let target = ExportTarget::Material(&material);
                let (record, pdf) =
                    self.export_pdf(target, options, content_type, "materials", &material.pdf_filename())?;
                let thumb = self
                    .services
                    .render
                    .thumbnail(&pdf)
                    .with_context(|| format!("thumbnailing {}", material.display_name()))?;
                let key = self.key(options, "materials", &material.thumb_filename());
                let thumb_url = self
                    .services
                    .storage
                    .upload(&key, &thumb, "image/jpeg")
                    .with_context(|| format!("uploading {key}"))?;
                record.with_thumb(thumb_url)
            }
            JobKind::DocumentGdoc => {
                let document = curriculum.document(descriptor.entity_id)?;
                self.export_gdoc(ExportTarget::Document(&document), options, content_type)?
            }
            JobKind::MaterialGdoc => {
                let material = curriculum.material(descriptor.entity_id)?;
                self.export_gdoc(ExportTarget::Material(&material), options, content_type)?
            }
            other => return Err(ChildJobError::NotAChild(other)),
        };

        self.services.results.write_record(
            descriptor.entity_id,
            ResultSlot::for_preview(options.preview),
            content_type,
            descriptor.kind.artifact_kind(),
            &record,
        )?;
        info!(
            job_id = %descriptor.id,
            kind = %descriptor.kind,
            entity_id = %descriptor.entity_id,
            content_type = %content_type,
            preview = options.preview,
            "artifact generated"
        );
        Ok(record)
    }

    fn export_pdf(
        &self,
        target: ExportTarget<'_>,
        options: &JobOptions,
        content_type: ContentType,
        subdir: &str,
        filename: &str,
    ) -> Result<(ResultRecord, Vec<u8>), ChildJobError> {
        let request = ExportRequest {
            target,
            content_type,
            preview: options.preview,
            folder_id: options.folder_id.as_deref(),
        };
        let pdf = self.services.render.export_pdf(&request)?;
        let key = self.key(options, subdir, filename);
        let url = self
            .services
            .storage
            .upload(&key, &pdf.bytes, "application/pdf")
            .with_context(|| format!("uploading {key}"))?;
        // Previews skip page counting; an unknown count is recorded as 0.
        let pages = if options.preview {
            PAGES_NOT_COMPUTED
        } else {
            pdf.pages.map(i64::from).unwrap_or(0)
        };
        Ok((ResultRecord::generated(url, pages, Utc::now()), pdf.bytes))
    }

    fn export_gdoc(
        &self,
        target: ExportTarget<'_>,
        options: &JobOptions,
        content_type: ContentType,
    ) -> Result<ResultRecord, ChildJobError> {
        let request = ExportRequest {
            target,
            content_type,
            preview: options.preview,
            folder_id: options.folder_id.as_deref(),
        };
        let doc = self.services.render.export_gdoc(&request)?;
        Ok(ResultRecord::generated(doc.url, PAGES_NOT_COMPUTED, Utc::now()))
    }

    fn key(&self, options: &JobOptions, subdir: &str, filename: &str) -> String {
        let base = options
            .folder
            .as_deref()
            .unwrap_or(&self.services.config.bundle_root)
            .trim_end_matches('/');
        format!("{base}/{subdir}/{filename}")
    }

    fn record_failure(&self, job: &Job, err: &ChildJobError) {
        let descriptor = &job.descriptor;
        let options = &descriptor.options;
        let final_attempt = job.is_final_attempt();
        let label = self.label(descriptor);
        let message = err.message();
        warn!(
            job_id = %descriptor.id,
            kind = %descriptor.kind,
            entity_id = %descriptor.entity_id,
            attempt = job.attempt,
            final_attempt,
            error = %message,
            "artifact generation failed"
        );

        // Any partial link goes away with the failure entry.
        if !options.preview {
            let record = ResultRecord::failed(vec![label.clone(), message.clone()], Utc::now());
            if let Err(write_err) = self.services.results.write_record(
                descriptor.entity_id,
                ResultSlot::Links,
                options.content_type.unwrap_or(DEFAULT_CONTENT_TYPE),
                descriptor.kind.artifact_kind(),
                &record,
            ) {
                error!(job_id = %descriptor.id, error = %write_err, "could not record artifact failure");
            }
        }

        self.services.monitor.notify(ErrorReport::new(
            format!("{label}: {message}"),
            json!({
                "job_id": descriptor.id.to_string(),
                "job_kind": descriptor.kind.as_str(),
                "entity_id": descriptor.entity_id.to_string(),
                "request_id": descriptor.request_id().to_string(),
                "attempt": job.attempt,
                "final_attempt": final_attempt,
                "job_options": options,
            }),
        ));

        if final_attempt {
            if let Err(settle_err) = self.settle(descriptor, RequestOutcome::failure(vec![label, message])) {
                error!(job_id = %descriptor.id, error = %settle_err, "could not report failed child");
            }
        }
    }

    /// Report a settled child to its request and count down the barrier.
    fn settle(&self, descriptor: &JobDescriptor, outcome: RequestOutcome) -> Result<(), ChildJobError> {
        let Some(request) = descriptor.options.initial_request_id else {
            return Ok(());
        };
        self.services.outcomes.store_dependant(request, descriptor.id, outcome)?;

        let Some(key) = descriptor.options.barrier_key else {
            return Ok(());
        };
        match self.services.barriers.complete(request, key)? {
            Completion::Released(target) => {
                let wake = self
                    .services
                    .queue
                    .enqueue(target.kind, target.entity_id, target.options)?;
                info!(
                    request_id = %request,
                    kind = %target.kind,
                    entity_id = %target.entity_id,
                    wake_job_id = %wake,
                    "last dependant settled, bundle woken"
                );
            }
            Completion::Remaining(remaining) => {
                debug!(request_id = %request, remaining, "dependant settled");
            }
            Completion::Untracked | Completion::AlreadyReleased => {}
        }
        Ok(())
    }

    fn label(&self, descriptor: &JobDescriptor) -> String {
        let curriculum = &self.services.curriculum;
        let name = match descriptor.kind {
            JobKind::DocumentPdf | JobKind::DocumentGdoc => curriculum
                .document(descriptor.entity_id)
                .map(|d| d.display_name().to_string()),
            JobKind::MaterialPdf | JobKind::MaterialGdoc => curriculum
                .material(descriptor.entity_id)
                .map(|m| m.display_name().to_string()),
            other => Err(anyhow!("{other} has no display name")),
        };
        name.unwrap_or_else(|_| descriptor.entity_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use lcms_core::EntityId;
    use lcms_curriculum::{ArtifactKind, Document, Material, RecordStatus};
    use lcms_infra::BundleConfig;
    use lcms_infra::barriers::{BarrierStore, BarrierTarget, ChildKey};
    use lcms_infra::external::StorageService;
    use lcms_infra::jobs::{JobQueue, RequestId, RetryPolicy};
    use lcms_infra::outcomes::OutcomeStore;

    use crate::runtime::InMemoryRuntime;

    fn runtime() -> InMemoryRuntime {
        InMemoryRuntime::new(BundleConfig::default())
    }

    fn lesson(runtime: &InMemoryRuntime, name: &str) -> Document {
        let doc = Document::new(EntityId::new(), name).with_breadcrumb(["ELA", "G2", name]);
        runtime.curriculum.insert_document(doc.clone());
        doc
    }

    fn claimed(kind: JobKind, entity_id: EntityId, options: JobOptions, attempts: u32) -> Job {
        let mut job = Job::new(kind, entity_id, options).with_retry_policy(RetryPolicy::fixed(attempts, Duration::ZERO));
        job.mark_running();
        job
    }

    #[test]
    fn document_pdf_is_uploaded_and_recorded() {
        let runtime = runtime();
        let doc = lesson(&runtime, "Lesson 1");
        let child = ChildArtifactJob::new(runtime.services.clone());
        let options = JobOptions::new().with_content_type(ContentType::UnitBundle);

        let job = claimed(JobKind::DocumentPdf, *doc.id(), options, 3);
        assert_eq!(child.handle(&job), JobResult::Success);

        let record = runtime
            .services
            .results
            .record(*doc.id(), ResultSlot::Links, ContentType::UnitBundle, ArtifactKind::Pdf)
            .unwrap()
            .unwrap();
        assert_eq!(record.pages, Some(3));
        let expected_key = format!("bundles/documents/{}", doc.pdf_filename());
        assert_eq!(record.url.as_deref(), Some(runtime.storage.url_for(&expected_key).as_str()));
    }

    #[test]
    fn material_pdf_gets_a_thumbnail() {
        let runtime = runtime();
        let material = Material::new(EntityId::new(), "m-7", "Exit ticket");
        runtime.curriculum.insert_material(material.clone());
        let child = ChildArtifactJob::new(runtime.services.clone());

        let job = claimed(JobKind::MaterialPdf, *material.id(), JobOptions::new().with_folder("staging/u1"), 3);
        assert_eq!(child.handle(&job), JobResult::Success);

        let thumb_key = format!("staging/u1/materials/{}", material.thumb_filename());
        assert_eq!(runtime.storage.object(&thumb_key).unwrap().content_type, "image/jpeg");
        let record = runtime
            .services
            .results
            .record(*material.id(), ResultSlot::Links, ContentType::Full, ArtifactKind::Pdf)
            .unwrap()
            .unwrap();
        assert_eq!(record.thumb_url, Some(runtime.storage.url_for(&thumb_key)));
    }

    #[test]
    fn preview_goes_to_the_preview_slot_without_page_count() {
        let runtime = runtime();
        let doc = lesson(&runtime, "Lesson 2");
        let child = ChildArtifactJob::new(runtime.services.clone());

        let job = claimed(JobKind::DocumentPdf, *doc.id(), JobOptions::new().with_preview(true), 3);
        assert_eq!(child.handle(&job), JobResult::Success);

        let results = &runtime.services.results;
        let record = results
            .record(*doc.id(), ResultSlot::PreviewLinks, ContentType::Full, ArtifactKind::Pdf)
            .unwrap()
            .unwrap();
        assert_eq!(record.pages, Some(PAGES_NOT_COMPUTED));
        assert!(results.record(*doc.id(), ResultSlot::Links, ContentType::Full, ArtifactKind::Pdf).unwrap().is_none());
    }

    #[test]
    fn preview_failures_are_not_recorded() {
        let runtime = runtime();
        let doc = lesson(&runtime, "Lesson 3");
        runtime.renderer.fail_always(*doc.id());
        let child = ChildArtifactJob::new(runtime.services.clone());

        let job = claimed(JobKind::DocumentPdf, *doc.id(), JobOptions::new().with_preview(true), 1);
        assert!(matches!(child.handle(&job), JobResult::Failure(_)));

        let results = &runtime.services.results;
        for slot in [ResultSlot::Links, ResultSlot::PreviewLinks] {
            assert!(results.record(*doc.id(), slot, ContentType::Full, ArtifactKind::Pdf).unwrap().is_none());
        }
    }

    #[test]
    fn failure_replaces_the_link_and_is_retried() {
        let runtime = runtime();
        let doc = lesson(&runtime, "Lesson 4");
        let child = ChildArtifactJob::new(runtime.services.clone());
        let request = RequestId::new();
        let options = JobOptions::new()
            .with_request(request)
            .with_content_type(ContentType::UnitBundle);

        let ok = claimed(JobKind::DocumentPdf, *doc.id(), options.clone(), 3);
        assert_eq!(child.handle(&ok), JobResult::Success);

        runtime.renderer.fail_always(*doc.id());
        let failing = claimed(JobKind::DocumentPdf, *doc.id(), options, 3);
        let JobResult::Failure(message) = child.handle(&failing) else {
            panic!("expected a failure");
        };
        assert!(message.contains("render service unavailable"));

        let record = runtime
            .services
            .results
            .record(*doc.id(), ResultSlot::Links, ContentType::UnitBundle, ArtifactKind::Pdf)
            .unwrap()
            .unwrap();
        assert_eq!(record.status, Some(RecordStatus::Failed));
        assert_eq!(record.url, None);
        assert_eq!(record.errors[0], "Lesson 4");
        assert_eq!(runtime.monitor.len(), 1);
        // Not the last attempt: only the earlier success is reported.
        let dependants = runtime.outcomes.dependants(request).unwrap();
        assert_eq!(dependants.len(), 1);
        assert!(dependants[0].1.ok);
    }

    #[test]
    fn final_failure_is_reported_to_the_request() {
        let runtime = runtime();
        let doc = lesson(&runtime, "Lesson 5");
        runtime.renderer.fail_always(*doc.id());
        let child = ChildArtifactJob::new(runtime.services.clone());
        let request = RequestId::new();

        let job = claimed(JobKind::DocumentGdoc, *doc.id(), JobOptions::new().with_request(request), 1);
        assert!(matches!(child.handle(&job), JobResult::Failure(_)));

        let dependants = runtime.outcomes.dependants(request).unwrap();
        assert_eq!(dependants.len(), 1);
        assert!(!dependants[0].1.ok);
        assert_eq!(dependants[0].1.errors[0], "Lesson 5");
        let report = &runtime.monitor.reports()[0];
        assert_eq!(report.context["final_attempt"], true);
        assert_eq!(report.context["request_id"], request.to_string());
    }

    #[test]
    fn last_settled_child_wakes_the_bundle_once() {
        let runtime = runtime();
        let a = lesson(&runtime, "A");
        let b = lesson(&runtime, "B");
        runtime.renderer.fail_always(*b.id());
        let child = ChildArtifactJob::new(runtime.services.clone());
        let request = RequestId::new();
        let unit = EntityId::new();
        let target = BarrierTarget {
            kind: JobKind::UnitBundlePdf,
            entity_id: unit,
            options: JobOptions::new().with_request(request),
        };
        let (key_a, key_b) = (ChildKey::new(), ChildKey::new());
        runtime.barriers.register(request, target, vec![key_a, key_b]).unwrap();
        let options = JobOptions::new().with_request(request);
        let options_a = options.clone().with_barrier_key(key_a);

        child.handle(&claimed(JobKind::DocumentPdf, *a.id(), options_a.clone(), 1));
        assert!(runtime.queue.list_queued(JobKind::UnitBundlePdf).unwrap().is_empty());

        // A terminal failure settles the child too.
        let options_b = options.with_barrier_key(key_b);
        child.handle(&claimed(JobKind::DocumentPdf, *b.id(), options_b, 1));
        let woken = runtime.queue.list_queued(JobKind::UnitBundlePdf).unwrap();
        assert_eq!(woken.len(), 1);
        assert_eq!(woken[0].entity_id, unit);
        assert_eq!(woken[0].request_id(), request);

        // Redelivery of a settled child does not wake it again.
        child.handle(&claimed(JobKind::DocumentPdf, *a.id(), options_a, 1));
        assert_eq!(runtime.queue.list_queued(JobKind::UnitBundlePdf).unwrap().len(), 1);
    }

    #[test]
    fn gdoc_records_the_remote_url() {
        let runtime = runtime();
        let doc = lesson(&runtime, "Lesson 6");
        let child = ChildArtifactJob::new(runtime.services.clone());
        let options = JobOptions::new()
            .with_content_type(ContentType::Tm)
            .with_folder_id("folder-x");

        let record = child
            .perform(&claimed(JobKind::DocumentGdoc, *doc.id(), options, 1).descriptor)
            .unwrap();
        assert_eq!(record.pages, Some(PAGES_NOT_COMPUTED));
        assert_eq!(record.url, Some(format!("https://docs.test/document/d/doc-{}", doc.id())));
    }

    #[test]
    fn bundle_kinds_are_rejected() {
        let runtime = runtime();
        let child = ChildArtifactJob::new(runtime.services.clone());
        let job = claimed(JobKind::UnitBundlePdf, EntityId::new(), JobOptions::new(), 1);
        assert!(matches!(
            child.perform(&job.descriptor),
            Err(ChildJobError::NotAChild(JobKind::UnitBundlePdf))
        ));
    }
}
