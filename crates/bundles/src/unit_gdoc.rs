//! Unit Google-Doc bundle: the unit's `tm` lessons and materials exported as
//! Docs into one Drive folder.
//!
//! A finished bundle is marked on the unit under
//! `gdoc_bundle.<content type>`, next to (not inside) the per-artifact
//! records. Failures are never written into the unit's result map. They
//! propagate to the handler, which records them against the request with
//! the full error chain.

use anyhow::Context;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info};

use lcms_core::Entity;
use lcms_curriculum::{ArtifactKind, ChildRef, ContentType, ResultRecord, ResultSlot};
use lcms_infra::jobs::{JobKind, JobOptions};

use crate::error::BundleError;
use crate::nested::NestedJobSet;
use crate::orchestrator::{BundleContext, BundleJob, ChildSpec};

/// Result-map key of the unit's Doc bundle marker.
pub const GDOC_BUNDLE_KEY: &str = "gdoc_bundle";

#[derive(Debug, Clone, Copy, Default)]
pub struct UnitGdocBundle;

impl BundleJob for UnitGdocBundle {
    fn kind(&self) -> JobKind {
        JobKind::UnitBundleGdoc
    }

    fn content_type(&self) -> ContentType {
        ContentType::Tm
    }

    fn nested_jobs(&self) -> NestedJobSet {
        NestedJobSet::UNIT_GDOC
    }

    fn normalize(&self, options: &mut JobOptions) {
        options.ignore_result = true;
        options.raise_errors = true;
    }

    fn generate_dependants(&self, ctx: &BundleContext<'_>) -> Result<Vec<ChildSpec>, BundleError> {
        let services = ctx.services;
        let unit = services.curriculum.unit(ctx.entity_id)?;
        let folder = services
            .render
            .ensure_folder(&unit.folder_name())
            .with_context(|| format!("preparing Drive folder for {}", unit.display_name()))?;
        let options = ctx.child_options().with_folder_id(folder.id);
        let slot = ResultSlot::for_preview(ctx.options.preview);

        let mut children = Vec::new();
        for child in unit.children() {
            let kind = match child {
                ChildRef::Lesson(id) => {
                    let existing = services.results.record(id, slot, self.content_type(), ArtifactKind::Gdoc)?;
                    if existing.as_ref().and_then(|r| r.usable_url()).is_some() {
                        debug!(entity_id = %id, "lesson already exported");
                        continue;
                    }
                    JobKind::DocumentGdoc
                }
                ChildRef::Material(_) => JobKind::MaterialGdoc,
            };
            children.push(ChildSpec {
                kind,
                entity_id: child.id(),
                options: options.clone(),
            });
        }
        Ok(children)
    }

    fn generate_bundle(&self, ctx: &BundleContext<'_>) -> Result<String, BundleError> {
        let services = ctx.services;
        let unit = services.curriculum.unit(ctx.entity_id)?;
        // Find-or-create: resolves to the folder the children exported into.
        let folder = services
            .render
            .ensure_folder(&unit.folder_name())
            .with_context(|| format!("resolving Drive folder for {}", unit.display_name()))?;

        let record = ResultRecord::completed(Some(folder.url.clone()), Utc::now());
        services.results.merge_result(
            ctx.entity_id,
            ResultSlot::for_preview(ctx.options.preview),
            json!({ GDOC_BUNDLE_KEY: { self.content_type().as_str(): record } }),
        )?;
        info!(entity_id = %ctx.entity_id, folder = %folder.url, "unit gdoc bundle assembled");
        Ok(folder.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use lcms_core::EntityId;
    use lcms_curriculum::{Document, Material, Unit};
    use lcms_infra::BundleConfig;
    use lcms_infra::jobs::{JobId, RequestId};

    use crate::runtime::InMemoryRuntime;

    #[test]
    fn normalize_forces_raise_and_ignore() {
        let mut options = JobOptions::new();
        UnitGdocBundle.normalize(&mut options);
        assert!(options.ignore_result);
        assert!(options.raise_errors);
    }

    #[test]
    fn exported_lessons_are_skipped_and_folder_is_forwarded() {
        let runtime = InMemoryRuntime::new(BundleConfig::default());
        let done = Document::new(EntityId::new(), "Lesson 1");
        let pending = Document::new(EntityId::new(), "Lesson 2");
        let material = Material::new(EntityId::new(), "m-1", "Handout");
        let unit = Unit::new(EntityId::new(), "Unit 3")
            .with_breadcrumb(["Math", "G5", "U3"])
            .with_lessons(vec![*done.id(), *pending.id()])
            .with_materials(vec![*material.id()]);
        runtime.curriculum.insert_unit(unit.clone());
        runtime
            .services
            .results
            .write_record(
                *done.id(),
                ResultSlot::Links,
                ContentType::Tm,
                ArtifactKind::Gdoc,
                &ResultRecord::generated("https://docs.test/document/d/existing", -1, Utc::now()),
            )
            .unwrap();

        let mut options = JobOptions::new().with_content_type(ContentType::Tm);
        UnitGdocBundle.normalize(&mut options);
        let ctx = BundleContext {
            services: &runtime.services,
            job_id: JobId::new(),
            entity_id: *unit.id(),
            request: RequestId::new(),
            options: &options,
        };

        let children = UnitGdocBundle.generate_dependants(&ctx).unwrap();
        let targets: Vec<(JobKind, EntityId)> = children.iter().map(|c| (c.kind, c.entity_id)).collect();
        assert_eq!(
            targets,
            vec![(JobKind::DocumentGdoc, *pending.id()), (JobKind::MaterialGdoc, *material.id())]
        );
        assert!(children
            .iter()
            .all(|c| c.options.folder_id.as_deref() == Some("folder-Math_G5_U3")));
    }

    #[test]
    fn assembly_marks_the_unit_under_gdoc_bundle() {
        let runtime = InMemoryRuntime::new(BundleConfig::default());
        let unit = Unit::new(EntityId::new(), "Unit 4").with_breadcrumb(["Math", "G5", "U4"]);
        runtime.curriculum.insert_unit(unit.clone());
        let mut options = JobOptions::new();
        UnitGdocBundle.normalize(&mut options);
        let ctx = BundleContext {
            services: &runtime.services,
            job_id: JobId::new(),
            entity_id: *unit.id(),
            request: RequestId::new(),
            options: &options,
        };

        let url = UnitGdocBundle.generate_bundle(&ctx).unwrap();
        let map = runtime.services.results.map(*unit.id(), ResultSlot::Links).unwrap();
        assert_eq!(map["gdoc_bundle"]["tm"]["status"], "completed");
        assert_eq!(map["gdoc_bundle"]["tm"]["url"], url);
        assert!(map["gdoc_bundle"]["tm"]["timestamp"].is_i64());
        assert!(map.get("tm").is_none());
    }
}
