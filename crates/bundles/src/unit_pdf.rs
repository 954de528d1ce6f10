//! Unit PDF bundle: every lesson and material PDF of a unit, copied into one
//! storage folder.

use anyhow::Context;
use tracing::{debug, info, warn};

use lcms_core::Entity;
use lcms_curriculum::{ArtifactKind, ChildRef, ContentType, ResultSlot, Unit};
use lcms_infra::jobs::JobKind;

use crate::error::BundleError;
use crate::nested::NestedJobSet;
use crate::orchestrator::{BundleContext, BundleJob, ChildSpec};

#[derive(Debug, Clone, Copy, Default)]
pub struct UnitPdfBundle;

impl UnitPdfBundle {
    /// Where the unit's children upload before assembly.
    fn staging_folder(root: &str, unit: &Unit) -> String {
        format!("{}/{}", root.trim_end_matches('/'), unit.folder_name())
    }

    /// Copy one child's PDF into the bundle folder. `Ok(false)` when the child
    /// has no usable PDF.
    fn copy_child(&self, ctx: &BundleContext<'_>, child: ChildRef, folder: &str) -> Result<bool, BundleError> {
        let services = ctx.services;
        let (name, key) = match child {
            ChildRef::Lesson(id) => {
                let document = services.curriculum.document(id)?;
                (document.display_name().to_string(), format!("{folder}/{}", document.pdf_filename()))
            }
            ChildRef::Material(id) => {
                let material = services.curriculum.material(id)?;
                (
                    material.display_name().to_string(),
                    format!("{folder}/materials/{}", material.pdf_filename()),
                )
            }
        };

        let record = services.results.record(
            child.id(),
            ResultSlot::for_preview(ctx.options.preview),
            self.content_type(),
            ArtifactKind::Pdf,
        )?;
        let Some(url) = record.as_ref().and_then(|r| r.usable_url()) else {
            debug!(entity_id = %child.id(), "no pdf to copy");
            return Ok(false);
        };

        let bytes = services
            .storage
            .read_back(url)
            .with_context(|| format!("reading {name}"))?;
        services
            .storage
            .upload(&key, &bytes, "application/pdf")
            .with_context(|| format!("copying {name} to {key}"))?;
        Ok(true)
    }
}

impl BundleJob for UnitPdfBundle {
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
        let unit = ctx.services.curriculum.unit(ctx.entity_id)?;
        let options = ctx
            .child_options()
            .with_folder(Self::staging_folder(&ctx.services.config.bundle_root, &unit));

        Ok(unit
            .children()
            .map(|child| ChildSpec {
                kind: match child {
                    ChildRef::Lesson(_) => JobKind::DocumentPdf,
                    ChildRef::Material(_) => JobKind::MaterialPdf,
                },
                entity_id: child.id(),
                options: options.clone(),
            })
            .collect())
    }

    fn generate_bundle(&self, ctx: &BundleContext<'_>) -> Result<String, BundleError> {
        let services = ctx.services;
        let unit = services.curriculum.unit(ctx.entity_id)?;
        let folder = unit.bundle_folder(&services.config.bundle_root, Some(self.content_type()));

        let mut copied = 0;
        for child in unit.children() {
            match self.copy_child(ctx, child, &folder) {
                Ok(true) => copied += 1,
                Ok(false) => {}
                // Assembly goes on with whatever could be copied.
                Err(err) => warn!(entity_id = %child.id(), error = %err, "could not copy pdf into bundle"),
            }
        }
        info!(entity_id = %ctx.entity_id, folder = %folder, copied, "unit pdf bundle assembled");
        Ok(services.storage.url_for(&folder))
    }
}
