//! Render/export service port.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, anyhow};

use lcms_core::{Entity, EntityId};
use lcms_curriculum::{ArtifactKind, ContentType, Document, Material};

/// What to export.
#[derive(Debug, Clone, Copy)]
pub enum ExportTarget<'a> {
    Document(&'a Document),
    Material(&'a Material),
}

impl ExportTarget<'_> {
    pub fn entity_id(&self) -> EntityId {
        match self {
            ExportTarget::Document(doc) => *doc.id(),
            ExportTarget::Material(material) => *material.id(),
        }
    }

    pub fn display_name(&self) -> &str {
        match self {
            ExportTarget::Document(doc) => doc.display_name(),
            ExportTarget::Material(material) => material.display_name(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExportRequest<'a> {
    pub target: ExportTarget<'a>,
    pub content_type: ContentType,
    pub preview: bool,
    /// Remote folder a Doc export lands in.
    pub folder_id: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPdf {
    pub bytes: Vec<u8>,
    /// `None` when the renderer could not tell.
    pub pages: Option<u32>,
}

/// Handle to an exported Google Doc.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDoc {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFolder {
    pub id: String,
    pub url: String,
}

pub trait RenderService: Send + Sync {
    fn export_pdf(&self, request: &ExportRequest<'_>) -> anyhow::Result<RenderedPdf>;

    fn export_gdoc(&self, request: &ExportRequest<'_>) -> anyhow::Result<RemoteDoc>;

    /// JPEG thumbnail of a PDF's first page.
    fn thumbnail(&self, pdf: &[u8]) -> anyhow::Result<Vec<u8>>;

    /// Find or create a remote folder by name.
    fn ensure_folder(&self, name: &str) -> anyhow::Result<RemoteFolder>;
}

/// Deterministic renderer for tests/dev.
///
/// Output bytes name the target, so uploads can be traced back. Failures can
/// be injected per entity, either forever or for the first `n` calls.
#[derive(Debug)]
pub struct StaticRenderer {
    pages: Option<u32>,
    failures: Mutex<HashMap<EntityId, Option<u32>>>,
    calls: Mutex<Vec<(EntityId, ArtifactKind)>>,
}

impl Default for StaticRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticRenderer {
    pub fn new() -> Self {
        Self {
            pages: Some(3),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_pages(mut self, pages: Option<u32>) -> Self {
        self.pages = pages;
        self
    }

    /// Fail every export of `entity_id`.
    pub fn fail_always(&self, entity_id: EntityId) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(entity_id, None);
        }
    }

    /// Fail the next `times` exports of `entity_id`, then succeed.
    pub fn fail_times(&self, entity_id: EntityId, times: u32) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(entity_id, Some(times));
        }
    }

    /// Exports attempted so far, in call order.
    pub fn calls(&self) -> Vec<(EntityId, ArtifactKind)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn attempt(&self, request: &ExportRequest<'_>, kind: ArtifactKind) -> anyhow::Result<()> {
        let entity_id = request.target.entity_id();
        self.calls
            .lock()
            .map_err(|_| anyhow!("renderer state poisoned"))?
            .push((entity_id, kind));

        let mut failures = self.failures.lock().map_err(|_| anyhow!("renderer state poisoned"))?;
        let fail = match failures.get_mut(&entity_id) {
            None => false,
            Some(None) => true,
            Some(Some(0)) => false,
            Some(Some(left)) => {
                *left -= 1;
                true
            }
        };
        if fail {
            return Err(anyhow!("render service unavailable"))
                .with_context(|| format!("exporting {} as {kind}", request.target.display_name()));
        }
        Ok(())
    }
}

impl RenderService for StaticRenderer {
    fn export_pdf(&self, request: &ExportRequest<'_>) -> anyhow::Result<RenderedPdf> {
        self.attempt(request, ArtifactKind::Pdf)?;
        Ok(RenderedPdf {
            bytes: format!("%PDF {} {}", request.target.display_name(), request.content_type).into_bytes(),
            pages: self.pages,
        })
    }

    fn export_gdoc(&self, request: &ExportRequest<'_>) -> anyhow::Result<RemoteDoc> {
        self.attempt(request, ArtifactKind::Gdoc)?;
        let id = format!("doc-{}", request.target.entity_id());
        Ok(RemoteDoc {
            url: format!("https://docs.test/document/d/{id}"),
            id,
        })
    }

    fn thumbnail(&self, pdf: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut jpeg = b"JPEG ".to_vec();
        jpeg.extend_from_slice(pdf);
        Ok(jpeg)
    }

    fn ensure_folder(&self, name: &str) -> anyhow::Result<RemoteFolder> {
        Ok(RemoteFolder {
            id: format!("folder-{name}"),
            url: format!("https://drive.test/drive/folders/folder-{name}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> Document {
        Document::new(EntityId::new(), "Lesson 1").with_breadcrumb(["ELA", "L1"])
    }

    #[test]
    fn injected_failures_run_out() {
        let renderer = StaticRenderer::new();
        let doc = doc();
        renderer.fail_times(*doc.id(), 1);
        let request = ExportRequest {
            target: ExportTarget::Document(&doc),
            content_type: ContentType::UnitBundle,
            preview: false,
            folder_id: None,
        };

        let err = renderer.export_pdf(&request).unwrap_err();
        assert!(format!("{err:#}").contains("Lesson 1"));
        let pdf = renderer.export_pdf(&request).unwrap();
        assert_eq!(pdf.pages, Some(3));
        assert_eq!(renderer.calls().len(), 2);
    }

    #[test]
    fn permanent_failure_never_clears() {
        let renderer = StaticRenderer::new();
        let doc = doc();
        renderer.fail_always(*doc.id());
        let request = ExportRequest {
            target: ExportTarget::Document(&doc),
            content_type: ContentType::Tm,
            preview: false,
            folder_id: Some("f"),
        };
        for _ in 0..3 {
            assert!(renderer.export_gdoc(&request).is_err());
        }
    }
}
