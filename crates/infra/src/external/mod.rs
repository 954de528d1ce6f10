//! Ports to services outside the worker: rendering/export, object storage,
//! and the curriculum hierarchy. Each has an in-memory implementation for
//! tests/dev.

pub mod curriculum;
pub mod render;
pub mod storage;

pub use curriculum::{CurriculumRepository, InMemoryCurriculum};
pub use render::{ExportRequest, ExportTarget, RemoteDoc, RemoteFolder, RenderService, RenderedPdf, StaticRenderer};
pub use storage::{InMemoryStorage, StorageService, StoredObject};
