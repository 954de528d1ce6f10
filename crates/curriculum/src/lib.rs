//! Curriculum domain module.
//!
//! Units, the lessons (documents) and materials they own, the content-type
//! tags and artifact kinds a generation run produces, and the per-entity
//! result map those runs write into. Pure logic only (no IO, no queues).

pub mod content;
pub mod entities;
pub mod results;

pub use content::{ArtifactKind, ContentType};
pub use entities::{ChildRef, Document, Material, Unit};
pub use results::{
    PAGES_NOT_COMPUTED, RecordStatus, ResultRecord, ResultSlot, artifact_patch, clear_record,
    deep_merge, read_record,
};
