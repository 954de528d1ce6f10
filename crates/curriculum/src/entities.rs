//! Units and the child entities they own.
//!
//! The hierarchy is read-only here; it is supplied by the curriculum service
//! and only consulted for child references and file naming.

use serde::{Deserialize, Serialize};

use lcms_core::{Entity, EntityId};

use crate::content::ContentType;

/// A composite entity: ordered lessons plus the unit's materials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    id: EntityId,
    name: String,
    /// Short breadcrumb pieces, e.g. `["ELA", "G2", "M1", "U3"]`.
    breadcrumb: Vec<String>,
    lessons: Vec<EntityId>,
    materials: Vec<EntityId>,
}

impl Unit {
    pub fn new(id: EntityId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            breadcrumb: Vec::new(),
            lessons: Vec::new(),
            materials: Vec::new(),
        }
    }

    pub fn with_breadcrumb<I, S>(mut self, pieces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.breadcrumb = pieces.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_lessons(mut self, lessons: Vec<EntityId>) -> Self {
        self.lessons = lessons;
        self
    }

    pub fn with_materials(mut self, materials: Vec<EntityId>) -> Self {
        self.materials = materials;
        self
    }

    pub fn lessons(&self) -> &[EntityId] {
        &self.lessons
    }

    pub fn materials(&self) -> &[EntityId] {
        &self.materials
    }

    /// All children in dispatch order: lessons first, then materials.
    pub fn children(&self) -> impl Iterator<Item = ChildRef> + '_ {
        self.lessons
            .iter()
            .map(|id| ChildRef::Lesson(*id))
            .chain(self.materials.iter().map(|id| ChildRef::Material(*id)))
    }

    /// Folder name derived from the breadcrumb (`ELA_G2_M1_U3`).
    ///
    /// Falls back to the id when the breadcrumb is empty.
    pub fn folder_name(&self) -> String {
        if self.breadcrumb.is_empty() {
            self.id.to_string()
        } else {
            self.breadcrumb.join("_")
        }
    }

    /// Storage prefix of an assembled bundle: `<root>/<content type>/<folder>`.
    pub fn bundle_folder(&self, root: &str, content_type: Option<ContentType>) -> String {
        let mut folder = root.trim_end_matches('/').to_string();
        if let Some(ct) = content_type {
            folder.push('/');
            folder.push_str(ct.as_str());
        }
        folder.push('/');
        folder.push_str(&self.folder_name());
        folder
    }
}

impl Entity for Unit {
    type Id = EntityId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn display_name(&self) -> &str {
        &self.name
    }
}

/// A lesson document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    id: EntityId,
    name: String,
    breadcrumb: Vec<String>,
    version: u32,
}

impl Document {
    pub fn new(id: EntityId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            breadcrumb: Vec::new(),
            version: 1,
        }
    }

    pub fn with_breadcrumb<I, S>(mut self, pieces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.breadcrumb = pieces.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version.max(1);
        self
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// `ELA_G2_M1_U3_L4_v2`
    pub fn base_filename(&self) -> String {
        let name = if self.breadcrumb.is_empty() {
            self.id.to_string()
        } else {
            self.breadcrumb.join("_")
        };
        format!("{name}_v{}", self.version)
    }

    pub fn pdf_filename(&self) -> String {
        format!("{}.pdf", self.base_filename())
    }
}

impl Entity for Document {
    type Id = EntityId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn display_name(&self) -> &str {
        &self.name
    }
}

/// A material (handout, rubric, reference guide...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Material {
    id: EntityId,
    /// Stable short identifier used in file names and failure reports.
    identifier: String,
    name: String,
    version: u32,
}

impl Material {
    pub fn new(id: EntityId, identifier: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id,
            identifier: identifier.into(),
            name: name.into(),
            version: 1,
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version.max(1);
        self
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn base_filename(&self) -> String {
        format!("{}_v{}", self.identifier, self.version)
    }

    pub fn pdf_filename(&self) -> String {
        format!("{}.pdf", self.base_filename())
    }

    pub fn thumb_filename(&self) -> String {
        format!("{}.jpg", self.base_filename())
    }
}

impl Entity for Material {
    type Id = EntityId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn display_name(&self) -> &str {
        &self.name
    }
}

/// Reference from a unit to one of its children.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum ChildRef {
    Lesson(EntityId),
    Material(EntityId),
}

impl ChildRef {
    pub fn id(&self) -> EntityId {
        match self {
            ChildRef::Lesson(id) | ChildRef::Material(id) => *id,
        }
    }
}
