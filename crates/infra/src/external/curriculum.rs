//! Curriculum hierarchy port (read-only).

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::anyhow;

use lcms_core::{DomainError, Entity, EntityId};
use lcms_curriculum::{Document, Material, Unit};

pub trait CurriculumRepository: Send + Sync {
    fn unit(&self, id: EntityId) -> anyhow::Result<Unit>;

    fn document(&self, id: EntityId) -> anyhow::Result<Document>;

    fn material(&self, id: EntityId) -> anyhow::Result<Material>;
}

/// In-memory hierarchy for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryCurriculum {
    units: RwLock<HashMap<EntityId, Unit>>,
    documents: RwLock<HashMap<EntityId, Document>>,
    materials: RwLock<HashMap<EntityId, Material>>,
}

fn lookup<T: Clone>(map: &RwLock<HashMap<EntityId, T>>, id: EntityId, what: &str) -> anyhow::Result<T> {
    map.read()
        .map_err(|_| anyhow!("curriculum state poisoned"))?
        .get(&id)
        .cloned()
        .ok_or_else(|| DomainError::not_found(format!("{what} {id}")).into())
}

impl InMemoryCurriculum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_unit(&self, unit: Unit) {
        if let Ok(mut units) = self.units.write() {
            units.insert(*unit.id(), unit);
        }
    }

    pub fn insert_document(&self, document: Document) {
        if let Ok(mut documents) = self.documents.write() {
            documents.insert(*document.id(), document);
        }
    }

    pub fn insert_material(&self, material: Material) {
        if let Ok(mut materials) = self.materials.write() {
            materials.insert(*material.id(), material);
        }
    }
}

impl CurriculumRepository for InMemoryCurriculum {
    fn unit(&self, id: EntityId) -> anyhow::Result<Unit> {
        lookup(&self.units, id, "unit")
    }

    fn document(&self, id: EntityId) -> anyhow::Result<Document> {
        lookup(&self.documents, id, "document")
    }

    fn material(&self, id: EntityId) -> anyhow::Result<Material> {
        lookup(&self.materials, id, "material")
    }
}
