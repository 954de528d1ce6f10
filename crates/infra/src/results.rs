//! Result store: per-entity result maps with merge-only writes.
//!
//! Backends only load and save whole maps. [`ResultStore`] serializes
//! read-modify-write cycles per entity with an advisory lock, so concurrent
//! writers for different content types or artifact kinds never lose each
//! other's keys.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::{Value as JsonValue, json};
use tracing::debug;

use lcms_core::EntityId;
use lcms_curriculum::{ArtifactKind, ContentType, ResultRecord, ResultSlot, artifact_patch, clear_record, deep_merge, read_record};

use crate::locks::{AdvisoryLocks, LockError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResultStoreError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("result backend error: {0}")]
    Backend(String),
    #[error("malformed result record: {0}")]
    Malformed(String),
}

/// Raw persistence of result maps.
pub trait ResultBackend: Send + Sync {
    /// The stored map, or an empty object.
    fn load(&self, entity_id: EntityId, slot: ResultSlot) -> Result<JsonValue, ResultStoreError>;

    fn save(&self, entity_id: EntityId, slot: ResultSlot, map: &JsonValue) -> Result<(), ResultStoreError>;
}

impl<B> ResultBackend for Arc<B>
where
    B: ResultBackend + ?Sized,
{
    fn load(&self, entity_id: EntityId, slot: ResultSlot) -> Result<JsonValue, ResultStoreError> {
        (**self).load(entity_id, slot)
    }

    fn save(&self, entity_id: EntityId, slot: ResultSlot, map: &JsonValue) -> Result<(), ResultStoreError> {
        (**self).save(entity_id, slot, map)
    }
}

/// In-memory backend for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryResultBackend {
    maps: RwLock<HashMap<(EntityId, ResultSlot), JsonValue>>,
}

impl InMemoryResultBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResultBackend for InMemoryResultBackend {
    fn load(&self, entity_id: EntityId, slot: ResultSlot) -> Result<JsonValue, ResultStoreError> {
        let maps = self
            .maps
            .read()
            .map_err(|_| ResultStoreError::Backend("lock poisoned".to_string()))?;
        Ok(maps.get(&(entity_id, slot)).cloned().unwrap_or_else(|| json!({})))
    }

    fn save(&self, entity_id: EntityId, slot: ResultSlot, map: &JsonValue) -> Result<(), ResultStoreError> {
        let mut maps = self
            .maps
            .write()
            .map_err(|_| ResultStoreError::Backend("lock poisoned".to_string()))?;
        maps.insert((entity_id, slot), map.clone());
        Ok(())
    }
}

/// Merge-only access to result maps.
#[derive(Clone)]
pub struct ResultStore {
    backend: Arc<dyn ResultBackend>,
    locks: Arc<dyn AdvisoryLocks>,
    lock_timeout: Duration,
}

impl ResultStore {
    pub fn new(backend: Arc<dyn ResultBackend>, locks: Arc<dyn AdvisoryLocks>, lock_timeout: Duration) -> Self {
        Self {
            backend,
            locks,
            lock_timeout,
        }
    }

    /// Deep-merge `patch` into the entity's map. Keys absent from the patch
    /// are left alone.
    pub fn merge_result(&self, entity_id: EntityId, slot: ResultSlot, patch: JsonValue) -> Result<JsonValue, ResultStoreError> {
        self.update(entity_id, slot, |map| deep_merge(map, patch))
    }

    /// Replace one `(content type, kind)` record, keeping its siblings.
    pub fn write_record(
        &self,
        entity_id: EntityId,
        slot: ResultSlot,
        content_type: ContentType,
        kind: ArtifactKind,
        record: &ResultRecord,
    ) -> Result<(), ResultStoreError> {
        let patch = artifact_patch(content_type, kind, record);
        self.update(entity_id, slot, |map| {
            clear_record(map, content_type, kind);
            deep_merge(map, patch);
        })?;
        debug!(entity_id = %entity_id, slot = slot.as_str(), content_type = %content_type, kind = %kind, "result written");
        Ok(())
    }

    /// Drop one record, keeping its siblings.
    pub fn clear(&self, entity_id: EntityId, slot: ResultSlot, content_type: ContentType, kind: ArtifactKind) -> Result<(), ResultStoreError> {
        self.update(entity_id, slot, |map| clear_record(map, content_type, kind))
            .map(|_| ())
    }

    /// The entity's whole map.
    pub fn map(&self, entity_id: EntityId, slot: ResultSlot) -> Result<JsonValue, ResultStoreError> {
        self.backend.load(entity_id, slot)
    }

    pub fn record(
        &self,
        entity_id: EntityId,
        slot: ResultSlot,
        content_type: ContentType,
        kind: ArtifactKind,
    ) -> Result<Option<ResultRecord>, ResultStoreError> {
        let map = self.backend.load(entity_id, slot)?;
        let Some(raw) = map.get(content_type.as_str()).and_then(|by_kind| by_kind.get(kind.as_str())) else {
            return Ok(None);
        };
        match read_record(&map, content_type, kind) {
            Some(record) => Ok(Some(record)),
            None => Err(ResultStoreError::Malformed(raw.to_string())),
        }
    }

    fn update(&self, entity_id: EntityId, slot: ResultSlot, apply: impl FnOnce(&mut JsonValue)) -> Result<JsonValue, ResultStoreError> {
        let _guard = self
            .locks
            .acquire(&format!("results_{entity_id}_{}", slot.as_str()), self.lock_timeout)?;
        let mut map = self.backend.load(entity_id, slot)?;
        if !map.is_object() {
            map = json!({});
        }
        apply(&mut map);
        self.backend.save(entity_id, slot, &map)?;
        Ok(map)
    }
}

impl std::fmt::Debug for ResultStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultStore")
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::InMemoryLocks;
    use chrono::Utc;
    use std::thread;

    fn store() -> ResultStore {
        ResultStore::new(
            Arc::new(InMemoryResultBackend::new()),
            Arc::new(InMemoryLocks::new()),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn missing_map_reads_as_empty() {
        let store = store();
        let entity = EntityId::new();
        assert_eq!(store.map(entity, ResultSlot::Links).unwrap(), json!({}));
        assert_eq!(
            store.record(entity, ResultSlot::Links, ContentType::Full, ArtifactKind::Pdf).unwrap(),
            None
        );
    }

    #[test]
    fn write_record_keeps_other_content_types_and_kinds() {
        let store = store();
        let entity = EntityId::new();
        store
            .merge_result(entity, ResultSlot::Links, json!({"tm": {"gdoc": {"url": "doc"}}}))
            .unwrap();
        store
            .merge_result(entity, ResultSlot::Links, json!({"unit_bundle": {"gdoc": {"url": "g"}}}))
            .unwrap();

        let record = ResultRecord::generated("https://s3/x.pdf", 4, Utc::now());
        store
            .write_record(entity, ResultSlot::Links, ContentType::UnitBundle, ArtifactKind::Pdf, &record)
            .unwrap();

        let map = store.map(entity, ResultSlot::Links).unwrap();
        assert_eq!(map["tm"]["gdoc"]["url"], "doc");
        assert_eq!(map["unit_bundle"]["gdoc"]["url"], "g");
        assert_eq!(map["unit_bundle"]["pdf"]["url"], "https://s3/x.pdf");
    }

    #[test]
    fn write_record_replaces_stale_fields() {
        let store = store();
        let entity = EntityId::new();
        let failed = ResultRecord::failed(vec!["L1".into(), "boom".into()], Utc::now());
        store
            .write_record(entity, ResultSlot::Links, ContentType::Full, ArtifactKind::Pdf, &failed)
            .unwrap();
        let ok = ResultRecord::generated("u", 2, Utc::now());
        store
            .write_record(entity, ResultSlot::Links, ContentType::Full, ArtifactKind::Pdf, &ok)
            .unwrap();

        let read = store
            .record(entity, ResultSlot::Links, ContentType::Full, ArtifactKind::Pdf)
            .unwrap();
        assert_eq!(read, Some(ok));
    }

    #[test]
    fn slots_are_independent() {
        let store = store();
        let entity = EntityId::new();
        store
            .merge_result(entity, ResultSlot::PreviewLinks, json!({"full": {"pdf": {"url": "p"}}}))
            .unwrap();
        assert_eq!(store.map(entity, ResultSlot::Links).unwrap(), json!({}));
    }

    #[test]
    fn concurrent_merges_for_different_kinds_all_land() {
        let store = store();
        let entity = EntityId::new();

        let writers: Vec<_> = (0..8)
            .map(|n| {
                let store = store.clone();
                thread::spawn(move || {
                    store
                        .merge_result(entity, ResultSlot::Links, json!({ format!("ct{n}"): {"pdf": {"url": n}} }))
                        .unwrap();
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }

        let map = store.map(entity, ResultSlot::Links).unwrap();
        assert_eq!(map.as_object().unwrap().len(), 8);
    }

    #[test]
    fn malformed_record_is_reported() {
        let store = store();
        let entity = EntityId::new();
        store
            .merge_result(entity, ResultSlot::Links, json!({"full": {"pdf": {"pages": "many"}}}))
            .unwrap();
        assert!(matches!(
            store.record(entity, ResultSlot::Links, ContentType::Full, ArtifactKind::Pdf),
            Err(ResultStoreError::Malformed(_))
        ));
    }
}
