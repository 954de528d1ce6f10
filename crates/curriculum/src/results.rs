//! Per-entity generation results.
//!
//! Every entity carries a JSON map shaped as
//! `{ "<content type>": { "<artifact kind>": ResultRecord } }`. Writers only
//! ever merge a patch into it, so a PDF result and a Doc result for the same
//! entity can land in any order without clobbering each other.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::content::{ArtifactKind, ContentType};

/// Page count of an artifact whose pages were not counted (previews, Docs).
pub const PAGES_NOT_COMPUTED: i64 = -1;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// A finished composite bundle.
    Completed,
    Failed,
}

/// One `(entity, content type, artifact kind)` result.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResultRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pages: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RecordStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumb_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl ResultRecord {
    /// A generated child artifact.
    pub fn generated(url: impl Into<String>, pages: i64, at: DateTime<Utc>) -> Self {
        Self {
            url: Some(url.into()),
            timestamp: Some(at.timestamp()),
            pages: Some(pages),
            ..Self::default()
        }
    }

    /// A finished composite bundle.
    pub fn completed(url: Option<String>, at: DateTime<Utc>) -> Self {
        Self {
            url,
            timestamp: Some(at.timestamp()),
            status: Some(RecordStatus::Completed),
            ..Self::default()
        }
    }

    pub fn failed(errors: Vec<String>, at: DateTime<Utc>) -> Self {
        Self {
            timestamp: Some(at.timestamp()),
            status: Some(RecordStatus::Failed),
            errors,
            ..Self::default()
        }
    }

    pub fn with_thumb(mut self, thumb_url: impl Into<String>) -> Self {
        self.thumb_url = Some(thumb_url.into());
        self
    }

    pub fn is_failed(&self) -> bool {
        self.status == Some(RecordStatus::Failed)
    }

    /// Usable artifact URL, if any.
    pub fn usable_url(&self) -> Option<&str> {
        match self.url.as_deref() {
            Some(url) if !url.trim().is_empty() && !self.is_failed() => Some(url),
            _ => None,
        }
    }
}

/// Which of an entity's two result maps a write targets.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSlot {
    Links,
    PreviewLinks,
}

impl ResultSlot {
    pub fn for_preview(preview: bool) -> Self {
        if preview {
            ResultSlot::PreviewLinks
        } else {
            ResultSlot::Links
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResultSlot::Links => "links",
            ResultSlot::PreviewLinks => "preview_links",
        }
    }
}

/// `{ "<content type>": { "<kind>": record } }`
pub fn artifact_patch(
    content_type: ContentType,
    kind: ArtifactKind,
    record: &ResultRecord,
) -> JsonValue {
    let record = serde_json::to_value(record).unwrap_or(JsonValue::Null);
    let mut inner = Map::new();
    inner.insert(kind.as_str().to_string(), record);
    let mut outer = Map::new();
    outer.insert(content_type.as_str().to_string(), JsonValue::Object(inner));
    JsonValue::Object(outer)
}

/// Recursive merge: objects merge key by key, anything else is replaced.
pub fn deep_merge(target: &mut JsonValue, patch: JsonValue) {
    match (target, patch) {
        (JsonValue::Object(existing), JsonValue::Object(incoming)) => {
            for (key, value) in incoming {
                match existing.get_mut(&key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        existing.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Reads one record out of a result map.
pub fn read_record(
    map: &JsonValue,
    content_type: ContentType,
    kind: ArtifactKind,
) -> Option<ResultRecord> {
    let value = map.get(content_type.as_str())?.get(kind.as_str())?;
    serde_json::from_value(value.clone()).ok()
}

/// Drops one record, leaving siblings in place.
pub fn clear_record(map: &mut JsonValue, content_type: ContentType, kind: ArtifactKind) {
    if let Some(JsonValue::Object(by_kind)) = map.get_mut(content_type.as_str()) {
        by_kind.remove(kind.as_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn at() -> DateTime<Utc> {
        DateTime::from_timestamp(1_769_045_090, 0).unwrap()
    }

    #[test]
    fn generated_record_serializes_to_schema() {
        let record = ResultRecord::generated("https://s3/l1.pdf", 12, at()).with_thumb("https://s3/l1.jpg");
        let patch = artifact_patch(ContentType::UnitBundle, ArtifactKind::Pdf, &record);

        assert_eq!(
            patch,
            json!({"unit_bundle": {"pdf": {
                "url": "https://s3/l1.pdf",
                "timestamp": 1_769_045_090,
                "pages": 12,
                "thumb_url": "https://s3/l1.jpg"
            }}})
        );
    }

    #[test]
    fn deep_merge_keeps_sibling_keys() {
        let mut map = json!({"unit_bundle": {"pdf": {"url": "a"}}, "tm": {"gdoc": {"url": "d"}}});
        deep_merge(&mut map, json!({"unit_bundle": {"gdoc": {"url": "b"}}}));

        assert_eq!(map["unit_bundle"]["pdf"]["url"], "a");
        assert_eq!(map["unit_bundle"]["gdoc"]["url"], "b");
        assert_eq!(map["tm"]["gdoc"]["url"], "d");
    }

    #[test]
    fn deep_merge_into_non_object_replaces() {
        let mut map = JsonValue::Null;
        deep_merge(&mut map, json!({"full": {}}));
        assert_eq!(map, json!({"full": {}}));
    }

    #[test]
    fn clear_then_read_returns_none() {
        let record = ResultRecord::generated("u", PAGES_NOT_COMPUTED, at());
        let mut map = artifact_patch(ContentType::Tm, ArtifactKind::Gdoc, &record);
        deep_merge(&mut map, artifact_patch(ContentType::Tm, ArtifactKind::Pdf, &record));

        assert_eq!(read_record(&map, ContentType::Tm, ArtifactKind::Gdoc), Some(record.clone()));
        clear_record(&mut map, ContentType::Tm, ArtifactKind::Gdoc);
        assert_eq!(read_record(&map, ContentType::Tm, ArtifactKind::Gdoc), None);
        assert_eq!(read_record(&map, ContentType::Tm, ArtifactKind::Pdf), Some(record));
    }

    #[test]
    fn failed_records_have_no_usable_url() {
        let mut record = ResultRecord::failed(vec!["Lesson 1".into(), "render timeout".into()], at());
        record.url = Some("stale".into());
        assert!(record.is_failed());
        assert_eq!(record.usable_url(), None);
        assert_eq!(ResultRecord::generated(" ", 1, at()).usable_url(), None);
    }

    #[cfg(test)]
    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        fn record_strategy() -> impl Strategy<Value = ResultRecord> {
            ("[a-z]{1,12}", -1i64..200, 0i64..2_000_000_000).prop_map(|(url, pages, ts)| {
                ResultRecord {
                    url: Some(format!("https://storage/{url}")),
                    timestamp: Some(ts),
                    pages: Some(pages),
                    ..ResultRecord::default()
                }
            })
        }

        fn base_strategy() -> impl Strategy<Value = JsonValue> {
            prop::collection::btree_map("[a-z]{1,6}", "[a-z]{0,6}", 0..4).prop_map(|extra| {
                let mut map = json!({"unit_bundle": {}});
                for (k, v) in extra {
                    map[k] = json!({"note": v});
                }
                map
            })
        }

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 256,
                ..ProptestConfig::default()
            })]

            /// Property: PDF and Doc patches commute.
            #[test]
            fn pdf_and_doc_patches_commute(
                base in base_strategy(),
                pdf in record_strategy(),
                doc in record_strategy(),
            ) {
                let pdf_patch = artifact_patch(ContentType::UnitBundle, ArtifactKind::Pdf, &pdf);
                let doc_patch = artifact_patch(ContentType::UnitBundle, ArtifactKind::Gdoc, &doc);

                let mut forward = base.clone();
                deep_merge(&mut forward, pdf_patch.clone());
                deep_merge(&mut forward, doc_patch.clone());

                let mut reverse = base;
                deep_merge(&mut reverse, doc_patch);
                deep_merge(&mut reverse, pdf_patch);

                prop_assert_eq!(forward, reverse);
            }

            /// Property: re-applying the same patch changes nothing.
            #[test]
            fn merge_is_idempotent(base in base_strategy(), record in record_strategy()) {
                let patch = artifact_patch(ContentType::UnitBundle, ArtifactKind::Pdf, &record);

                let mut once = base.clone();
                deep_merge(&mut once, patch.clone());
                let mut twice = once.clone();
                deep_merge(&mut twice, patch);

                prop_assert_eq!(once, twice);
            }
        }
    }
}
