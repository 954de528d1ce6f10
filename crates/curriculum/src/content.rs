use core::str::FromStr;

use serde::{Deserialize, Serialize};

use lcms_core::DomainError;

/// Output variant sharing the result-map schema.
///
/// The tag is the top-level key of an entity's result map, so two variants
/// generated for the same entity never overwrite each other.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    /// Full unit bundle (lesson + material PDFs).
    UnitBundle,
    /// Teacher materials.
    Tm,
    /// Student materials.
    Sm,
    /// Full single-document rendering.
    Full,
    /// Editor preview; written to the preview slot.
    Preview,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::UnitBundle => "unit_bundle",
            ContentType::Tm => "tm",
            ContentType::Sm => "sm",
            ContentType::Full => "full",
            ContentType::Preview => "preview",
        }
    }
}

impl core::fmt::Display for ContentType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unit_bundle" => Ok(ContentType::UnitBundle),
            "tm" => Ok(ContentType::Tm),
            "sm" => Ok(ContentType::Sm),
            "full" => Ok(ContentType::Full),
            "preview" => Ok(ContentType::Preview),
            other => Err(DomainError::validation(format!(
                "unknown content type: {other}"
            ))),
        }
    }
}

/// Kind of artifact produced for one entity.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Pdf,
    Gdoc,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Pdf => "pdf",
            ArtifactKind::Gdoc => "gdoc",
        }
    }
}

impl core::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_tags_match_serde_names() {
        for ct in [
            ContentType::UnitBundle,
            ContentType::Tm,
            ContentType::Sm,
            ContentType::Full,
            ContentType::Preview,
        ] {
            let json = serde_json::to_value(ct).unwrap();
            assert_eq!(json, serde_json::Value::String(ct.as_str().to_string()));
            assert_eq!(ContentType::from_str(ct.as_str()).unwrap(), ct);
        }
    }

    #[test]
    fn unknown_content_type_is_rejected() {
        assert!(matches!(
            ContentType::from_str("lesson_bundle"),
            Err(DomainError::Validation(_))
        ));
    }
}
