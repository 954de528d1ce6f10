//! Closed sets of job kinds that take part in one bundle's fan-out.

use lcms_infra::jobs::JobKind;

/// Job kinds scanned when a bundle checks for outstanding work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NestedJobSet {
    name: &'static str,
    kinds: &'static [JobKind],
}

impl NestedJobSet {
    pub const UNIT_PDF: NestedJobSet = NestedJobSet {
        name: "unit_pdf",
        kinds: &[JobKind::DocumentPdf, JobKind::MaterialPdf, JobKind::UnitBundlePdf],
    };

    pub const UNIT_GDOC: NestedJobSet = NestedJobSet {
        name: "unit_gdoc",
        kinds: &[JobKind::DocumentGdoc, JobKind::MaterialGdoc, JobKind::UnitBundleGdoc],
    };

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kinds(&self) -> &'static [JobKind] {
        self.kinds
    }

    pub fn contains(&self, kind: JobKind) -> bool {
        self.kinds.contains(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sets_include_their_own_bundle_kind() {
        assert!(NestedJobSet::UNIT_PDF.contains(JobKind::UnitBundlePdf));
        assert!(NestedJobSet::UNIT_GDOC.contains(JobKind::UnitBundleGdoc));
        assert!(!NestedJobSet::UNIT_PDF.contains(JobKind::DocumentGdoc));
    }

    #[test]
    fn sets_do_not_mix_artifact_kinds() {
        for set in [NestedJobSet::UNIT_PDF, NestedJobSet::UNIT_GDOC] {
            let first = set.kinds()[0].artifact_kind();
            assert!(set.kinds().iter().all(|k| k.artifact_kind() == first), "{}", set.name());
        }
    }
}
