//! Change detection.
//!
//! Pure classification of a deduplicated snapshot against the current
//! version of its key. No writes happen here, so a batch can be classified
//! across keys in parallel.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::fingerprint::TrackedAttributes;
use super::types::{DimensionVersion, RawEntitySnapshot, SurrogateKey};

/// Source of the current version for a business key.
pub trait CurrentVersionLookup {
    fn current_version(&self, business_key: &str) -> Option<DimensionVersion>;
}

impl CurrentVersionLookup for HashMap<String, DimensionVersion> {
    fn current_version(&self, business_key: &str) -> Option<DimensionVersion> {
        self.get(business_key).filter(|v| v.is_current).cloned()
    }
}

/// Outcome of comparing a snapshot with the current version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Classification {
    /// No current version exists.
    New,
    /// The tracked fingerprint differs from the current version's.
    Changed { current: SurrogateKey },
    /// Same tracked fingerprint; the snapshot is discarded.
    Unchanged { current: SurrogateKey },
}

impl Classification {
    pub fn label(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Changed { .. } => "CHANGED",
            Self::Unchanged { .. } => "UNCHANGED",
        }
    }
}

/// A snapshot together with its classification and tracked fingerprint.
#[derive(Debug, Clone)]
pub struct ClassifiedSnapshot {
    pub business_key: String,
    pub snapshot: RawEntitySnapshot,
    pub fingerprint: String,
    pub classification: Classification,
}

/// Classifies snapshots as NEW, CHANGED or UNCHANGED.
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    tracked: TrackedAttributes,
}

impl ChangeDetector {
    pub fn new(tracked: TrackedAttributes) -> Self {
        Self { tracked }
    }

    pub fn tracked(&self) -> &TrackedAttributes {
        &self.tracked
    }

    /// Classify one snapshot. Returns `None` if the snapshot has no key.
    pub fn classify<L>(&self, snapshot: RawEntitySnapshot, lookup: &L) -> Option<ClassifiedSnapshot>
    where
        L: CurrentVersionLookup + ?Sized,
    {
        let business_key = snapshot.key()?.to_string();
        let fingerprint = self.tracked.fingerprint(&snapshot.attributes);

        let classification = match lookup.current_version(&business_key) {
            None => Classification::New,
            Some(current) if current.fingerprint != fingerprint => Classification::Changed {
                current: current.surrogate_key,
            },
            Some(current) => Classification::Unchanged {
                current: current.surrogate_key,
            },
        };

        Some(ClassifiedSnapshot {
            business_key,
            snapshot,
            fingerprint,
            classification,
        })
    }

    /// Classify a deduplicated batch, preserving input order.
    pub fn classify_batch<L>(
        &self,
        snapshots: Vec<RawEntitySnapshot>,
        lookup: &L,
        parallel: bool,
    ) -> Vec<ClassifiedSnapshot>
    where
        L: CurrentVersionLookup + Sync + ?Sized,
    {
        if parallel {
            snapshots
                .into_par_iter()
                .filter_map(|s| self.classify(s, lookup))
                .collect()
        } else {
            snapshots
                .into_iter()
                .filter_map(|s| self.classify(s, lookup))
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scd::types::{Attributes, VALID_TO_OPEN};
    use serde_json::json;

    fn tier(value: &str, extra: Option<&str>) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("tier".into(), json!(value));
        if let Some(e) = extra {
            attrs.insert("email".into(), json!(e));
        }
        attrs
    }

    fn detector() -> ChangeDetector {
        ChangeDetector::new(TrackedAttributes::new(["tier"]))
    }

    fn current(det: &ChangeDetector, key: &str, attrs: Attributes) -> HashMap<String, DimensionVersion> {
        let mut map = HashMap::new();
        map.insert(
            key.to_string(),
            DimensionVersion {
                surrogate_key: SurrogateKey(7),
                business_key: key.to_string(),
                fingerprint: det.tracked().fingerprint(&attrs),
                attributes: attrs,
                valid_from: 1,
                valid_to: VALID_TO_OPEN,
                is_current: true,
            },
        );
        map
    }

    #[test]
    fn test_new_when_absent() {
        let det = detector();
        let lookup: HashMap<String, DimensionVersion> = HashMap::new();
        let c = det
            .classify(RawEntitySnapshot::new("C1", tier("standard", None), 1, 1), &lookup)
            .unwrap();
        assert_eq!(c.classification, Classification::New);
    }

    #[test]
    fn test_changed_on_tracked_difference() {
        let det = detector();
        let lookup = current(&det, "C1", tier("standard", None));
        let c = det
            .classify(RawEntitySnapshot::new("C1", tier("premium", None), 2, 5), &lookup)
            .unwrap();
        assert_eq!(c.classification, Classification::Changed { current: SurrogateKey(7) });
    }

    #[test]
    fn test_untracked_drift_is_unchanged() {
        let det = detector();
        let lookup = current(&det, "C1", tier("standard", Some("a@x.io")));
        let c = det
            .classify(
                RawEntitySnapshot::new("C1", tier("standard", Some("b@x.io")), 2, 5),
                &lookup,
            )
            .unwrap();
        assert_eq!(c.classification.label(), "UNCHANGED");
        assert_eq!(c.classification, Classification::Unchanged { current: SurrogateKey(7) });
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let det = detector();
        let lookup = current(&det, "C1", tier("standard", None));
        let batch: Vec<_> = (0..64)
            .map(|i| RawEntitySnapshot::new(format!("C{}", i), tier("standard", None), i, 1))
            .collect();
        let seq = det.classify_batch(batch.clone(), &lookup, false);
        let par = det.classify_batch(batch, &lookup, true);
        let labels = |v: &[ClassifiedSnapshot]| {
            v.iter()
                .map(|c| (c.business_key.clone(), c.classification))
                .collect::<Vec<_>>()
        };
        assert_eq!(labels(&seq), labels(&par));
        assert_eq!(seq[1].classification, Classification::Unchanged { current: SurrogateKey(7) });
    }
}
