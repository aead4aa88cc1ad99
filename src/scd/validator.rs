//! Post-commit Invariant Validator
//!
//! Runs after every batch over the committed stores. Violations are reported,
//! never repaired; the pipeline decides whether to hold the watermark.
//!
//! # Invariant Categories
//!
//! - **Current**: exactly one `is_current` version per key, and it is the one
//!   with the open `valid_to`
//! - **Timeline**: versions sorted by `valid_from` are contiguous and
//!   non-overlapping
//! - **SurrogateKey**: no surrogate key is shared between versions
//! - **Referential**: every fact references an existing version
//!
//! Facts whose timestamp now falls outside their version's interval (a later
//! expire shortened it) are reported as advisories, not violations: bindings
//! are never re-pointed.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::{error, info};

use super::dimension_store::DimensionStore;
use super::fact_store::FactStore;
use super::types::{DimensionVersion, FactKey, FactRecord, Interval, SurrogateKey, Timestamp, VALID_TO_OPEN};

// =============================================================================
// VIOLATIONS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvariantCategory {
    Current,
    Timeline,
    SurrogateKey,
    Referential,
}

impl InvariantCategory {
    pub fn all() -> &'static [InvariantCategory] {
        &[
            Self::Current,
            Self::Timeline,
            Self::SurrogateKey,
            Self::Referential,
        ]
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Current => "Exactly one current version per key",
            Self::Timeline => "Contiguous, non-overlapping validity intervals",
            Self::SurrogateKey => "Surrogate keys unique across versions",
            Self::Referential => "Facts reference existing versions",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationType {
    // Current violations
    /// Expired-but-not-replaced: the one state that needs manual repair.
    NoCurrentVersion,
    MultipleCurrentVersions { current: Vec<SurrogateKey> },
    CurrentNotOpen { surrogate_key: SurrogateKey, valid_to: Timestamp },
    ExpiredButOpen { surrogate_key: SurrogateKey },

    // Timeline violations
    EmptyInterval { surrogate_key: SurrogateKey, interval: Interval },
    Gap { left: Interval, right: Interval },
    Overlap { left: Interval, right: Interval },

    // Surrogate key violations
    DuplicateSurrogateKey { surrogate_key: SurrogateKey, business_keys: Vec<String> },

    // Referential violations
    DanglingFactReference { fact_key: FactKey, surrogate_key: SurrogateKey },
}

impl ViolationType {
    pub fn category(&self) -> InvariantCategory {
        match self {
            Self::NoCurrentVersion
            | Self::MultipleCurrentVersions { .. }
            | Self::CurrentNotOpen { .. }
            | Self::ExpiredButOpen { .. } => InvariantCategory::Current,
            Self::EmptyInterval { .. } | Self::Gap { .. } | Self::Overlap { .. } => {
                InvariantCategory::Timeline
            }
            Self::DuplicateSurrogateKey { .. } => InvariantCategory::SurrogateKey,
            Self::DanglingFactReference { .. } => InvariantCategory::Referential,
        }
    }
}

/// One invariant violation, with the offending key and intervals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub business_key: Option<String>,
    pub violation: ViolationType,
}

impl InvariantViolation {
    pub fn category(&self) -> InvariantCategory {
        self.violation.category()
    }
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key = self.business_key.as_deref().unwrap_or("-");
        match &self.violation {
            ViolationType::NoCurrentVersion => write!(f, "{}: no current version", key),
            ViolationType::MultipleCurrentVersions { current } => {
                write!(f, "{}: {} current versions {:?}", key, current.len(), current)
            }
            ViolationType::CurrentNotOpen { surrogate_key, valid_to } => write!(
                f,
                "{}: current version {} closed at {}",
                key, surrogate_key, valid_to
            ),
            ViolationType::ExpiredButOpen { surrogate_key } => {
                write!(f, "{}: expired version {} has open valid_to", key, surrogate_key)
            }
            ViolationType::EmptyInterval { surrogate_key, interval } => {
                write!(f, "{}: version {} has empty interval {}", key, surrogate_key, interval)
            }
            ViolationType::Gap { left, right } => write!(f, "{}: gap between {} and {}", key, left, right),
            ViolationType::Overlap { left, right } => {
                write!(f, "{}: overlap between {} and {}", key, left, right)
            }
            ViolationType::DuplicateSurrogateKey {
                surrogate_key,
                business_keys,
            } => write!(f, "{} shared by {:?}", surrogate_key, business_keys),
            ViolationType::DanglingFactReference {
                fact_key,
                surrogate_key,
            } => write!(f, "{} references missing {}", fact_key, surrogate_key),
        }
    }
}

/// A fact bound to a version whose interval no longer contains it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleBinding {
    pub fact_key: FactKey,
    pub surrogate_key: SurrogateKey,
    pub event_ts: Timestamp,
    pub interval: Interval,
}

// =============================================================================
// REPORT
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub keys_checked: usize,
    pub versions_checked: usize,
    pub facts_checked: usize,
    pub violations: Vec<InvariantViolation>,
    pub stale_bindings: Vec<StaleBinding>,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn count(&self, category: InvariantCategory) -> usize {
        self.violations
            .iter()
            .filter(|v| v.category() == category)
            .count()
    }

    /// One-line summary for logs.
    pub fn summary(&self) -> String {
        if self.passed() {
            format!(
                "PASS keys={} versions={} facts={} stale_bindings={}",
                self.keys_checked,
                self.versions_checked,
                self.facts_checked,
                self.stale_bindings.len()
            )
        } else {
            let by_category: Vec<String> = InvariantCategory::all()
                .iter()
                .filter(|c| self.count(**c) > 0)
                .map(|c| format!("{:?}={}", c, self.count(*c)))
                .collect();
            format!("FAIL violations={} [{}]", self.violations.len(), by_category.join(", "))
        }
    }
}

// =============================================================================
// VALIDATOR
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct Validator {
    parallel: bool,
}

impl Validator {
    pub fn new(parallel: bool) -> Self {
        Self { parallel }
    }

    pub fn validate_stores(&self, dims: &DimensionStore, facts: &FactStore) -> ValidationReport {
        self.validate(&dims.all_versions(), &facts.facts())
    }

    pub fn validate(&self, versions: &[DimensionVersion], facts: &[FactRecord]) -> ValidationReport {
        let mut by_key: BTreeMap<&str, Vec<&DimensionVersion>> = BTreeMap::new();
        for v in versions {
            by_key.entry(v.business_key.as_str()).or_default().push(v);
        }

        let groups: Vec<(&str, Vec<&DimensionVersion>)> = by_key.into_iter().collect();
        let mut violations: Vec<InvariantViolation> = if self.parallel {
            groups
                .par_iter()
                .flat_map_iter(|(key, group)| check_key(key, group))
                .collect()
        } else {
            groups
                .iter()
                .flat_map(|(key, group)| check_key(key, group))
                .collect()
        };

        violations.extend(check_surrogate_uniqueness(versions));

        let (dangling, stale_bindings) = check_facts(versions, facts);
        violations.extend(dangling);

        let report = ValidationReport {
            keys_checked: groups.len(),
            versions_checked: versions.len(),
            facts_checked: facts.len(),
            violations,
            stale_bindings,
        };

        if report.passed() {
            info!("validation {}", report.summary());
        } else {
            error!("validation {}", report.summary());
            for v in report.violations.iter().take(20) {
                error!(category = ?v.category(), "invariant_violation: {}", v);
            }
        }
        report
    }
}

fn violation(key: &str, violation: ViolationType) -> InvariantViolation {
    InvariantViolation {
        business_key: Some(key.to_string()),
        violation,
    }
}

/// Current-flag and timeline checks for one key.
fn check_key(key: &str, group: &[&DimensionVersion]) -> Vec<InvariantViolation> {
    let mut out = Vec::new();

    let current: Vec<&DimensionVersion> = group.iter().copied().filter(|v| v.is_current).collect();
    match current.len() {
        0 => out.push(violation(key, ViolationType::NoCurrentVersion)),
        1 => {}
        _ => {
            let mut sks: Vec<SurrogateKey> = current.iter().map(|v| v.surrogate_key).collect();
            sks.sort();
            out.push(violation(key, ViolationType::MultipleCurrentVersions { current: sks }));
        }
    }

    for v in group {
        if v.is_current && v.valid_to != VALID_TO_OPEN {
            out.push(violation(
                key,
                ViolationType::CurrentNotOpen {
                    surrogate_key: v.surrogate_key,
                    valid_to: v.valid_to,
                },
            ));
        }
        if !v.is_current && v.valid_to == VALID_TO_OPEN {
            out.push(violation(
                key,
                ViolationType::ExpiredButOpen {
                    surrogate_key: v.surrogate_key,
                },
            ));
        }
        if v.valid_from >= v.valid_to {
            out.push(violation(
                key,
                ViolationType::EmptyInterval {
                    surrogate_key: v.surrogate_key,
                    interval: v.interval(),
                },
            ));
        }
    }

    let mut sorted: Vec<&DimensionVersion> = group.to_vec();
    sorted.sort_by_key(|v| (v.valid_from, v.surrogate_key));
    for pair in sorted.windows(2) {
        let (left, right) = (pair[0], pair[1]);
        if left.valid_to < right.valid_from {
            out.push(violation(
                key,
                ViolationType::Gap {
                    left: left.interval(),
                    right: right.interval(),
                },
            ));
        } else if left.valid_to > right.valid_from {
            out.push(violation(
                key,
                ViolationType::Overlap {
                    left: left.interval(),
                    right: right.interval(),
                },
            ));
        }
    }

    out
}

fn check_surrogate_uniqueness(versions: &[DimensionVersion]) -> Vec<InvariantViolation> {
    let mut owners: BTreeMap<SurrogateKey, Vec<&str>> = BTreeMap::new();
    for v in versions {
        owners.entry(v.surrogate_key).or_default().push(&v.business_key);
    }
    owners
        .into_iter()
        .filter(|(_, keys)| keys.len() > 1)
        .map(|(sk, keys)| {
            let mut business_keys: Vec<String> = keys.into_iter().map(str::to_string).collect();
            business_keys.sort();
            InvariantViolation {
                business_key: None,
                violation: ViolationType::DuplicateSurrogateKey {
                    surrogate_key: sk,
                    business_keys,
                },
            }
        })
        .collect()
}

fn check_facts(
    versions: &[DimensionVersion],
    facts: &[FactRecord],
) -> (Vec<InvariantViolation>, Vec<StaleBinding>) {
    let by_sk: HashMap<SurrogateKey, &DimensionVersion> =
        versions.iter().map(|v| (v.surrogate_key, v)).collect();

    let mut dangling = Vec::new();
    let mut stale = Vec::new();
    for fact in facts {
        match by_sk.get(&fact.dimension_key) {
            None => dangling.push(InvariantViolation {
                business_key: None,
                violation: ViolationType::DanglingFactReference {
                    fact_key: fact.fact_key,
                    surrogate_key: fact.dimension_key,
                },
            }),
            Some(v) if !v.contains(fact.event_ts) => stale.push(StaleBinding {
                fact_key: fact.fact_key,
                surrogate_key: v.surrogate_key,
                event_ts: fact.event_ts,
                interval: v.interval(),
            }),
            Some(_) => {}
        }
    }
    (dangling, stale)
}
