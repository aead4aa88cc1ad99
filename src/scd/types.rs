//! Core record types for the dimensional engine.
//!
//! Raw inputs (`RawEntitySnapshot`, `RawEventRecord`) are wire records and
//! tolerate missing keys and unknown fields. Committed outputs
//! (`DimensionVersion`, `FactRecord`) are fully typed.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// Sentinel `valid_to` for the current version of an entity.
pub const VALID_TO_OPEN: Timestamp = Timestamp::MAX;

/// Tracked and untracked attributes of an entity, ordered by name.
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Numeric measures carried by an event.
pub type Measures = BTreeMap<String, f64>;

pub fn timestamp_from_datetime(dt: DateTime<Utc>) -> Timestamp {
    dt.timestamp_millis()
}

/// Convert back to a calendar time. Returns `None` for the open sentinel.
pub fn timestamp_to_datetime(ts: Timestamp) -> Option<DateTime<Utc>> {
    if ts == VALID_TO_OPEN {
        return None;
    }
    Utc.timestamp_millis_opt(ts).single()
}

fn format_ts(ts: Timestamp) -> String {
    if ts == VALID_TO_OPEN {
        "inf".to_string()
    } else {
        ts.to_string()
    }
}

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// System-assigned identifier of one dimension version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SurrogateKey(pub u64);

impl fmt::Display for SurrogateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sk:{}", self.0)
    }
}

/// System-assigned identifier of one fact row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FactKey(pub u64);

impl fmt::Display for FactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fk:{}", self.0)
    }
}

// =============================================================================
// RAW INPUTS
// =============================================================================

/// One observation of an entity as delivered by ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEntitySnapshot {
    #[serde(default)]
    pub business_key: Option<String>,
    #[serde(default)]
    pub attributes: Attributes,
    pub arrival_seq: u64,
    pub arrival_ts: Timestamp,
    /// Business-effective time of the observation. Falls back to `arrival_ts`.
    #[serde(default)]
    pub effective_at: Option<Timestamp>,
}

impl RawEntitySnapshot {
    pub fn new(
        business_key: impl Into<String>,
        attributes: Attributes,
        arrival_seq: u64,
        arrival_ts: Timestamp,
    ) -> Self {
        Self {
            business_key: Some(business_key.into()),
            attributes,
            arrival_seq,
            arrival_ts,
            effective_at: None,
        }
    }

    /// The business key if present and non-blank.
    pub fn key(&self) -> Option<&str> {
        self.business_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
    }

    pub fn effective_date(&self) -> Timestamp {
        self.effective_at.unwrap_or(self.arrival_ts)
    }
}

/// One business event referencing an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEventRecord {
    #[serde(default)]
    pub event_key: Option<String>,
    #[serde(default)]
    pub entity_key: Option<String>,
    pub event_ts: Timestamp,
    #[serde(default)]
    pub measures: Measures,
    pub arrival_ts: Timestamp,
}

impl RawEventRecord {
    pub fn new(
        event_key: impl Into<String>,
        entity_key: impl Into<String>,
        event_ts: Timestamp,
        measures: Measures,
        arrival_ts: Timestamp,
    ) -> Self {
        Self {
            event_key: Some(event_key.into()),
            entity_key: Some(entity_key.into()),
            event_ts,
            measures,
            arrival_ts,
        }
    }

    pub fn event_key(&self) -> Option<&str> {
        self.event_key.as_deref().filter(|k| !k.trim().is_empty())
    }

    pub fn entity_key(&self) -> Option<&str> {
        self.entity_key.as_deref().filter(|k| !k.trim().is_empty())
    }
}

// =============================================================================
// COMMITTED OUTPUTS
// =============================================================================

/// One SCD2 version of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionVersion {
    pub surrogate_key: SurrogateKey,
    pub business_key: String,
    pub attributes: Attributes,
    /// Hex SHA-256 over the tracked attributes.
    pub fingerprint: String,
    pub valid_from: Timestamp,
    pub valid_to: Timestamp,
    pub is_current: bool,
}

impl DimensionVersion {
    /// Half-open containment: `valid_from <= ts < valid_to`.
    pub fn contains(&self, ts: Timestamp) -> bool {
        self.valid_from <= ts && ts < self.valid_to
    }

    pub fn interval(&self) -> Interval {
        Interval {
            valid_from: self.valid_from,
            valid_to: self.valid_to,
        }
    }
}

/// A `[valid_from, valid_to)` pair, used in violation reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub valid_from: Timestamp,
    pub valid_to: Timestamp,
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", format_ts(self.valid_from), format_ts(self.valid_to))
    }
}

/// A bound fact. Immutable once committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactRecord {
    pub fact_key: FactKey,
    pub event_key: String,
    pub dimension_key: SurrogateKey,
    pub event_ts: Timestamp,
    pub measures: Measures,
}
