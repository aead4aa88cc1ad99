//! Batch deduplication.
//!
//! Collapses every group of raw records that share a business key into one
//! survivor. Records are only filtered, never rewritten.
//!
//! # Precedence (highest wins)
//!
//! Snapshots: `arrival_seq`, then `arrival_ts`, then the canonical encoding of
//! all attributes, then `effective_at`.
//!
//! Events: `arrival_ts`, then `event_ts`, then the canonical encoding of the
//! measures, then the entity key.
//!
//! The final tie-breaks make the survivor a pure function of the batch
//! contents, independent of input order. Survivors are returned sorted by key.

use std::cmp::Ordering;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::error::MalformedRecord;
use super::fingerprint::{canonical_attributes, canonical_measures};
use super::types::{RawEntitySnapshot, RawEventRecord};

/// Result of deduplicating one batch.
#[derive(Debug, Clone)]
pub struct DedupOutcome<T> {
    /// One record per distinct key, sorted by key.
    pub survivors: Vec<T>,
    /// Records rejected for a missing key.
    pub malformed: Vec<MalformedRecord>,
    /// `candidates - 1` for every key that had more than one candidate.
    pub duplicates: BTreeMap<String, u64>,
}

impl<T> DedupOutcome<T> {
    pub fn duplicates_removed(&self) -> u64 {
        self.duplicates.values().sum()
    }
}

/// Deduplicate entity snapshots by business key.
pub fn dedup_snapshots(batch: Vec<RawEntitySnapshot>) -> DedupOutcome<RawEntitySnapshot> {
    dedup_by(
        batch,
        "missing business_key",
        |s| s.key().map(str::to_string),
        snapshot_precedence,
    )
}

/// Deduplicate event records by event key. Events without an entity key are
/// rejected here as well, since they can never bind.
pub fn dedup_events(batch: Vec<RawEventRecord>) -> DedupOutcome<RawEventRecord> {
    let mut no_entity = Vec::new();
    let batch: Vec<(usize, RawEventRecord)> = batch
        .into_iter()
        .enumerate()
        .filter_map(|(position, e)| {
            if e.event_key().is_some() && e.entity_key().is_none() {
                warn!(position, event_key = ?e.event_key, "MalformedRecord: missing entity_key");
                no_entity.push(MalformedRecord {
                    position,
                    reason: "missing entity_key".to_string(),
                });
                None
            } else {
                Some((position, e))
            }
        })
        .collect();

    let mut outcome = dedup_positioned(
        batch,
        "missing event_key",
        |e: &RawEventRecord| e.event_key().map(str::to_string),
        event_precedence,
    );
    outcome.malformed.extend(no_entity);
    outcome.malformed.sort_by_key(|m| m.position);
    outcome
}

/// Ordering between two snapshots of the same key.
pub fn snapshot_precedence(a: &RawEntitySnapshot, b: &RawEntitySnapshot) -> Ordering {
    a.arrival_seq
        .cmp(&b.arrival_seq)
        .then(a.arrival_ts.cmp(&b.arrival_ts))
        .then_with(|| canonical_attributes(&a.attributes).cmp(&canonical_attributes(&b.attributes)))
        .then(a.effective_at.cmp(&b.effective_at))
}

/// Ordering between two events with the same event key.
pub fn event_precedence(a: &RawEventRecord, b: &RawEventRecord) -> Ordering {
    a.arrival_ts
        .cmp(&b.arrival_ts)
        .then(a.event_ts.cmp(&b.event_ts))
        .then_with(|| canonical_measures(&a.measures).cmp(&canonical_measures(&b.measures)))
        .then_with(|| a.entity_key.cmp(&b.entity_key))
}

fn dedup_by<T, K, P>(batch: Vec<T>, missing_reason: &str, key_of: K, precedence: P) -> DedupOutcome<T>
where
    K: Fn(&T) -> Option<String>,
    P: Fn(&T, &T) -> Ordering,
{
    dedup_positioned(
        batch.into_iter().enumerate().collect(),
        missing_reason,
        key_of,
        precedence,
    )
}

fn dedup_positioned<T, K, P>(
    batch: Vec<(usize, T)>,
    missing_reason: &str,
    key_of: K,
    precedence: P,
) -> DedupOutcome<T>
where
    K: Fn(&T) -> Option<String>,
    P: Fn(&T, &T) -> Ordering,
{
    let mut winners: BTreeMap<String, T> = BTreeMap::new();
    let mut duplicates: BTreeMap<String, u64> = BTreeMap::new();
    let mut malformed = Vec::new();

    for (position, record) in batch {
        let Some(key) = key_of(&record) else {
            warn!(position, reason = missing_reason, "MalformedRecord");
            malformed.push(MalformedRecord {
                position,
                reason: missing_reason.to_string(),
            });
            continue;
        };

        match winners.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
            Entry::Occupied(mut slot) => {
                *duplicates.entry(slot.key().clone()).or_insert(0) += 1;
                if precedence(&record, slot.get()) == Ordering::Greater {
                    slot.insert(record);
                }
            }
        }
    }

    if !duplicates.is_empty() {
        debug!(
            keys = duplicates.len(),
            removed = duplicates.values().sum::<u64>(),
            "duplicate_removed"
        );
    }

    DedupOutcome {
        survivors: winners.into_values().collect(),
        malformed,
        duplicates,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scd::types::{Attributes, Measures};
    use serde_json::json;

    fn snap(key: &str, tier: &str, seq: u64, ts: i64) -> RawEntitySnapshot {
        let mut attrs = Attributes::new();
        attrs.insert("tier".into(), json!(tier));
        RawEntitySnapshot::new(key, attrs, seq, ts)
    }

    #[test]
    fn test_highest_arrival_seq_wins() {
        let out = dedup_snapshots(vec![snap("C2", "a", 11, 1), snap("C2", "b", 10, 9)]);
        assert_eq!(out.survivors.len(), 1);
        assert_eq!(out.survivors[0].arrival_seq, 11);
        assert_eq!(out.duplicates.get("C2"), Some(&1));
        assert_eq!(out.duplicates_removed(), 1);
    }

    #[test]
    fn test_arrival_ts_breaks_seq_tie() {
        let out = dedup_snapshots(vec![snap("C2", "late", 5, 9), snap("C2", "early", 5, 3)]);
        assert_eq!(out.survivors[0].attributes["tier"], json!("late"));
    }

    #[test]
    fn test_full_tie_is_order_independent() {
        let a = snap("C2", "alpha", 5, 3);
        let b = snap("C2", "beta", 5, 3);
        let first = dedup_snapshots(vec![a.clone(), b.clone()]);
        let second = dedup_snapshots(vec![b, a]);
        assert_eq!(first.survivors, second.survivors);
    }

    #[test]
    fn test_missing_key_rejected_and_not_counted() {
        let mut bad = snap("x", "a", 1, 1);
        bad.business_key = None;
        let out = dedup_snapshots(vec![bad.clone(), bad, snap("C1", "a", 1, 1)]);
        assert_eq!(out.survivors.len(), 1);
        assert_eq!(out.malformed.len(), 2);
        assert_eq!(out.malformed[0].position, 0);
        assert_eq!(out.duplicates_removed(), 0);
    }

    #[test]
    fn test_dedup_is_idempotent() {
        let batch = vec![
            snap("C1", "a", 1, 1),
            snap("C2", "a", 3, 1),
            snap("C1", "b", 2, 1),
            snap("C3", "c", 1, 1),
        ];
        let once = dedup_snapshots(batch);
        let twice = dedup_snapshots(once.survivors.clone());
        assert_eq!(once.survivors, twice.survivors);
        assert_eq!(twice.duplicates_removed(), 0);
    }

    #[test]
    fn test_survivors_sorted_by_key() {
        let out = dedup_snapshots(vec![snap("C3", "a", 1, 1), snap("C1", "a", 1, 1)]);
        let keys: Vec<_> = out.survivors.iter().map(|s| s.key().unwrap()).collect();
        assert_eq!(keys, vec!["C1", "C3"]);
    }

    #[test]
    fn test_event_dedup_and_missing_entity() {
        let mut m = Measures::new();
        m.insert("amount".into(), 42.0);
        let e1 = RawEventRecord::new("E1", "C1", 3, m.clone(), 10);
        let e1_late = RawEventRecord::new("E1", "C1", 3, m.clone(), 11);
        let mut no_entity = RawEventRecord::new("E2", "C1", 3, m, 10);
        no_entity.entity_key = None;

        let out = dedup_events(vec![e1, no_entity, e1_late]);
        assert_eq!(out.survivors.len(), 1);
        assert_eq!(out.survivors[0].arrival_ts, 11);
        assert_eq!(out.malformed.len(), 1);
        assert_eq!(out.malformed[0].position, 1);
        assert_eq!(out.duplicates_removed(), 1);
    }
}
