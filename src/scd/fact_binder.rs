//! Fact Binder
//!
//! Resolves each event to the single dimension version whose validity
//! interval contains the event timestamp, via the store's per-key interval
//! index.
//!
//! # Outcomes
//!
//! - exactly one match: bound, appended to the fact log, never re-pointed
//! - zero matches: `OrphanedFact`, parked in the deferred queue and retried
//!   after each dimension batch, up to `max_retries` times, then surfaced as
//!   an `UnresolvableFact`
//! - entity commit pending (lock timeout, or the caller names the key as
//!   held): `CommitInFlight`, parked without spending a retry
//! - several matches: `OverlapViolation`, surfaced as unresolvable at once
//!   and never retried; an operator requeues it after the timeline is repaired

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, error, info, warn};

use super::dimension_store::DimensionStore;
use super::error::{BindError, MalformedRecord};
use super::fact_store::FactStore;
use super::storage::ScdStorage;
use super::types::{FactRecord, RawEventRecord, SurrogateKey, Timestamp};

/// An event waiting for its dimension history to catch up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredFact {
    pub event_key: String,
    pub event: RawEventRecord,
    /// Orphan retries performed so far (the initial bind is not counted).
    pub attempts: u32,
    /// Wall-clock ms when first deferred.
    pub first_deferred_at: Timestamp,
}

/// An event that exhausted its retries or hit a corrupt timeline. Needs
/// manual handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnresolvableFact {
    pub event_key: String,
    pub event: RawEventRecord,
    pub attempts: u32,
    pub reason: String,
    pub surfaced_at: Timestamp,
}

/// Result of binding one batch of events (or one retry pass).
#[derive(Debug, Default)]
pub struct BindOutcome {
    /// Facts appended to the fact store.
    pub bound: Vec<FactRecord>,
    /// Events skipped because their event key is already bound, queued or surfaced.
    pub duplicates_skipped: u64,
    /// Event keys newly parked because no version covers them yet.
    pub orphaned: Vec<String>,
    /// Event keys newly parked because their entity's commit is pending.
    pub in_flight: Vec<String>,
    /// Facts that exhausted their retries during this pass.
    pub unresolvable: Vec<UnresolvableFact>,
    /// Fatal timeline corruption found while binding. The events are
    /// surfaced in the unresolvable set but not listed in `unresolvable`.
    pub overlaps: Vec<BindError>,
    /// Events missing an event or entity key.
    pub malformed: u64,
}

pub struct FactBinder {
    max_retries: u32,
    deferred: Mutex<BTreeMap<String, DeferredFact>>,
    unresolvable: Mutex<BTreeMap<String, UnresolvableFact>>,
}

impl FactBinder {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            deferred: Mutex::new(BTreeMap::new()),
            unresolvable: Mutex::new(BTreeMap::new()),
        }
    }

    /// Restore the deferred queue and unresolvable set from storage.
    pub fn open(storage: &ScdStorage, max_retries: u32) -> Result<Self> {
        let binder = Self::new(max_retries);
        {
            let mut deferred = binder.deferred.lock();
            for d in storage.load_deferred()? {
                deferred.insert(d.event_key.clone(), d);
            }
            let mut unresolvable = binder.unresolvable.lock();
            for u in storage.load_unresolvable()? {
                unresolvable.insert(u.event_key.clone(), u);
            }
            info!(
                deferred = deferred.len(),
                unresolvable = unresolvable.len(),
                "fact queues loaded"
            );
        }
        Ok(binder)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Resolve the one version covering `event_ts` for `entity_key`.
    ///
    /// Takes the entity's writer lock (bounded by the store's commit timeout),
    /// so a key whose commit is in flight is never read half-way. Keys with no
    /// history are orphans and never get a lock entry.
    pub fn resolve(
        &self,
        dims: &DimensionStore,
        event_key: &str,
        entity_key: &str,
        event_ts: Timestamp,
    ) -> Result<SurrogateKey, BindError> {
        let orphan = || BindError::OrphanedFact {
            event_key: event_key.to_string(),
            entity_key: entity_key.to_string(),
            event_ts,
        };
        if !dims.has_history(entity_key) {
            return Err(orphan());
        }

        let matches = dims
            .locks()
            .with_key(entity_key, dims.commit_timeout(), || {
                dims.versions_containing(entity_key, event_ts)
            })
            .ok_or_else(|| BindError::CommitInFlight {
                event_key: event_key.to_string(),
                entity_key: entity_key.to_string(),
            })?;

        match matches.as_slice() {
            [only] => Ok(only.surrogate_key),
            [] => Err(orphan()),
            many => Err(BindError::OverlapViolation {
                entity_key: entity_key.to_string(),
                event_ts,
                matches: many.iter().map(|v| (v.surrogate_key, v.interval())).collect(),
            }),
        }
    }

    /// Bind a single event and append it to the fact store. An event key that
    /// is already bound returns the existing fact unchanged.
    pub fn bind(
        &self,
        dims: &DimensionStore,
        facts: &FactStore,
        event: &RawEventRecord,
    ) -> Result<FactRecord, BindError> {
        let (event_key, entity_key) = event_keys(event)?;
        if let Some(existing) = facts.get_by_event(event_key) {
            return Ok(existing);
        }
        let dimension_key = self.resolve(dims, event_key, entity_key, event.event_ts)?;
        let fact = make_fact(facts, event_key, dimension_key, event);
        facts
            .append(vec![fact.clone()])
            .map_err(|e| BindError::Storage {
                event_key: event_key.to_string(),
                message: format!("{:#}", e),
            })?;
        Ok(fact)
    }

    /// Bind a deduplicated batch. Orphans are deferred, overlaps surfaced.
    pub fn bind_batch(
        &self,
        dims: &DimensionStore,
        facts: &FactStore,
        events: Vec<RawEventRecord>,
        parallel: bool,
    ) -> Result<BindOutcome> {
        self.bind_batch_holding(dims, facts, events, &HashSet::new(), parallel)
    }

    /// Like [`bind_batch`](Self::bind_batch), but events whose entity key is
    /// in `held` are deferred as in flight without being resolved. `held` is
    /// the set of keys whose commit was rejected this batch and will be
    /// reclassified by the next one.
    pub fn bind_batch_holding(
        &self,
        dims: &DimensionStore,
        facts: &FactStore,
        events: Vec<RawEventRecord>,
        held: &HashSet<String>,
        parallel: bool,
    ) -> Result<BindOutcome> {
        let mut outcome = BindOutcome::default();

        let pending: Vec<RawEventRecord> = {
            let unresolvable = self.unresolvable.lock();
            let deferred = self.deferred.lock();
            let mut seen = HashSet::new();
            events
                .into_iter()
                .filter(|e| match e.event_key() {
                    Some(k)
                        if facts.contains_event(k)
                            || unresolvable.contains_key(k)
                            || !seen.insert(k.to_string()) =>
                    {
                        outcome.duplicates_skipped += 1;
                        false
                    }
                    Some(k) if deferred.contains_key(k) => {
                        // Already queued; the retry pass owns it.
                        outcome.duplicates_skipped += 1;
                        false
                    }
                    Some(_) => true,
                    None => {
                        outcome.malformed += 1;
                        false
                    }
                })
                .collect()
        };
        let (waiting, pending): (Vec<RawEventRecord>, Vec<RawEventRecord>) = pending
            .into_iter()
            .partition(|e| e.entity_key().map_or(false, |k| held.contains(k)));

        let resolved = self.resolve_all(dims, &pending, parallel);

        let now = Utc::now().timestamp_millis();
        let mut surfaced = Vec::new();
        let mut deferred = self.deferred.lock();
        let mut park = |event_key: String, event: RawEventRecord| {
            deferred.insert(
                event_key.clone(),
                DeferredFact {
                    event_key,
                    event,
                    attempts: 0,
                    first_deferred_at: now,
                },
            );
        };

        for event in waiting {
            let Some(event_key) = event.event_key().map(str::to_string) else {
                continue;
            };
            debug!(event_key = %event_key, "entity commit pending, fact deferred");
            outcome.in_flight.push(event_key.clone());
            park(event_key, event);
        }

        for (event, resolution) in pending.into_iter().zip(resolved) {
            let Some(event_key) = event.event_key().map(str::to_string) else {
                continue;
            };
            match resolution {
                Ok(sk) => outcome.bound.push(make_fact(facts, &event_key, sk, &event)),
                Err(BindError::Malformed(m)) => {
                    warn!(event_key = %event_key, "MalformedRecord: {}", m.reason);
                    outcome.malformed += 1;
                }
                Err(e @ BindError::CommitInFlight { .. }) => {
                    debug!(event_key = %event_key, "{}", e);
                    outcome.in_flight.push(event_key.clone());
                    park(event_key, event);
                }
                Err(e) if e.is_retryable() => {
                    debug!(event_key = %event_key, "OrphanedFact: {}", e);
                    outcome.orphaned.push(event_key.clone());
                    park(event_key, event);
                }
                Err(e) => {
                    error!(event_key = %event_key, "binding aborted: {}", e);
                    surfaced.push(UnresolvableFact {
                        event_key,
                        event,
                        attempts: 0,
                        reason: e.to_string(),
                        surfaced_at: now,
                    });
                    outcome.overlaps.push(e);
                }
            }
        }
        drop(deferred);
        self.surface(surfaced);

        facts.append(outcome.bound.clone())?;
        Ok(outcome)
    }

    /// Retry every deferred fact once. Call after each dimension batch.
    pub fn retry_deferred(
        &self,
        dims: &DimensionStore,
        facts: &FactStore,
        parallel: bool,
    ) -> Result<BindOutcome> {
        self.retry_deferred_holding(dims, facts, &HashSet::new(), parallel)
    }

    /// Like [`retry_deferred`](Self::retry_deferred), but facts whose entity
    /// key is in `held` stay queued untouched. Only orphan retries count
    /// against `max_retries`.
    pub fn retry_deferred_holding(
        &self,
        dims: &DimensionStore,
        facts: &FactStore,
        held: &HashSet<String>,
        parallel: bool,
    ) -> Result<BindOutcome> {
        let mut outcome = BindOutcome::default();
        let queue: Vec<DeferredFact> = std::mem::take(&mut *self.deferred.lock())
            .into_values()
            .collect();
        if queue.is_empty() {
            return Ok(outcome);
        }

        let mut still_deferred = BTreeMap::new();
        let (waiting, queue): (Vec<DeferredFact>, Vec<DeferredFact>) = queue
            .into_iter()
            .partition(|d| d.event.entity_key().map_or(false, |k| held.contains(k)));
        for item in waiting {
            still_deferred.insert(item.event_key.clone(), item);
        }

        let events: Vec<RawEventRecord> = queue.iter().map(|d| d.event.clone()).collect();
        let resolved = self.resolve_all(dims, &events, parallel);

        let now = Utc::now().timestamp_millis();
        let mut surfaced = Vec::new();
        for (mut item, resolution) in queue.into_iter().zip(resolved) {
            if facts.contains_event(&item.event_key) {
                outcome.duplicates_skipped += 1;
                continue;
            }
            match resolution {
                Ok(sk) => {
                    outcome
                        .bound
                        .push(make_fact(facts, &item.event_key, sk, &item.event));
                }
                Err(BindError::CommitInFlight { .. }) => {
                    still_deferred.insert(item.event_key.clone(), item);
                }
                Err(e @ BindError::OrphanedFact { .. }) => {
                    item.attempts += 1;
                    if item.attempts < self.max_retries {
                        still_deferred.insert(item.event_key.clone(), item);
                        continue;
                    }
                    warn!(
                        event_key = %item.event_key,
                        attempts = item.attempts,
                        "UnresolvableFact: {}", e
                    );
                    outcome.unresolvable.push(UnresolvableFact {
                        event_key: item.event_key,
                        event: item.event,
                        attempts: item.attempts,
                        reason: e.to_string(),
                        surfaced_at: now,
                    });
                }
                Err(e @ BindError::OverlapViolation { .. }) => {
                    error!(event_key = %item.event_key, "retry aborted: {}", e);
                    surfaced.push(UnresolvableFact {
                        event_key: item.event_key,
                        event: item.event,
                        attempts: item.attempts,
                        reason: e.to_string(),
                        surfaced_at: now,
                    });
                    outcome.overlaps.push(e);
                }
                Err(e) => {
                    warn!(event_key = %item.event_key, "UnresolvableFact: {}", e);
                    outcome.unresolvable.push(UnresolvableFact {
                        event_key: item.event_key,
                        event: item.event,
                        attempts: item.attempts,
                        reason: e.to_string(),
                        surfaced_at: now,
                    });
                }
            }
        }

        {
            let mut deferred = self.deferred.lock();
            for (k, v) in still_deferred {
                deferred.entry(k).or_insert(v);
            }
        }
        self.surface(outcome.unresolvable.iter().cloned().chain(surfaced));

        facts.append(outcome.bound.clone())?;
        if !outcome.bound.is_empty() {
            info!(resolved = outcome.bound.len(), "deferred facts bound on retry");
        }
        Ok(outcome)
    }

    fn surface(&self, surfaced: impl IntoIterator<Item = UnresolvableFact>) {
        let mut unresolvable = self.unresolvable.lock();
        for u in surfaced {
            unresolvable.insert(u.event_key.clone(), u);
        }
    }

    /// Move a surfaced fact back into the deferred queue with a fresh budget.
    pub fn requeue_unresolvable(&self, event_key: &str) -> bool {
        let Some(u) = self.unresolvable.lock().remove(event_key) else {
            return false;
        };
        self.deferred.lock().insert(
            u.event_key.clone(),
            DeferredFact {
                event_key: u.event_key,
                event: u.event,
                attempts: 0,
                first_deferred_at: Utc::now().timestamp_millis(),
            },
        );
        true
    }

    /// Write both queues to storage.
    pub fn persist(&self, storage: &ScdStorage) -> Result<()> {
        let deferred: Vec<DeferredFact> = self.deferred.lock().values().cloned().collect();
        let unresolvable: Vec<UnresolvableFact> =
            self.unresolvable.lock().values().cloned().collect();
        storage.save_fact_queues(&deferred, &unresolvable)
    }

    pub fn deferred(&self) -> Vec<DeferredFact> {
        self.deferred.lock().values().cloned().collect()
    }

    pub fn unresolvable(&self) -> Vec<UnresolvableFact> {
        self.unresolvable.lock().values().cloned().collect()
    }

    fn resolve_all(
        &self,
        dims: &DimensionStore,
        events: &[RawEventRecord],
        parallel: bool,
    ) -> Vec<Result<SurrogateKey, BindError>> {
        let resolve_one = |e: &RawEventRecord| -> Result<SurrogateKey, BindError> {
            let (event_key, entity_key) = event_keys(e)?;
            self.resolve(dims, event_key, entity_key, e.event_ts)
        };
        if parallel {
            events.par_iter().map(resolve_one).collect()
        } else {
            events.iter().map(resolve_one).collect()
        }
    }
}

fn event_keys(event: &RawEventRecord) -> Result<(&str, &str), BindError> {
    let event_key = event.event_key().ok_or_else(|| {
        BindError::Malformed(MalformedRecord {
            position: 0,
            reason: "missing event_key".to_string(),
        })
    })?;
    let entity_key = event.entity_key().ok_or_else(|| {
        BindError::Malformed(MalformedRecord {
            position: 0,
            reason: "missing entity_key".to_string(),
        })
    })?;
    Ok((event_key, entity_key))
}

fn make_fact(facts: &FactStore, event_key: &str, dimension_key: SurrogateKey, event: &RawEventRecord) -> FactRecord {
    FactRecord {
        fact_key: facts.allocate_key(),
        event_key: event_key.to_string(),
        dimension_key,
        event_ts: event.event_ts,
        measures: event.measures.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scd::change_detector::Classification;
    use crate::scd::fingerprint::TrackedAttributes;
    use crate::scd::types::{Attributes, DimensionVersion, Measures, RawEntitySnapshot, VALID_TO_OPEN};
    use serde_json::json;
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    fn snap(key: &str, tier: &str, ts: i64) -> RawEntitySnapshot {
        let mut attrs = Attributes::new();
        attrs.insert("tier".into(), json!(tier));
        RawEntitySnapshot::new(key, attrs, ts as u64, ts)
    }

    fn event(key: &str, entity: &str, ts: i64, amount: f64) -> RawEventRecord {
        let mut m = Measures::new();
        m.insert("amount".into(), amount);
        RawEventRecord::new(key, entity, ts, m, ts)
    }

    /// C1: standard [1,5), premium [5,inf)
    fn c1_store() -> DimensionStore {
        let dims = DimensionStore::in_memory(TrackedAttributes::new(["tier"]));
        dims.commit("C1", Classification::New, &snap("C1", "standard", 1), 1).unwrap();
        let current = dims.current("C1").unwrap().surrogate_key;
        dims.commit("C1", Classification::Changed { current }, &snap("C1", "premium", 5), 5)
            .unwrap();
        dims
    }

    #[test]
    fn test_events_bind_to_covering_version() {
        let dims = c1_store();
        let facts = FactStore::in_memory();
        let binder = FactBinder::new(3);
        let history = dims.history("C1");

        let f3 = binder.bind(&dims, &facts, &event("E1", "C1", 3, 42.0)).unwrap();
        let f7 = binder.bind(&dims, &facts, &event("E2", "C1", 7, 10.0)).unwrap();
        let f5 = binder.bind(&dims, &facts, &event("E3", "C1", 5, 1.0)).unwrap();

        assert_eq!(f3.dimension_key, history[0].surrogate_key);
        assert_eq!(f7.dimension_key, history[1].surrogate_key);
        assert_eq!(f5.dimension_key, history[1].surrogate_key);
        assert_eq!(f3.measures["amount"], 42.0);
        assert_eq!(facts.len(), 3);
    }

    #[test]
    fn test_unknown_entity_is_orphaned_and_deferred() {
        let dims = c1_store();
        let facts = FactStore::in_memory();
        let binder = FactBinder::new(3);

        let err = binder.bind(&dims, &facts, &event("E1", "C3", 2, 1.0)).unwrap_err();
        assert!(matches!(err, BindError::OrphanedFact { .. }));

        let out = binder
            .bind_batch(&dims, &facts, vec![event("E1", "C3", 2, 1.0)], false)
            .unwrap();
        assert_eq!(out.orphaned, vec!["E1".to_string()]);
        assert_eq!(binder.deferred().len(), 1);
        assert!(facts.is_empty());
    }

    #[test]
    fn test_event_before_first_version_is_orphaned() {
        let dims = c1_store();
        let facts = FactStore::in_memory();
        let binder = FactBinder::new(3);
        let err = binder.bind(&dims, &facts, &event("E0", "C1", 0, 1.0)).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_deferred_fact_binds_after_dimension_arrives() {
        let dims = c1_store();
        let facts = FactStore::in_memory();
        let binder = FactBinder::new(3);
        binder
            .bind_batch(&dims, &facts, vec![event("E1", "C3", 2, 1.0)], false)
            .unwrap();

        dims.commit("C3", Classification::New, &snap("C3", "standard", 1), 1).unwrap();
        let out = binder.retry_deferred(&dims, &facts, false).unwrap();
        assert_eq!(out.bound.len(), 1);
        assert!(binder.deferred().is_empty());
        assert_eq!(
            facts.get_by_event("E1").unwrap().dimension_key,
            dims.current("C3").unwrap().surrogate_key
        );
    }

    #[test]
    fn test_retries_are_bounded() {
        let dims = c1_store();
        let facts = FactStore::in_memory();
        let binder = FactBinder::new(2);
        binder
            .bind_batch(&dims, &facts, vec![event("E1", "C3", 2, 1.0)], false)
            .unwrap();

        let first = binder.retry_deferred(&dims, &facts, false).unwrap();
        assert!(first.unresolvable.is_empty());
        assert_eq!(binder.deferred()[0].attempts, 1);

        let second = binder.retry_deferred(&dims, &facts, false).unwrap();
        assert_eq!(second.unresolvable.len(), 1);
        assert_eq!(second.unresolvable[0].attempts, 2);
        assert!(binder.deferred().is_empty());
        assert_eq!(binder.unresolvable().len(), 1);

        // Surfaced facts are not re-deferred by a replay.
        let replay = binder
            .bind_batch(&dims, &facts, vec![event("E1", "C3", 2, 1.0)], false)
            .unwrap();
        assert_eq!(replay.duplicates_skipped, 1);
        assert!(binder.deferred().is_empty());

        assert!(binder.requeue_unresolvable("E1"));
        assert_eq!(binder.deferred().len(), 1);
        assert!(binder.unresolvable().is_empty());
    }

    #[test]
    fn test_replayed_events_do_not_duplicate_facts() {
        let dims = c1_store();
        let facts = FactStore::in_memory();
        let binder = FactBinder::new(3);
        let batch = vec![event("E1", "C1", 3, 42.0), event("E2", "C1", 7, 10.0)];

        let first = binder.bind_batch(&dims, &facts, batch.clone(), true).unwrap();
        assert_eq!(first.bound.len(), 2);
        let second = binder.bind_batch(&dims, &facts, batch, true).unwrap();
        assert!(second.bound.is_empty());
        assert_eq!(second.duplicates_skipped, 2);
        assert_eq!(facts.len(), 2);
    }

    #[test]
    fn test_queues_survive_restart() {
        let storage = ScdStorage::open_memory().unwrap();
        let dims = c1_store();
        let facts = FactStore::in_memory();
        let binder = FactBinder::new(3);
        binder
            .bind_batch(&dims, &facts, vec![event("E1", "C3", 2, 1.0)], false)
            .unwrap();
        binder.persist(&storage).unwrap();

        let restored = FactBinder::open(&storage, 3).unwrap();
        assert_eq!(restored.deferred().len(), 1);
        assert_eq!(restored.deferred()[0].event.entity_key.as_deref(), Some("C3"));
    }

    /// C1 loaded from rows whose intervals overlap: [1,10) and [5,inf).
    fn overlapping_store() -> DimensionStore {
        let storage = Arc::new(ScdStorage::open_memory().unwrap());
        for (sk, from, to, current) in [(1, 1, 10, false), (2, 5, VALID_TO_OPEN, true)] {
            storage
                .insert_version(&DimensionVersion {
                    surrogate_key: SurrogateKey(sk),
                    business_key: "C1".into(),
                    attributes: Attributes::new(),
                    fingerprint: String::new(),
                    valid_from: from,
                    valid_to: to,
                    is_current: current,
                })
                .unwrap();
        }
        DimensionStore::open(storage, TrackedAttributes::new(["tier"])).unwrap()
    }

    #[test]
    fn test_overlap_is_surfaced_and_never_retried() {
        let dims = overlapping_store();
        let facts = FactStore::in_memory();
        let binder = FactBinder::new(3);

        match binder.resolve(&dims, "E1", "C1", 7).unwrap_err() {
            BindError::OverlapViolation { matches, .. } => assert_eq!(matches.len(), 2),
            other => panic!("expected overlap, got {:?}", other),
        }

        let out = binder
            .bind_batch(&dims, &facts, vec![event("E1", "C1", 7, 1.0)], false)
            .unwrap();
        assert_eq!(out.overlaps.len(), 1);
        assert!(out.unresolvable.is_empty());
        assert!(out.orphaned.is_empty());
        assert!(binder.deferred().is_empty());
        assert_eq!(binder.unresolvable().len(), 1);
        assert!(facts.is_empty());

        // A replay is skipped; a requeue is tried once and surfaced again.
        let replay = binder
            .bind_batch(&dims, &facts, vec![event("E1", "C1", 7, 1.0)], false)
            .unwrap();
        assert_eq!(replay.duplicates_skipped, 1);
        assert!(binder.requeue_unresolvable("E1"));
        let retried = binder.retry_deferred(&dims, &facts, false).unwrap();
        assert_eq!(retried.overlaps.len(), 1);
        assert!(binder.deferred().is_empty());
        assert_eq!(binder.unresolvable()[0].event_key, "E1");

        // Outside the overlap the key still binds.
        let f = binder.bind(&dims, &facts, &event("E2", "C1", 3, 1.0)).unwrap();
        assert_eq!(f.dimension_key, SurrogateKey(1));
    }

    #[test]
    fn test_in_flight_commit_defers_without_spending_retries() {
        let dims = Arc::new(c1_store().with_commit_timeout(Duration::from_millis(20)));
        let facts = FactStore::in_memory();
        let binder = FactBinder::new(1);
        let (held_tx, held_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let d = Arc::clone(&dims);
        let holder = thread::spawn(move || {
            d.locks().with_key("C1", None, || {
                held_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            });
        });
        held_rx.recv().unwrap();

        let out = binder
            .bind_batch(&dims, &facts, vec![event("E1", "C1", 7, 1.0)], false)
            .unwrap();
        assert_eq!(out.in_flight, vec!["E1".to_string()]);
        assert!(out.orphaned.is_empty());
        assert!(out.bound.is_empty());
        assert_eq!(binder.deferred()[0].attempts, 0);

        // Still held: stays queued, and the single orphan retry is not spent.
        let again = binder.retry_deferred(&dims, &facts, false).unwrap();
        assert!(again.unresolvable.is_empty());
        assert_eq!(binder.deferred()[0].attempts, 0);

        release_tx.send(()).unwrap();
        holder.join().unwrap();

        let retried = binder.retry_deferred(&dims, &facts, false).unwrap();
        assert_eq!(retried.bound.len(), 1);
        assert_eq!(
            facts.get_by_event("E1").unwrap().dimension_key,
            dims.as_of("C1", 7).unwrap().surrogate_key
        );
    }

    #[test]
    fn test_held_entity_keys_are_not_resolved() {
        let dims = c1_store();
        let facts = FactStore::in_memory();
        let binder = FactBinder::new(1);
        let held: HashSet<String> = ["C1".to_string()].into_iter().collect();

        let out = binder
            .bind_batch_holding(
                &dims,
                &facts,
                vec![event("E1", "C1", 7, 1.0), event("E2", "C3", 2, 1.0)],
                &held,
                false,
            )
            .unwrap();
        assert_eq!(out.in_flight, vec!["E1".to_string()]);
        assert_eq!(out.orphaned, vec!["E2".to_string()]);
        assert!(facts.is_empty());

        let retried = binder
            .retry_deferred_holding(&dims, &facts, &held, false)
            .unwrap();
        assert_eq!(retried.unresolvable.len(), 1);
        assert_eq!(retried.unresolvable[0].event_key, "E2");
        let waiting = binder.deferred();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].event_key, "E1");
        assert_eq!(waiting[0].attempts, 0);

        let released = binder.retry_deferred(&dims, &facts, false).unwrap();
        assert_eq!(released.bound.len(), 1);
    }

    #[test]
    fn test_unknown_entity_takes_no_lock() {
        let dims = c1_store();
        let facts = FactStore::in_memory();
        let binder = FactBinder::new(3);
        let before = dims.locks().len();

        let out = binder
            .bind_batch(&dims, &facts, vec![event("E1", "GHOST", 2, 1.0)], true)
            .unwrap();
        assert_eq!(out.orphaned, vec!["E1".to_string()]);
        binder.retry_deferred(&dims, &facts, true).unwrap();
        assert_eq!(dims.locks().len(), before);
    }
}
