//! Batch Pipeline Driver
//!
//! Single coordinator for one source stream's batches:
//!
//! ```text
//! watermark filter -> dedup -> classify (par) -> commit per key (par)
//!     -> retry deferred facts -> bind new events (par) -> validate
//!     -> advance watermarks | halt
//! ```
//!
//! Per-key failures are recorded in the report and never abort sibling keys.
//! Events for a key whose commit timed out wait in the deferred queue until
//! the next batch has committed it.
//! A failed validation halts the driver: committed data stays in place for
//! inspection, no watermark moves, and further batches are refused until
//! [`PipelineDriver::resume_after_investigation`] sees a clean pass.

use chrono::Utc;
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::change_detector::{ChangeDetector, Classification, ClassifiedSnapshot};
use super::config::EngineConfig;
use super::dedup::{dedup_events, dedup_snapshots};
use super::dimension_store::{CommitOutcome, DimensionStore};
use super::error::{CommitError, MalformedRecord, PipelineError};
use super::fact_binder::{BindOutcome, FactBinder};
use super::fact_store::FactStore;
use super::fingerprint::TrackedAttributes;
use super::metrics::BatchMetrics;
use super::storage::ScdStorage;
use super::types::{RawEntitySnapshot, RawEventRecord, Timestamp};
use super::validator::{ValidationReport, Validator};
use super::watermark::{entities_cursor, events_cursor, WatermarkStore};

// =============================================================================
// CANCELLATION
// =============================================================================

/// Shared flag for cancelling the in-flight batch.
///
/// Keys not yet committed when the flag is seen are skipped. A key whose
/// commit already started completes.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Clear the flag, returning whether it was set.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

// =============================================================================
// REPORT
// =============================================================================

/// A key whose commit was rejected in this batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedKey {
    pub business_key: String,
    pub arrival_seq: u64,
    pub category: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub stream: String,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    pub counts: BatchMetrics,
    pub malformed: Vec<MalformedRecord>,
    pub rejected: Vec<RejectedKey>,
    pub overlaps: Vec<String>,
    pub unresolvable: Vec<String>,
    pub validation: ValidationReport,
    pub cancelled: bool,
    pub entities_watermark: Option<i64>,
    pub events_watermark: Option<i64>,
    pub entities_advanced: bool,
    pub events_advanced: bool,
}

impl BatchReport {
    pub fn passed(&self) -> bool {
        self.validation.passed() && self.overlaps.is_empty()
    }
}

enum KeyResult {
    Committed(CommitOutcome),
    Rejected(CommitError),
    Cancelled,
}

// =============================================================================
// DRIVER
// =============================================================================

pub struct PipelineDriver {
    config: EngineConfig,
    storage: Option<Arc<ScdStorage>>,
    dims: DimensionStore,
    facts: FactStore,
    binder: FactBinder,
    watermarks: WatermarkStore,
    detector: ChangeDetector,
    validator: Validator,
    cancel: CancellationFlag,
    halted: Mutex<Option<String>>,
}

impl PipelineDriver {
    /// Durable driver over the database at `config.db_path`.
    ///
    /// The stores are validated on open; a database left in a failing state
    /// starts halted.
    pub fn open(config: EngineConfig) -> Result<Self, PipelineError> {
        let storage = Arc::new(ScdStorage::open(&config)?);
        let tracked = TrackedAttributes::new(config.tracked_attributes.iter());

        let dims = DimensionStore::open(Arc::clone(&storage), tracked.clone())?
            .with_commit_timeout(config.commit_timeout());
        let facts = FactStore::open(Arc::clone(&storage))?;
        let binder = FactBinder::open(&storage, config.max_fact_retries)?;
        let watermarks = WatermarkStore::open(Arc::clone(&storage))?;

        let driver = Self::assemble(config, Some(storage), dims, facts, binder, watermarks, tracked);
        let report = driver.validate();
        if !report.passed() {
            let reason = format!("stored state fails validation: {}", report.summary());
            error!("{}", reason);
            *driver.halted.lock() = Some(reason);
        }
        Ok(driver)
    }

    /// Volatile driver. `db_path` is ignored.
    pub fn in_memory(config: EngineConfig) -> Self {
        let tracked = TrackedAttributes::new(config.tracked_attributes.iter());
        let dims = DimensionStore::in_memory(tracked.clone()).with_commit_timeout(config.commit_timeout());
        let binder = FactBinder::new(config.max_fact_retries);
        Self::assemble(
            config,
            None,
            dims,
            FactStore::in_memory(),
            binder,
            WatermarkStore::in_memory(),
            tracked,
        )
    }

    fn assemble(
        config: EngineConfig,
        storage: Option<Arc<ScdStorage>>,
        dims: DimensionStore,
        facts: FactStore,
        binder: FactBinder,
        watermarks: WatermarkStore,
        tracked: TrackedAttributes,
    ) -> Self {
        let parallel = config.parallel;
        Self {
            config,
            storage,
            dims,
            facts,
            binder,
            watermarks,
            detector: ChangeDetector::new(tracked),
            validator: Validator::new(parallel),
            cancel: CancellationFlag::new(),
            halted: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Backing database, `None` for a volatile driver.
    pub fn storage(&self) -> Option<&ScdStorage> {
        self.storage.as_deref()
    }

    pub fn dimensions(&self) -> &DimensionStore {
        &self.dims
    }

    pub fn facts(&self) -> &FactStore {
        &self.facts
    }

    pub fn binder(&self) -> &FactBinder {
        &self.binder
    }

    pub fn watermarks(&self) -> &WatermarkStore {
        &self.watermarks
    }

    /// Handle for cancelling batches from another thread.
    pub fn cancellation(&self) -> CancellationFlag {
        self.cancel.clone()
    }

    pub fn halt_reason(&self) -> Option<String> {
        self.halted.lock().clone()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.lock().is_some()
    }

    pub fn validate(&self) -> ValidationReport {
        self.validator.validate_stores(&self.dims, &self.facts)
    }

    /// Re-run validation after manual repair. Clears the halt only on a
    /// clean pass.
    pub fn resume_after_investigation(&self) -> ValidationReport {
        let report = self.validate();
        let mut halted = self.halted.lock();
        if report.passed() {
            if halted.take().is_some() {
                info!("halt cleared after clean validation");
            }
        } else {
            warn!("halt kept: {}", report.summary());
        }
        report
    }

    /// Move an unresolvable fact back to the deferred queue.
    pub fn requeue_unresolvable(&self, event_key: &str) -> Result<bool, PipelineError> {
        let moved = self.binder.requeue_unresolvable(event_key);
        if moved {
            if let Some(storage) = &self.storage {
                self.binder.persist(storage)?;
            }
        }
        Ok(moved)
    }

    // -------------------------------------------------------------------------
    // Batch
    // -------------------------------------------------------------------------

    pub fn run_batch(
        &self,
        stream: &str,
        snapshots: Vec<RawEntitySnapshot>,
        events: Vec<RawEventRecord>,
    ) -> Result<BatchReport, PipelineError> {
        if let Some(reason) = self.halt_reason() {
            return Err(PipelineError::Halted { reason });
        }

        let batch_id = Uuid::new_v4();
        let started_at = Utc::now().timestamp_millis();
        let parallel = self.config.parallel;
        let entities = entities_cursor(stream);
        let event_cursor = events_cursor(stream);
        let mut counts = BatchMetrics::default();

        info!(
            batch_id = %batch_id,
            stream,
            snapshots = snapshots.len(),
            events = events.len(),
            "batch started"
        );

        // Watermark filter
        let snapshots: Vec<RawEntitySnapshot> = snapshots
            .into_iter()
            .filter(|s| {
                let done = self.watermarks.is_processed(&entities, seq_marker(s.arrival_seq));
                counts.already_processed += done as u64;
                !done
            })
            .collect();
        let events: Vec<RawEventRecord> = events
            .into_iter()
            .filter(|e| {
                let done = self.watermarks.is_processed(&event_cursor, e.arrival_ts);
                counts.already_processed += done as u64;
                !done
            })
            .collect();
        let entities_high = snapshots.iter().map(|s| seq_marker(s.arrival_seq)).max();
        let events_high = events.iter().map(|e| e.arrival_ts).max();

        // Dedup
        let snapshot_dedup = dedup_snapshots(snapshots);
        let event_dedup = dedup_events(events);
        counts.duplicate_removed = snapshot_dedup.duplicates_removed() + event_dedup.duplicates_removed();
        let mut malformed = snapshot_dedup.malformed;
        malformed.extend(event_dedup.malformed);
        counts.malformed_record = malformed.len() as u64;

        // Classify and commit
        let classified = self
            .detector
            .classify_batch(snapshot_dedup.survivors, &self.dims, parallel);
        let results = self.commit_all(&classified, parallel);

        let mut rejected = Vec::new();
        let mut held_seq: Option<u64> = None;
        let mut held_keys = HashSet::new();
        for (c, result) in classified.iter().zip(results) {
            match result {
                KeyResult::Committed(CommitOutcome::Inserted { .. }) => counts.new += 1,
                KeyResult::Committed(CommitOutcome::Versioned { .. }) => counts.changed += 1,
                KeyResult::Committed(CommitOutcome::Skipped { .. }) => counts.unchanged += 1,
                KeyResult::Cancelled => counts.skipped_cancelled += 1,
                KeyResult::Rejected(e) => {
                    counts.record_rejection(e.category());
                    if matches!(e, CommitError::Timeout { .. } | CommitError::Storage { .. }) {
                        let seq = c.snapshot.arrival_seq;
                        held_seq = Some(held_seq.map_or(seq, |h| h.min(seq)));
                        held_keys.insert(e.business_key().to_string());
                    }
                    rejected.push(RejectedKey {
                        business_key: e.business_key().to_string(),
                        arrival_seq: c.snapshot.arrival_seq,
                        category: e.category().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        let cancelled = self.cancel.is_cancelled();

        // Bind
        let mut overlaps = Vec::new();
        let mut unresolvable = Vec::new();
        if cancelled {
            warn!(batch_id = %batch_id, skipped = counts.skipped_cancelled, "batch cancelled, facts not bound");
        } else {
            // Keys rejected above still have a commit pending; their events
            // wait for the next batch instead of binding to the old version.
            let retried =
                self.binder
                    .retry_deferred_holding(&self.dims, &self.facts, &held_keys, parallel)?;
            counts.deferred_resolved = retried.bound.len() as u64;
            absorb_bind(&mut counts, &mut overlaps, &mut unresolvable, retried);

            let bound = self.binder.bind_batch_holding(
                &self.dims,
                &self.facts,
                event_dedup.survivors,
                &held_keys,
                parallel,
            )?;
            absorb_bind(&mut counts, &mut overlaps, &mut unresolvable, bound);

            if let Some(storage) = &self.storage {
                self.binder.persist(storage)?;
            }
        }

        // Validate
        let validation = self.validate();
        counts.invariant_violation = validation.violations.len() as u64;

        // Advance or halt
        let mut report = BatchReport {
            batch_id,
            stream: stream.to_string(),
            started_at,
            finished_at: started_at,
            counts,
            malformed,
            rejected,
            overlaps,
            unresolvable,
            validation,
            cancelled,
            entities_watermark: self.watermarks.position(&entities),
            events_watermark: self.watermarks.position(&event_cursor),
            entities_advanced: false,
            events_advanced: false,
        };

        if !report.passed() {
            let reason = format!(
                "batch {} failed validation: {} overlap_violations={}",
                batch_id,
                report.validation.summary(),
                report.overlaps.len()
            );
            error!("{}", reason);
            *self.halted.lock() = Some(reason);
        } else if !cancelled {
            let entity_target = match held_seq {
                Some(seq) => Some(seq_marker(seq) - 1),
                None => entities_high,
            };
            if let Some(target) = entity_target {
                report.entities_advanced = self.watermarks.advance(&entities, target)?;
            }
            if let Some(target) = events_high {
                report.events_advanced = self.watermarks.advance(&event_cursor, target)?;
            }
            report.entities_watermark = self.watermarks.position(&entities);
            report.events_watermark = self.watermarks.position(&event_cursor);
        }

        // A cancel that lands after binding started is cleared too, so it
        // never leaks into the next batch.
        if self.cancel.take() && !cancelled {
            warn!(batch_id = %batch_id, "cancel arrived after binding started, batch ran to completion");
        }

        report.finished_at = Utc::now().timestamp_millis();
        if let Some(storage) = &self.storage {
            let json = serde_json::to_string(&report).map_err(anyhow::Error::from)?;
            storage.record_batch(&batch_id.to_string(), stream, report.passed(), &json)?;
        }
        report.counts.publish(stream);

        info!(
            batch_id = %batch_id,
            stream,
            passed = report.passed(),
            new = report.counts.new,
            changed = report.counts.changed,
            unchanged = report.counts.unchanged,
            rejected = report.counts.rejected(),
            facts_bound = report.counts.facts_bound,
            orphaned = report.counts.orphaned_fact,
            deferred_in_flight = report.counts.deferred_in_flight,
            duplicate_removed = report.counts.duplicate_removed,
            "batch finished"
        );
        Ok(report)
    }

    fn commit_all(&self, classified: &[ClassifiedSnapshot], parallel: bool) -> Vec<KeyResult> {
        let commit_one = |c: &ClassifiedSnapshot| -> KeyResult {
            if let Classification::Unchanged { current } = c.classification {
                return KeyResult::Committed(CommitOutcome::Skipped { current });
            }
            if self.cancel.is_cancelled() {
                return KeyResult::Cancelled;
            }
            match self.dims.commit_classified(c) {
                Ok(outcome) => KeyResult::Committed(outcome),
                Err(e) => KeyResult::Rejected(e),
            }
        };
        if parallel {
            classified.par_iter().map(commit_one).collect()
        } else {
            classified.iter().map(commit_one).collect()
        }
    }
}

fn seq_marker(seq: u64) -> i64 {
    i64::try_from(seq).unwrap_or(i64::MAX)
}

fn absorb_bind(
    counts: &mut BatchMetrics,
    overlaps: &mut Vec<String>,
    unresolvable: &mut Vec<String>,
    outcome: BindOutcome,
) {
    counts.facts_bound += outcome.bound.len() as u64;
    counts.duplicate_fact_skipped += outcome.duplicates_skipped;
    counts.orphaned_fact += outcome.orphaned.len() as u64;
    counts.deferred_in_flight += outcome.in_flight.len() as u64;
    counts.unresolvable_fact += outcome.unresolvable.len() as u64;
    counts.overlap_violation += outcome.overlaps.len() as u64;
    counts.malformed_record += outcome.malformed;
    overlaps.extend(outcome.overlaps.iter().map(|e| e.to_string()));
    unresolvable.extend(outcome.unresolvable.into_iter().map(|u| u.event_key));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scd::dimension_store::KeyState;
    use crate::scd::types::{Attributes, DimensionVersion, Measures, SurrogateKey, VALID_TO_OPEN};
    use serde_json::json;
    use std::time::Duration;

    fn config() -> EngineConfig {
        EngineConfig {
            tracked_attributes: vec!["tier".to_string()],
            commit_timeout_ms: 50,
            ..Default::default()
        }
    }

    fn snap(key: &str, tier: &str, seq: u64, ts: i64) -> RawEntitySnapshot {
        let mut attrs = Attributes::new();
        attrs.insert("tier".into(), json!(tier));
        RawEntitySnapshot::new(key, attrs, seq, ts)
    }

    fn event(id: &str, key: &str, ts: i64, amount: f64, arrival: i64) -> RawEventRecord {
        let mut m = Measures::new();
        m.insert("amount".into(), amount);
        RawEventRecord::new(id, key, ts, m, arrival)
    }

    #[test]
    fn test_timeline_and_binding() {
        let driver = PipelineDriver::in_memory(config());
        let r1 = driver
            .run_batch("customers", vec![snap("C1", "standard", 1, 1)], vec![])
            .unwrap();
        assert_eq!(r1.counts.new, 1);
        assert!(r1.entities_advanced);

        let r2 = driver
            .run_batch(
                "customers",
                vec![snap("C1", "premium", 2, 5)],
                vec![event("E1", "C1", 3, 42.0, 6), event("E2", "C1", 7, 10.0, 7)],
            )
            .unwrap();
        assert_eq!(r2.counts.changed, 1);
        assert_eq!(r2.counts.facts_bound, 2);
        assert!(r2.passed());

        let history = driver.dimensions().history("C1");
        assert_eq!((history[0].valid_from, history[0].valid_to), (1, 5));
        assert_eq!((history[1].valid_from, history[1].valid_to), (5, VALID_TO_OPEN));
        let e1 = driver.facts().get_by_event("E1").unwrap();
        let e2 = driver.facts().get_by_event("E2").unwrap();
        assert_eq!(e1.dimension_key, history[0].surrogate_key);
        assert_eq!(e2.dimension_key, history[1].surrogate_key);
    }

    #[test]
    fn test_watermark_skips_processed_records() {
        let driver = PipelineDriver::in_memory(config());
        let batch = vec![snap("C1", "standard", 1, 1), snap("C2", "gold", 2, 1)];
        driver.run_batch("customers", batch.clone(), vec![]).unwrap();
        let replay = driver.run_batch("customers", batch, vec![]).unwrap();
        assert_eq!(replay.counts.already_processed, 2);
        assert_eq!(replay.counts.new, 0);
        assert_eq!(driver.dimensions().len(), 2);
    }

    #[test]
    fn test_timeout_holds_entity_watermark() {
        let driver = PipelineDriver::in_memory(config());
        driver
            .run_batch("s", vec![snap("C1", "standard", 1, 1)], vec![])
            .unwrap();

        let report = driver
            .dimensions()
            .locks()
            .with_key("C1", None, || {
                std::thread::scope(|scope| {
                    scope
                        .spawn(|| {
                            driver.run_batch(
                                "s",
                                vec![snap("C1", "premium", 5, 5), snap("C2", "gold", 6, 5)],
                                vec![],
                            )
                        })
                        .join()
                        .unwrap()
                })
            })
            .unwrap()
            .unwrap();

        assert_eq!(report.counts.commit_timeout, 1);
        assert_eq!(report.counts.new, 1);
        assert_eq!(report.rejected[0].business_key, "C1");
        assert_eq!(report.entities_watermark, Some(4));

        // The held snapshot is re-read; C2 replays as UNCHANGED.
        let retry = driver
            .run_batch(
                "s",
                vec![snap("C1", "premium", 5, 5), snap("C2", "gold", 6, 5)],
                vec![],
            )
            .unwrap();
        assert_eq!(retry.counts.changed, 1);
        assert_eq!(retry.counts.unchanged, 1);
        assert_eq!(retry.entities_watermark, Some(6));
    }

    #[test]
    fn test_cancelled_batch_binds_nothing_and_holds_watermarks() {
        let driver = PipelineDriver::in_memory(config());
        driver.cancellation().cancel();
        let report = driver
            .run_batch(
                "s",
                vec![snap("C1", "standard", 1, 1)],
                vec![event("E1", "C1", 2, 1.0, 3)],
            )
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.counts.skipped_cancelled, 1);
        assert_eq!(report.counts.facts_bound, 0);
        assert!(report.validation.passed());
        assert_eq!(report.entities_watermark, None);
        assert_eq!(driver.dimensions().state("C1"), KeyState::Absent);

        let rerun = driver
            .run_batch(
                "s",
                vec![snap("C1", "standard", 1, 1)],
                vec![event("E1", "C1", 2, 1.0, 3)],
            )
            .unwrap();
        assert!(!rerun.cancelled);
        assert_eq!(rerun.counts.facts_bound, 1);
    }

    #[test]
    fn test_halt_refuses_batches_until_clean_validation() {
        let driver = PipelineDriver::in_memory(config());
        *driver.halted.lock() = Some("manual".to_string());

        let err = driver.run_batch("s", vec![], vec![]).unwrap_err();
        assert!(matches!(err, PipelineError::Halted { .. }));

        let report = driver.resume_after_investigation();
        assert!(report.passed());
        assert!(!driver.is_halted());
        assert!(driver.run_batch("s", vec![], vec![]).is_ok());
    }

    #[test]
    fn test_rejections_do_not_abort_siblings() {
        let driver = PipelineDriver::in_memory(config());
        driver
            .run_batch("s", vec![snap("C1", "standard", 1, 5)], vec![])
            .unwrap();
        let report = driver
            .run_batch(
                "s",
                vec![snap("C1", "premium", 2, 3), snap("C2", "gold", 3, 3)],
                vec![],
            )
            .unwrap();
        assert_eq!(report.counts.out_of_order_update, 1);
        assert_eq!(report.counts.new, 1);
        assert!(report.passed());
        assert_eq!(report.entities_watermark, Some(3));
        assert_eq!(
            driver.dimensions().current("C1").unwrap().surrogate_key,
            SurrogateKey(1)
        );
    }

    #[test]
    fn test_timed_out_key_defers_its_events() {
        let driver = PipelineDriver::in_memory(config());
        driver
            .run_batch("s", vec![snap("C1", "standard", 1, 1)], vec![])
            .unwrap();

        let report = driver
            .dimensions()
            .locks()
            .with_key("C1", None, || {
                std::thread::scope(|scope| {
                    scope
                        .spawn(|| {
                            driver.run_batch(
                                "s",
                                vec![snap("C1", "premium", 5, 5)],
                                vec![event("E1", "C1", 7, 10.0, 8)],
                            )
                        })
                        .join()
                        .unwrap()
                })
            })
            .unwrap()
            .unwrap();

        assert_eq!(report.counts.commit_timeout, 1);
        assert_eq!(report.counts.facts_bound, 0);
        assert_eq!(report.counts.deferred_in_flight, 1);
        assert_eq!(report.counts.orphaned_fact, 0);
        assert!(driver.facts().get_by_event("E1").is_none());

        let retry = driver
            .run_batch("s", vec![snap("C1", "premium", 5, 5)], vec![])
            .unwrap();
        assert_eq!(retry.counts.changed, 1);
        assert_eq!(retry.counts.deferred_resolved, 1);
        assert!(retry.validation.stale_bindings.is_empty());

        let covering = driver.dimensions().as_of("C1", 7).unwrap();
        assert_eq!(covering.attributes["tier"], json!("premium"));
        assert_eq!(
            driver.facts().get_by_event("E1").unwrap().dimension_key,
            covering.surrogate_key
        );
    }

    #[test]
    fn test_overlapping_timeline_halts_on_bind() {
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
        let config = config();
        let tracked = TrackedAttributes::new(config.tracked_attributes.iter());
        let dims = DimensionStore::open(Arc::clone(&storage), tracked.clone()).unwrap();
        let binder = FactBinder::new(config.max_fact_retries);
        let driver = PipelineDriver::assemble(
            config,
            Some(storage),
            dims,
            FactStore::in_memory(),
            binder,
            WatermarkStore::in_memory(),
            tracked,
        );

        let report = driver
            .run_batch("s", vec![], vec![event("E1", "C1", 7, 1.0, 8)])
            .unwrap();
        assert_eq!(report.counts.overlap_violation, 1);
        assert_eq!(report.counts.facts_bound, 0);
        assert!(!report.passed());
        assert!(!report.events_advanced);
        assert_eq!(report.events_watermark, None);
        assert!(driver.is_halted());
        assert_eq!(driver.binder().unresolvable()[0].event_key, "E1");
        assert!(driver.binder().deferred().is_empty());

        let err = driver.run_batch("s", vec![], vec![]).unwrap_err();
        assert!(matches!(err, PipelineError::Halted { .. }));
    }

    #[test]
    fn test_late_cancel_does_not_leak_into_next_batch() {
        let driver = PipelineDriver::in_memory(config());
        driver
            .run_batch("s", vec![snap("C1", "standard", 1, 1)], vec![])
            .unwrap();
        let cancel = driver.cancellation();

        // The batch blocks on C1 while binding; the cancel lands meanwhile.
        driver.dimensions().locks().with_key("C1", None, || {
            std::thread::scope(|scope| {
                let batch = scope.spawn(|| {
                    driver.run_batch("s", vec![], vec![event("E1", "C1", 3, 1.0, 4)])
                });
                std::thread::sleep(Duration::from_millis(10));
                cancel.cancel();
                batch.join().unwrap().unwrap();
            })
        });
        assert!(!cancel.is_cancelled());

        let next = driver
            .run_batch("s", vec![snap("C2", "gold", 2, 2)], vec![])
            .unwrap();
        assert!(!next.cancelled);
        assert_eq!(next.counts.new, 1);
        assert_eq!(next.counts.skipped_cancelled, 0);
    }
}
