//! SCD2 Dimension Store
//!
//! Arena + index over every version ever committed. History is append-only:
//! the only mutation of an existing version is the expire step, which sets
//! `valid_to` and clears `is_current`.
//!
//! # Per-key state machine
//!
//! ```text
//!            NEW                      CHANGED (effective > valid_from)
//!  ABSENT ─────────▶ CURRENT(v1) ─────────────────────────▶ CURRENT(v2)
//!                        │   expire v1 at effective + insert v2, atomically
//!                        └── UNCHANGED: no transition
//! ```
//!
//! Writers take the key's lock from `KeyLocks` and then, for durable stores,
//! write through to SQLite before the in-memory index is updated. The index
//! write lock covers both steps of a CHANGED commit, so readers never see an
//! expired-but-not-replaced key.

use anyhow::Result;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::change_detector::{Classification, ClassifiedSnapshot, CurrentVersionLookup};
use super::error::CommitError;
use super::fingerprint::TrackedAttributes;
use super::key_locks::KeyLocks;
use super::storage::ScdStorage;
use super::types::{DimensionVersion, RawEntitySnapshot, SurrogateKey, Timestamp, VALID_TO_OPEN};

/// Observable state of one business key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Absent,
    Current(SurrogateKey),
}

/// What a successful commit did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// First version of the key.
    Inserted { surrogate_key: SurrogateKey },
    /// Expired the previous current version and inserted a new one.
    Versioned {
        expired: SurrogateKey,
        inserted: SurrogateKey,
    },
    /// Nothing to do (UNCHANGED, or a CHANGED classification that went stale
    /// because an identical version was committed meanwhile).
    Skipped { current: SurrogateKey },
}

#[derive(Debug, Default)]
struct KeyHistory {
    /// Interval index: `(valid_from, surrogate)` -> arena slot.
    intervals: BTreeMap<(Timestamp, SurrogateKey), usize>,
    current: Option<usize>,
}

#[derive(Debug, Default)]
struct DimensionIndex {
    arena: Vec<DimensionVersion>,
    by_surrogate: HashMap<SurrogateKey, usize>,
    by_key: HashMap<String, KeyHistory>,
}

impl DimensionIndex {
    fn push(&mut self, version: DimensionVersion) {
        let slot = self.arena.len();
        let history = self.by_key.entry(version.business_key.clone()).or_default();
        history
            .intervals
            .insert((version.valid_from, version.surrogate_key), slot);
        if version.is_current {
            history.current = Some(slot);
        }
        self.by_surrogate.insert(version.surrogate_key, slot);
        self.arena.push(version);
    }

    fn expire(&mut self, slot: usize, valid_to: Timestamp) {
        let version = &mut self.arena[slot];
        version.valid_to = valid_to;
        version.is_current = false;
        if let Some(history) = self.by_key.get_mut(&version.business_key) {
            if history.current == Some(slot) {
                history.current = None;
            }
        }
    }

    fn current(&self, key: &str) -> Option<&DimensionVersion> {
        self.by_key
            .get(key)
            .and_then(|h| h.current)
            .map(|slot| &self.arena[slot])
    }

    fn containing(&self, key: &str, ts: Timestamp) -> Vec<&DimensionVersion> {
        let Some(history) = self.by_key.get(key) else {
            return Vec::new();
        };
        history
            .intervals
            .range((Bound::Unbounded, Bound::Included((ts, SurrogateKey(u64::MAX)))))
            .rev()
            .map(|(_, slot)| &self.arena[*slot])
            .filter(|v| v.contains(ts))
            .collect()
    }
}

/// Versioned dimension store.
pub struct DimensionStore {
    index: RwLock<DimensionIndex>,
    locks: KeyLocks,
    tracked: TrackedAttributes,
    storage: Option<Arc<ScdStorage>>,
    next_key: AtomicU64,
    commit_timeout: Option<Duration>,
}

impl DimensionStore {
    /// Volatile store (for tests and dry runs).
    pub fn in_memory(tracked: TrackedAttributes) -> Self {
        Self {
            index: RwLock::new(DimensionIndex::default()),
            locks: KeyLocks::new(),
            tracked,
            storage: None,
            next_key: AtomicU64::new(1),
            commit_timeout: None,
        }
    }

    /// Durable store, rebuilt from everything `storage` holds.
    pub fn open(storage: Arc<ScdStorage>, tracked: TrackedAttributes) -> Result<Self> {
        let versions = storage.load_versions()?;
        let next = versions
            .iter()
            .map(|v| v.surrogate_key.0)
            .max()
            .unwrap_or(0)
            + 1;

        let mut index = DimensionIndex::default();
        let count = versions.len();
        for version in versions {
            index.push(version);
        }

        info!(versions = count, next_surrogate = next, "dimension store loaded");

        Ok(Self {
            index: RwLock::new(index),
            locks: KeyLocks::new(),
            tracked,
            storage: Some(storage),
            next_key: AtomicU64::new(next),
            commit_timeout: None,
        })
    }

    /// Bound lock acquisition for commits and binder reads.
    pub fn with_commit_timeout(mut self, timeout: Duration) -> Self {
        self.commit_timeout = Some(timeout);
        self
    }

    pub fn tracked(&self) -> &TrackedAttributes {
        &self.tracked
    }

    pub(crate) fn locks(&self) -> &KeyLocks {
        &self.locks
    }

    pub(crate) fn commit_timeout(&self) -> Option<Duration> {
        self.commit_timeout
    }

    // -------------------------------------------------------------------------
    // Commit
    // -------------------------------------------------------------------------

    /// Commit a classified snapshot.
    pub fn commit_classified(&self, classified: &ClassifiedSnapshot) -> Result<CommitOutcome, CommitError> {
        self.commit(
            &classified.business_key,
            classified.classification,
            &classified.snapshot,
            classified.snapshot.effective_date(),
        )
    }

    /// Apply one key's SCD2 transition.
    ///
    /// NEW inserts `[effective_date, inf)`. CHANGED expires the current version
    /// at `effective_date` and inserts `[effective_date, inf)`, both or neither.
    pub fn commit(
        &self,
        business_key: &str,
        classification: Classification,
        snapshot: &RawEntitySnapshot,
        effective_date: Timestamp,
    ) -> Result<CommitOutcome, CommitError> {
        let result = self
            .locks
            .with_key(business_key, self.commit_timeout, || {
                self.commit_locked(business_key, classification, snapshot, effective_date)
            })
            .unwrap_or_else(|| {
                Err(CommitError::Timeout {
                    business_key: business_key.to_string(),
                })
            });

        if let Err(e) = &result {
            warn!(key = %business_key, category = e.category(), "commit rejected: {}", e);
        }
        result
    }

    fn commit_locked(
        &self,
        business_key: &str,
        classification: Classification,
        snapshot: &RawEntitySnapshot,
        effective_date: Timestamp,
    ) -> Result<CommitOutcome, CommitError> {
        let fingerprint = self.tracked.fingerprint(&snapshot.attributes);
        let current = self.index.read().current(business_key).cloned();

        match (classification, current) {
            (Classification::Unchanged { current }, _) => Ok(CommitOutcome::Skipped { current }),

            (Classification::New, Some(existing)) => Err(CommitError::DuplicateCurrentVersion {
                business_key: business_key.to_string(),
                existing: existing.surrogate_key,
            }),

            (Classification::New, None) => {
                let version = self.new_version(business_key, snapshot, fingerprint, effective_date);
                let sk = version.surrogate_key;
                if let Some(storage) = &self.storage {
                    storage
                        .insert_version(&version)
                        .map_err(|e| storage_error(business_key, e))?;
                }
                self.index.write().push(version);
                debug!(key = %business_key, surrogate = %sk, valid_from = effective_date, "NEW version");
                Ok(CommitOutcome::Inserted { surrogate_key: sk })
            }

            (Classification::Changed { .. }, None) => Err(CommitError::MissingCurrentVersion {
                business_key: business_key.to_string(),
            }),

            (Classification::Changed { .. }, Some(existing)) => {
                if existing.fingerprint == fingerprint {
                    return Ok(CommitOutcome::Skipped {
                        current: existing.surrogate_key,
                    });
                }
                if effective_date <= existing.valid_from {
                    return Err(CommitError::OutOfOrderUpdate {
                        business_key: business_key.to_string(),
                        effective_date,
                        current_valid_from: existing.valid_from,
                    });
                }

                let version = self.new_version(business_key, snapshot, fingerprint, effective_date);
                let inserted = version.surrogate_key;
                if let Some(storage) = &self.storage {
                    storage
                        .expire_and_insert(existing.surrogate_key, effective_date, &version)
                        .map_err(|e| storage_error(business_key, e))?;
                }

                {
                    let mut index = self.index.write();
                    let slot = index.by_surrogate[&existing.surrogate_key];
                    index.expire(slot, effective_date);
                    index.push(version);
                }

                debug!(
                    key = %business_key,
                    expired = %existing.surrogate_key,
                    inserted = %inserted,
                    effective = effective_date,
                    "CHANGED version"
                );
                Ok(CommitOutcome::Versioned {
                    expired: existing.surrogate_key,
                    inserted,
                })
            }
        }
    }

    fn new_version(
        &self,
        business_key: &str,
        snapshot: &RawEntitySnapshot,
        fingerprint: String,
        effective_date: Timestamp,
    ) -> DimensionVersion {
        DimensionVersion {
            surrogate_key: SurrogateKey(self.next_key.fetch_add(1, Ordering::SeqCst)),
            business_key: business_key.to_string(),
            attributes: snapshot.attributes.clone(),
            fingerprint,
            valid_from: effective_date,
            valid_to: VALID_TO_OPEN,
            is_current: true,
        }
    }

    // -------------------------------------------------------------------------
    // Views
    // -------------------------------------------------------------------------

    pub fn state(&self, business_key: &str) -> KeyState {
        match self.index.read().current(business_key) {
            Some(v) => KeyState::Current(v.surrogate_key),
            None => KeyState::Absent,
        }
    }

    /// The `is_current` version of a key.
    pub fn current(&self, business_key: &str) -> Option<DimensionVersion> {
        self.index.read().current(business_key).cloned()
    }

    /// Every current version, sorted by business key.
    pub fn current_versions(&self) -> Vec<DimensionVersion> {
        let index = self.index.read();
        let mut out: Vec<DimensionVersion> = index
            .by_key
            .values()
            .filter_map(|h| h.current.map(|slot| index.arena[slot].clone()))
            .collect();
        out.sort_by(|a, b| a.business_key.cmp(&b.business_key));
        out
    }

    /// Point-in-time view: the version of `business_key` valid at `ts`.
    pub fn as_of(&self, business_key: &str, ts: Timestamp) -> Option<DimensionVersion> {
        self.index
            .read()
            .containing(business_key, ts)
            .first()
            .map(|v| (*v).clone())
    }

    /// Every version whose interval contains `ts`. More than one means the
    /// timeline is corrupt.
    pub fn versions_containing(&self, business_key: &str, ts: Timestamp) -> Vec<DimensionVersion> {
        self.index
            .read()
            .containing(business_key, ts)
            .into_iter()
            .cloned()
            .collect()
    }

    /// All versions of a key ordered by `valid_from`.
    pub fn history(&self, business_key: &str) -> Vec<DimensionVersion> {
        let index = self.index.read();
        index
            .by_key
            .get(business_key)
            .map(|h| h.intervals.values().map(|slot| index.arena[*slot].clone()).collect())
            .unwrap_or_default()
    }

    pub fn version(&self, sk: SurrogateKey) -> Option<DimensionVersion> {
        let index = self.index.read();
        index.by_surrogate.get(&sk).map(|slot| index.arena[*slot].clone())
    }

    /// Copy of every version in insertion order.
    pub fn all_versions(&self) -> Vec<DimensionVersion> {
        self.index.read().arena.clone()
    }

    pub fn len(&self) -> usize {
        self.index.read().arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn key_count(&self) -> usize {
        self.index.read().by_key.len()
    }

    /// True once any version of `business_key` has been committed.
    pub fn has_history(&self, business_key: &str) -> bool {
        self.index.read().by_key.contains_key(business_key)
    }
}

impl CurrentVersionLookup for DimensionStore {
    fn current_version(&self, business_key: &str) -> Option<DimensionVersion> {
        self.current(business_key)
    }
}

fn storage_error(business_key: &str, e: anyhow::Error) -> CommitError {
    CommitError::Storage {
        business_key: business_key.to_string(),
        message: format!("{:#}", e),
    }
}
