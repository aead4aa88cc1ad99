//! Slowly-Changing Dimension Engine
//!
//! Type-2 versioned entity dimensions with point-in-time fact binding.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       PipelineDriver                            │
//! │  (one coordinator per stream, owns watermarks and halt state)   │
//! └─────────────────────────────────────────────────────────────────┘
//!          │ RawEntitySnapshot                    │ RawEventRecord
//!          ▼                                      ▼
//! ┌─────────────────┐                    ┌─────────────────┐
//! │  Deduplicator   │                    │  Deduplicator   │
//! │ (by business    │                    │ (by event key)  │
//! │  key, arrival)  │                    └────────┬────────┘
//! └────────┬────────┘                             │
//!          ▼                                      │
//! ┌─────────────────┐                             │
//! │ ChangeDetector  │ NEW / CHANGED / UNCHANGED   │
//! │ (fingerprints)  │                             │
//! └────────┬────────┘                             │
//!          ▼                                      ▼
//! ┌─────────────────┐   interval index   ┌─────────────────┐
//! │ DimensionStore  │◀───────────────────│   FactBinder    │
//! │ (KeyLocks, one  │                    │ (deferred queue,│
//! │  writer per key)│                    │  retry bound)   │
//! └────────┬────────┘                    └────────┬────────┘
//!          │                                      ▼
//!          │                             ┌─────────────────┐
//!          │                             │   FactStore     │
//!          │                             │  (append-only)  │
//!          │                             └────────┬────────┘
//!          └──────────────┬───────────────────────┘
//!                         ▼
//!                ┌─────────────────┐
//!                │    Validator    │──▶ advance watermark | halt
//!                └─────────────────┘
//! ```
//!
//! # Invariants
//!
//! - **Current**: every key with history has exactly one current version
//! - **Timeline**: `valid_to[i] == valid_from[i+1]` for adjacent versions
//! - **Append-only**: versions are only expired (`valid_to` set), never deleted;
//!   facts are never updated or re-pointed
//! - **Watermark**: moves only after a clean validation

pub mod change_detector;
pub mod config;
pub mod dedup;
pub mod dimension_store;
pub mod error;
pub mod fact_binder;
pub mod fact_store;
pub mod fingerprint;
pub mod key_locks;
pub mod metrics;
pub mod pipeline;
pub mod storage;
pub mod types;
pub mod validator;
pub mod watermark;

pub use change_detector::{ChangeDetector, Classification, ClassifiedSnapshot, CurrentVersionLookup};
pub use config::EngineConfig;
pub use dedup::{dedup_events, dedup_snapshots, DedupOutcome};
pub use dimension_store::{CommitOutcome, DimensionStore, KeyState};
pub use error::{BindError, CommitError, MalformedRecord, PipelineError};
pub use fact_binder::{BindOutcome, DeferredFact, FactBinder, UnresolvableFact};
pub use fact_store::FactStore;
pub use fingerprint::{TrackedAttributes, FINGERPRINT_VERSION};
pub use key_locks::KeyLocks;
pub use metrics::BatchMetrics;
pub use pipeline::{BatchReport, CancellationFlag, PipelineDriver, RejectedKey};
pub use storage::ScdStorage;
pub use types::{
    Attributes, DimensionVersion, FactKey, FactRecord, Interval, Measures, RawEntitySnapshot,
    RawEventRecord, SurrogateKey, Timestamp, VALID_TO_OPEN,
};
pub use validator::{
    InvariantCategory, InvariantViolation, StaleBinding, ValidationReport, Validator, ViolationType,
};
pub use watermark::{Watermark, WatermarkStore};
