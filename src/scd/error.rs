//! Error taxonomy.
//!
//! Per-key errors (`CommitError`, `BindError`) are isolated: the pipeline
//! records them and keeps going with sibling keys. Only `PipelineError`
//! aborts a batch.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::types::{Interval, SurrogateKey, Timestamp};

/// A raw record that cannot be processed. Skipped and counted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MalformedRecord {
    /// Position of the record in its input batch.
    pub position: usize,
    pub reason: String,
}

impl fmt::Display for MalformedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed record at position {}: {}", self.position, self.reason)
    }
}

impl std::error::Error for MalformedRecord {}

// =============================================================================
// COMMIT ERRORS
// =============================================================================

/// Rejection of one key's dimension commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitError {
    /// NEW was requested but the key already has a current version.
    DuplicateCurrentVersion {
        business_key: String,
        existing: SurrogateKey,
    },
    /// CHANGED was requested but the key has no current version.
    MissingCurrentVersion { business_key: String },
    /// The effective date does not move the timeline forward.
    OutOfOrderUpdate {
        business_key: String,
        effective_date: Timestamp,
        current_valid_from: Timestamp,
    },
    /// The key's writer lock could not be acquired in time.
    Timeout { business_key: String },
    /// The durable write failed; nothing was applied.
    Storage { business_key: String, message: String },
}

impl CommitError {
    pub fn business_key(&self) -> &str {
        match self {
            Self::DuplicateCurrentVersion { business_key, .. }
            | Self::MissingCurrentVersion { business_key }
            | Self::OutOfOrderUpdate { business_key, .. }
            | Self::Timeout { business_key }
            | Self::Storage { business_key, .. } => business_key,
        }
    }

    /// Stable category name, used in reports and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            Self::DuplicateCurrentVersion { .. } => "duplicate_current_version",
            Self::MissingCurrentVersion { .. } => "missing_current_version",
            Self::OutOfOrderUpdate { .. } => "out_of_order_update",
            Self::Timeout { .. } => "commit_timeout",
            Self::Storage { .. } => "storage_error",
        }
    }
}

impl fmt::Display for CommitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateCurrentVersion {
                business_key,
                existing,
            } => write!(
                f,
                "duplicate current version for {}: {} is already current",
                business_key, existing
            ),
            Self::MissingCurrentVersion { business_key } => {
                write!(f, "no current version to expire for {}", business_key)
            }
            Self::OutOfOrderUpdate {
                business_key,
                effective_date,
                current_valid_from,
            } => write!(
                f,
                "out-of-order update for {}: effective {} <= current valid_from {}",
                business_key, effective_date, current_valid_from
            ),
            Self::Timeout { business_key } => {
                write!(f, "timed out waiting for writer lock on {}", business_key)
            }
            Self::Storage {
                business_key,
                message,
            } => write!(f, "storage failure committing {}: {}", business_key, message),
        }
    }
}

impl std::error::Error for CommitError {}

// =============================================================================
// BIND ERRORS
// =============================================================================

/// Failure to bind an event to exactly one dimension version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindError {
    /// No version covers the event timestamp. Retryable.
    OrphanedFact {
        event_key: String,
        entity_key: String,
        event_ts: Timestamp,
    },
    /// The entity's writer lock stayed held past the timeout. Retryable.
    CommitInFlight { event_key: String, entity_key: String },
    /// More than one version covers the event timestamp. Fatal.
    OverlapViolation {
        entity_key: String,
        event_ts: Timestamp,
        matches: Vec<(SurrogateKey, Interval)>,
    },
    /// The event is missing a key.
    Malformed(MalformedRecord),
    /// The fact could not be appended durably.
    Storage { event_key: String, message: String },
}

impl BindError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::OrphanedFact { .. } | Self::CommitInFlight { .. })
    }
}

impl fmt::Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OrphanedFact {
                event_key,
                entity_key,
                event_ts,
            } => write!(
                f,
                "orphaned fact {}: no version of {} covers {}",
                event_key, entity_key, event_ts
            ),
            Self::CommitInFlight {
                event_key,
                entity_key,
            } => write!(
                f,
                "fact {} deferred: commit in flight for {}",
                event_key, entity_key
            ),
            Self::OverlapViolation {
                entity_key,
                event_ts,
                matches,
            } => {
                write!(f, "overlap violation for {} at {}:", entity_key, event_ts)?;
                for (sk, interval) in matches {
                    write!(f, " {}={}", sk, interval)?;
                }
                Ok(())
            }
            Self::Malformed(m) => m.fmt(f),
            Self::Storage { event_key, message } => {
                write!(f, "storage failure appending fact {}: {}", event_key, message)
            }
        }
    }
}

impl std::error::Error for BindError {}

// =============================================================================
// PIPELINE ERRORS
// =============================================================================

/// Batch-level failure.
#[derive(Debug)]
pub enum PipelineError {
    /// A previous validation failed and has not been cleared.
    Halted { reason: String },
    /// Storage or I/O failure outside a single key's commit.
    Storage(anyhow::Error),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Halted { reason } => write!(f, "pipeline halted: {}", reason),
            Self::Storage(e) => write!(f, "pipeline storage failure: {:#}", e),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Halted { .. } => None,
            Self::Storage(e) => Some(e.as_ref()),
        }
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(e: anyhow::Error) -> Self {
        Self::Storage(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_error_categories() {
        let e = CommitError::OutOfOrderUpdate {
            business_key: "C1".into(),
            effective_date: 3,
            current_valid_from: 5,
        };
        assert_eq!(e.category(), "out_of_order_update");
        assert_eq!(e.business_key(), "C1");
        assert!(e.to_string().contains("effective 3 <= current valid_from 5"));
    }

    #[test]
    fn test_only_orphans_are_retryable() {
        let orphan = BindError::OrphanedFact {
            event_key: "E1".into(),
            entity_key: "C3".into(),
            event_ts: 2,
        };
        let overlap = BindError::OverlapViolation {
            entity_key: "C1".into(),
            event_ts: 2,
            matches: vec![],
        };
        assert!(orphan.is_retryable());
        assert!(!overlap.is_retryable());
    }
}
