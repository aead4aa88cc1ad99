//! Per-batch metrics.
//!
//! Counters accumulate in-process while a batch runs and are published to the
//! `metrics` facade once at batch end. Without an installed recorder the
//! publish is a no-op.

use metrics::{counter, describe_counter};
use serde::{Deserialize, Serialize};

// =============================================================================
// METRIC NAMES
// =============================================================================

pub const MALFORMED_RECORD: &str = "dimflow_malformed_record_total";
pub const DUPLICATE_REMOVED: &str = "dimflow_duplicate_removed_total";
pub const VERSIONS_INSERTED: &str = "dimflow_versions_inserted_total";
pub const COMMIT_REJECTED: &str = "dimflow_commit_rejected_total";
pub const FACTS_BOUND: &str = "dimflow_facts_bound_total";
pub const ORPHANED_FACT: &str = "dimflow_orphaned_fact_total";
pub const DEFERRED_IN_FLIGHT: &str = "dimflow_deferred_in_flight_total";
pub const UNRESOLVABLE_FACT: &str = "dimflow_unresolvable_fact_total";
pub const OVERLAP_VIOLATION: &str = "dimflow_overlap_violation_total";
pub const INVARIANT_VIOLATION: &str = "dimflow_invariant_violation_total";

/// Registers metric descriptions. Call once after installing a recorder.
pub fn register_metrics() {
    describe_counter!(MALFORMED_RECORD, "Raw records skipped for a missing key");
    describe_counter!(DUPLICATE_REMOVED, "Raw records dropped by deduplication");
    describe_counter!(VERSIONS_INSERTED, "Dimension versions inserted");
    describe_counter!(COMMIT_REJECTED, "Per-key commits rejected, by reason");
    describe_counter!(FACTS_BOUND, "Facts appended to the fact log");
    describe_counter!(ORPHANED_FACT, "Events deferred for lack of a covering version");
    describe_counter!(DEFERRED_IN_FLIGHT, "Events deferred while their entity commit was pending");
    describe_counter!(UNRESOLVABLE_FACT, "Deferred events that exhausted their retries");
    describe_counter!(OVERLAP_VIOLATION, "Events matching more than one version");
    describe_counter!(INVARIANT_VIOLATION, "Post-commit invariant violations");
}

// =============================================================================
// BATCH COUNTERS
// =============================================================================

/// Counts for one batch, one field per report category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMetrics {
    pub malformed_record: u64,
    pub duplicate_removed: u64,
    pub already_processed: u64,
    pub new: u64,
    pub changed: u64,
    pub unchanged: u64,
    pub duplicate_current_version: u64,
    pub missing_current_version: u64,
    pub out_of_order_update: u64,
    pub commit_timeout: u64,
    pub storage_error: u64,
    pub skipped_cancelled: u64,
    pub facts_bound: u64,
    pub duplicate_fact_skipped: u64,
    pub orphaned_fact: u64,
    pub deferred_in_flight: u64,
    pub deferred_resolved: u64,
    pub unresolvable_fact: u64,
    pub overlap_violation: u64,
    pub invariant_violation: u64,
}

impl BatchMetrics {
    /// Bump the counter for a commit rejection category
    /// (see `CommitError::category`).
    pub fn record_rejection(&mut self, category: &str) {
        match category {
            "duplicate_current_version" => self.duplicate_current_version += 1,
            "missing_current_version" => self.missing_current_version += 1,
            "out_of_order_update" => self.out_of_order_update += 1,
            "commit_timeout" => self.commit_timeout += 1,
            _ => self.storage_error += 1,
        }
    }

    pub fn rejected(&self) -> u64 {
        self.duplicate_current_version
            + self.missing_current_version
            + self.out_of_order_update
            + self.commit_timeout
            + self.storage_error
    }

    /// Push this batch's counts to the installed recorder.
    pub fn publish(&self, stream: &str) {
        let s = stream.to_string();
        counter!(MALFORMED_RECORD, self.malformed_record, "stream" => s.clone());
        counter!(DUPLICATE_REMOVED, self.duplicate_removed, "stream" => s.clone());
        counter!(VERSIONS_INSERTED, self.new + self.changed, "stream" => s.clone());
        for (reason, n) in [
            ("duplicate_current_version", self.duplicate_current_version),
            ("missing_current_version", self.missing_current_version),
            ("out_of_order_update", self.out_of_order_update),
            ("commit_timeout", self.commit_timeout),
            ("storage_error", self.storage_error),
        ] {
            if n > 0 {
                counter!(COMMIT_REJECTED, n, "stream" => s.clone(), "reason" => reason);
            }
        }
        counter!(FACTS_BOUND, self.facts_bound, "stream" => s.clone());
        counter!(ORPHANED_FACT, self.orphaned_fact, "stream" => s.clone());
        counter!(DEFERRED_IN_FLIGHT, self.deferred_in_flight, "stream" => s.clone());
        counter!(UNRESOLVABLE_FACT, self.unresolvable_fact, "stream" => s.clone());
        counter!(OVERLAP_VIOLATION, self.overlap_violation, "stream" => s.clone());
        counter!(INVARIANT_VIOLATION, self.invariant_violation, "stream" => s);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_rejection_buckets() {
        let mut m = BatchMetrics::default();
        m.record_rejection("out_of_order_update");
        m.record_rejection("commit_timeout");
        m.record_rejection("commit_timeout");
        m.record_rejection("something_else");
        assert_eq!(m.out_of_order_update, 1);
        assert_eq!(m.commit_timeout, 2);
        assert_eq!(m.storage_error, 1);
        assert_eq!(m.rejected(), 4);
    }

    #[test]
    fn test_publish_without_recorder_is_noop() {
        let m = BatchMetrics {
            duplicate_removed: 1,
            ..Default::default()
        };
        m.publish("customers");
    }
}
