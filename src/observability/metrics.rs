//! Execution metrics registry
//!
//! - Counters only, monotonic
//! - Relaxed atomics; values are exact once all writers are done

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by all stages of a node
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    stages_compiled: AtomicU64,
    stages_failed: AtomicU64,
    bulk_requests_dispatched: AtomicU64,
    bulk_requests_failed: AtomicU64,
    bulk_items_succeeded: AtomicU64,
    bulk_items_failed: AtomicU64,
    indices_created: AtomicU64,
    fetch_requests: AtomicU64,
    fetch_rows_missing: AtomicU64,
    rows_exported: AtomicU64,
}

impl MetricsRegistry {
    /// Create a new registry with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_stages_compiled(&self) {
        self.stages_compiled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_stages_failed(&self) {
        self.stages_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_bulk_dispatched(&self) {
        self.bulk_requests_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_bulk_failed(&self) {
        self.bulk_requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the per-item outcome of one bulk response
    pub fn add_bulk_items(&self, succeeded: u64, failed: u64) {
        self.bulk_items_succeeded.fetch_add(succeeded, Ordering::Relaxed);
        self.bulk_items_failed.fetch_add(failed, Ordering::Relaxed);
    }

    pub fn increment_indices_created(&self) {
        self.indices_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_fetch_requests(&self) {
        self.fetch_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_fetch_rows_missing(&self, rows: u64) {
        self.fetch_rows_missing.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn add_rows_exported(&self, rows: u64) {
        self.rows_exported.fetch_add(rows, Ordering::Relaxed);
    }

    /// Get all metrics as a snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            stages_compiled: self.stages_compiled.load(Ordering::Relaxed),
            stages_failed: self.stages_failed.load(Ordering::Relaxed),
            bulk_requests_dispatched: self.bulk_requests_dispatched.load(Ordering::Relaxed),
            bulk_requests_failed: self.bulk_requests_failed.load(Ordering::Relaxed),
            bulk_items_succeeded: self.bulk_items_succeeded.load(Ordering::Relaxed),
            bulk_items_failed: self.bulk_items_failed.load(Ordering::Relaxed),
            indices_created: self.indices_created.load(Ordering::Relaxed),
            fetch_requests: self.fetch_requests.load(Ordering::Relaxed),
            fetch_rows_missing: self.fetch_rows_missing.load(Ordering::Relaxed),
            rows_exported: self.rows_exported.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of all counters
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub stages_compiled: u64,
    pub stages_failed: u64,
    pub bulk_requests_dispatched: u64,
    pub bulk_requests_failed: u64,
    pub bulk_items_succeeded: u64,
    pub bulk_items_failed: u64,
    pub indices_created: u64,
    pub fetch_requests: u64,
    pub fetch_rows_missing: u64,
    pub rows_exported: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_registry_has_zero_values() {
        let registry = MetricsRegistry::new();
        assert_eq!(registry.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_bulk_counters() {
        let registry = MetricsRegistry::new();
        registry.increment_bulk_dispatched();
        registry.increment_bulk_dispatched();
        registry.add_bulk_items(150, 3);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.bulk_requests_dispatched, 2);
        assert_eq!(snapshot.bulk_items_succeeded, 150);
        assert_eq!(snapshot.bulk_items_failed, 3);
    }
}
