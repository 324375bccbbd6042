//! In-process counters for row-level storage traffic.
//!
//! Lightweight and lock-free so they can be bumped on every single-row
//! operation without overhead.

use std::sync::atomic::{AtomicU64, Ordering};

/// Registration name for the fetched-rows counter.
pub const ROWS_FETCHED_METRIC: &str = "SQLLayerRowsFetched";
/// Registration name for the stored-rows counter.
pub const ROWS_STORED_METRIC: &str = "SQLLayerRowsStored";
/// Registration name for the cleared-rows counter.
pub const ROWS_CLEARED_METRIC: &str = "SQLLayerRowsCleared";

/// Aggregated row operation counters.
#[derive(Debug, Default)]
pub struct StoreMetrics {
    /// Rows read through `fetch` and row decodes.
    rows_fetched: AtomicU64,
    /// Rows written through `store`.
    rows_stored: AtomicU64,
    /// Rows deleted through `clear`.
    rows_cleared: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub rows_fetched: u64,
    pub rows_stored: u64,
    pub rows_cleared: u64,
}

impl StoreMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_fetch(&self) {
        self.rows_fetched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store(&self) {
        self.rows_stored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_clear(&self) {
        self.rows_cleared.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            rows_fetched: self.rows_fetched.load(Ordering::Relaxed),
            rows_stored: self.rows_stored.load(Ordering::Relaxed),
            rows_cleared: self.rows_cleared.load(Ordering::Relaxed),
        }
    }

    /// Counters paired with their registration names, for export to an
    /// external metrics service.
    pub fn labeled(&self) -> [(&'static str, u64); 3] {
        let snapshot = self.snapshot();
        [
            (ROWS_FETCHED_METRIC, snapshot.rows_fetched),
            (ROWS_STORED_METRIC, snapshot.rows_stored),
            (ROWS_CLEARED_METRIC, snapshot.rows_cleared),
        ]
    }
}
