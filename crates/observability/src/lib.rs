//! Structured observability for the storage pipeline.
//!
//! Metrics are emitted as structured log events with process-wide counters,
//! so any subscriber (or log shipper) can derive rates without a separate
//! metrics pipeline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

static BATCHES_STORED_TOTAL: AtomicU64 = AtomicU64::new(0);
static ROWS_WRITTEN_TOTAL: AtomicU64 = AtomicU64::new(0);
static RECOVERIES_TOTAL: AtomicU64 = AtomicU64::new(0);
static STORE_FAILURES_TOTAL: AtomicU64 = AtomicU64::new(0);

fn duration_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Records a completed batch store with its latency and row count.
pub fn record_store_latency(part_id: Uuid, table: &str, rows: u64, duration: Duration) {
    let batches = BATCHES_STORED_TOTAL.fetch_add(1, Ordering::Relaxed) + 1;
    let total_rows = ROWS_WRITTEN_TOTAL.fetch_add(rows, Ordering::Relaxed) + rows;
    info!(
        metric = "store_latency_ms",
        part_id = %part_id,
        table,
        rows,
        latency_ms = duration_ms(duration),
        batches_stored_total = batches,
        rows_written_total = total_rows
    );
}

/// Records one recovery taken by the write engine (partition created,
/// column added or widened, insert switched to update, deadlock backoff).
pub fn record_recovery(part_id: Uuid, table: &str, kind: &str) {
    let total = RECOVERIES_TOTAL.fetch_add(1, Ordering::Relaxed) + 1;
    info!(
        metric = "write_recovery",
        part_id = %part_id,
        table,
        kind,
        recoveries_total = total
    );
}

/// Marks a batch store failure after the engine gave up.
pub fn record_store_failure(part_id: Uuid, table: &str, reason: &str) {
    let total = STORE_FAILURES_TOTAL.fetch_add(1, Ordering::Relaxed) + 1;
    warn!(
        metric = "store_failure",
        part_id = %part_id,
        table,
        reason,
        store_failures_total = total
    );
}

/// Records the latency of marking modification buckets.
pub fn record_mark_modified_latency(table: &str, duration: Duration) {
    info!(
        metric = "mark_modified_latency_ms",
        table,
        latency_ms = duration_ms(duration)
    );
}

/// Snapshot of the process-wide counters, for tests and health endpoints.
pub fn counters() -> (u64, u64, u64, u64) {
    (
        BATCHES_STORED_TOTAL.load(Ordering::Relaxed),
        ROWS_WRITTEN_TOTAL.load(Ordering::Relaxed),
        RECOVERIES_TOTAL.load(Ordering::Relaxed),
        STORE_FAILURES_TOTAL.load(Ordering::Relaxed),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let (batches_before, rows_before, ..) = counters();
        record_store_latency(Uuid::new_v4(), "node_main_15m_19478", 100, Duration::from_millis(12));
        let (batches_after, rows_after, ..) = counters();
        assert_eq!(batches_after, batches_before + 1);
        assert_eq!(rows_after, rows_before + 100);
    }
}
