// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the task sync engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `task_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `mode`: full, incremental
//! - `outcome`: success, failure, rejected
//! - `kind`: remote error kind (unavailable, protocol, auth, not_found)

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// SYNC CYCLES
// ═══════════════════════════════════════════════════════════════════════════

/// Record the outcome of one sync cycle
pub fn record_sync(mode: &str, outcome: &str) {
    counter!(
        "task_sync_cycles_total",
        "mode" => mode.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record sync cycle duration
pub fn record_sync_duration(mode: &str, duration: Duration) {
    histogram!(
        "task_sync_cycle_seconds",
        "mode" => mode.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a sync request refused because another cycle holds the lock
pub fn record_sync_rejected() {
    counter!("task_sync_rejected_total").increment(1);
}

/// Set consecutive failed cycles (0 after a success)
pub fn set_consecutive_failures(count: u32) {
    gauge!("task_sync_consecutive_failures").set(count as f64);
}

/// Set sync state (0 = Idle, 1 = Syncing, 2 = Failed)
pub fn set_sync_state(state: u8) {
    gauge!("task_sync_state").set(state as f64);
}

/// Record entities applied from a snapshot
pub fn record_applied(entity: &str, count: usize) {
    counter!(
        "task_sync_applied_total",
        "entity" => entity.to_string()
    )
    .increment(count as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// REMOTE
// ═══════════════════════════════════════════════════════════════════════════

/// Record a remote error by kind
pub fn record_remote_error(operation: &str, kind: &str) {
    counter!(
        "task_sync_remote_errors_total",
        "operation" => operation.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record a remote write outcome
pub fn record_write(operation: &str, outcome: &str) {
    counter!(
        "task_sync_writes_total",
        "operation" => operation.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// COMMENT CACHE
// ═══════════════════════════════════════════════════════════════════════════

/// Record comment resolution for a task set
pub fn record_comment_resolution(from_cache: usize, fetched: usize, failed: usize) {
    counter!("task_sync_comment_cache_hits_total").increment(from_cache as u64);
    counter!("task_sync_comment_fetches_total").increment(fetched as u64);
    counter!("task_sync_comment_fetch_failures_total").increment(failed as u64);
}

/// Set number of task ids held in the comment cache
pub fn set_comment_cache_entries(count: usize) {
    gauge!("task_sync_comment_cache_entries").set(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// METADATA / ORPHANS
// ═══════════════════════════════════════════════════════════════════════════

/// Record a metadata write dropped because a newer value is stored
pub fn record_stale_write(field: &str) {
    counter!(
        "task_sync_stale_metadata_writes_total",
        "field" => field.to_string()
    )
    .increment(1);
}

/// Record orphan scan results
pub fn record_orphans(local_only: usize, remote_only: usize) {
    gauge!("task_sync_orphans", "side" => "local").set(local_only as f64);
    gauge!("task_sync_orphans", "side" => "remote").set(remote_only as f64);
}

/// Record an applied merge decision
pub fn record_merge_decision(action: &str, outcome: &str) {
    counter!(
        "task_sync_merge_decisions_total",
        "action" => action.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// STORAGE
// ═══════════════════════════════════════════════════════════════════════════

/// Record storage operation latency
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "task_sync_storage_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Set mirrored entity count
pub fn set_mirrored(entity: &str, count: usize) {
    gauge!(
        "task_sync_mirrored_entities",
        "entity" => entity.to_string()
    )
    .set(count as f64);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.operation, self.start.elapsed());
    }
}
