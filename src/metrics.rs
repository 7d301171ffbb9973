//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Batch commits, retries and record failures
//! - Checkpoint persistence
//! - Job lifecycle and scheduler occupancy
//! - Fingerprint builds, probes and diffs
//! - Conflict resolution
//! - Circuit breaker calls
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `collection_sync_` and follow Prometheus
//! conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! The library only calls the `metrics` facade; installing a recorder is
//! the host's business.

use crate::conflict::ConflictPolicy;
use crate::diff::ProbeStatus;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Batch Executor
// =============================================================================

/// Record a committed batch.
pub fn record_batch_commit(job_id: &str, written: usize, deleted: usize, failed: usize, duration: Duration) {
    let job = job_id.to_string();

    counter!("collection_sync_batches_committed_total", "job_id" => job.clone()).increment(1);
    counter!("collection_sync_records_written_total", "job_id" => job.clone()).increment(written as u64);
    counter!("collection_sync_records_deleted_total", "job_id" => job.clone()).increment(deleted as u64);

    if failed > 0 {
        counter!("collection_sync_records_failed_total", "job_id" => job.clone()).increment(failed as u64);
    }

    histogram!("collection_sync_batch_duration_seconds", "job_id" => job.clone()).record(duration.as_secs_f64());
    histogram!("collection_sync_batch_size", "job_id" => job).record((written + deleted + failed) as f64);
}

/// Record a batch retry after a transient error.
pub fn record_batch_retry(job_id: &str) {
    counter!("collection_sync_batch_retries_total", "job_id" => job_id.to_string()).increment(1);
}

/// Record a batch that aborted the run.
pub fn record_batch_failure(job_id: &str, class: &str) {
    counter!(
        "collection_sync_batch_failures_total",
        "job_id" => job_id.to_string(),
        "class" => class.to_string()
    )
    .increment(1);
}

/// Records left out of the plan because they could not be encoded.
pub fn record_plan_failures(job_id: &str, count: usize) {
    if count > 0 {
        counter!("collection_sync_plan_failures_total", "job_id" => job_id.to_string()).increment(count as u64);
    }
}

// =============================================================================
// Checkpoints
// =============================================================================

pub fn record_checkpoint_save(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("collection_sync_checkpoint_saves_total", "status" => status).increment(1);
}

/// Record checkpoint SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn record_checkpoint_retry(operation: &str) {
    counter!("collection_sync_checkpoint_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Jobs and scheduler
// =============================================================================

/// Record a job state transition.
pub fn record_job_transition(job_id: &str, state: &str) {
    counter!(
        "collection_sync_job_transitions_total",
        "job_id" => job_id.to_string(),
        "state" => state.to_string()
    )
    .increment(1);
}

/// Record a finished run.
pub fn record_job_run(job_id: &str, status: &str, duration: Duration) {
    counter!(
        "collection_sync_job_runs_total",
        "job_id" => job_id.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("collection_sync_job_duration_seconds", "job_id" => job_id.to_string()).record(duration.as_secs_f64());
}

pub fn set_scheduler_queue_depth(depth: usize) {
    gauge!("collection_sync_scheduler_queue_depth").set(depth as f64);
}

pub fn set_running_jobs(count: usize) {
    gauge!("collection_sync_scheduler_running_jobs").set(count as f64);
}

pub fn record_job_rejected(reason: &str) {
    counter!("collection_sync_jobs_rejected_total", "reason" => reason.to_string()).increment(1);
}

// =============================================================================
// Integrity
// =============================================================================

pub fn record_fingerprint_build(records: u64, duration: Duration) {
    counter!("collection_sync_fingerprint_builds_total").increment(1);
    counter!("collection_sync_fingerprint_records_total").increment(records);
    histogram!("collection_sync_fingerprint_duration_seconds").record(duration.as_secs_f64());
}

pub fn record_probe(status: ProbeStatus) {
    counter!("collection_sync_probes_total", "status" => status.to_string()).increment(1);
}

/// Record a full key-level diff.
pub fn record_diff(missing: usize, extra: usize, mismatched: usize) {
    counter!("collection_sync_diffs_total").increment(1);
    counter!("collection_sync_diff_keys_total", "kind" => "missing").increment(missing as u64);
    counter!("collection_sync_diff_keys_total", "kind" => "extra").increment(extra as u64);
    counter!("collection_sync_diff_keys_total", "kind" => "mismatched").increment(mismatched as u64);
}

/// Record one destination's verification outcome.
pub fn record_integrity_check(destination: &str, status: &str) {
    counter!(
        "collection_sync_integrity_checks_total",
        "destination" => destination.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_reconcile(direction: &str, planned: usize, dry_run: bool) {
    counter!(
        "collection_sync_reconcile_runs_total",
        "direction" => direction.to_string(),
        "dry_run" => dry_run.to_string()
    )
    .increment(1);
    counter!("collection_sync_reconcile_planned_total", "direction" => direction.to_string()).increment(planned as u64);
}

// =============================================================================
// Conflicts
// =============================================================================

pub fn record_conflict(policy: ConflictPolicy) {
    counter!("collection_sync_conflicts_total", "policy" => policy.to_string()).increment(1);
}

pub fn record_conflict_enqueue_failure(job_id: &str) {
    counter!("collection_sync_conflict_enqueue_failures_total", "job_id" => job_id.to_string()).increment(1);
}

// =============================================================================
// Circuit Breaker
// =============================================================================

/// Record circuit breaker call outcome.
pub fn record_circuit_call(circuit_name: &str, outcome: &str) {
    counter!(
        "collection_sync_circuit_calls_total",
        "circuit" => circuit_name.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record an event sink that refused an event.
pub fn record_event_emit_failure(sink: &str) {
    counter!("collection_sync_event_emit_failures_total", "sink" => sink.to_string()).increment(1);
}
