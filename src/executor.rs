// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batch executor: drives a [`SyncPlan`] into the adapters.
//!
//! # Batch Order
//!
//! ```text
//! destination upserts ─→ destination deletes ─→ source upserts ─→ source deletes
//! (each split into sequential batches of `batch_size`, keys ascending)
//! ```
//!
//! The source lane only has work for bidirectional plans.
//!
//! # Per Batch
//!
//! 1. Stop signal checked. Once set, no further batch starts.
//! 2. Rate limiter token (when throttling is on).
//! 3. `write_batch` through the destination's circuit breaker. Transient
//!    errors and open-circuit rejections retry with exponential backoff;
//!    fatal errors and exhausted retries end the run `Failed`.
//! 4. Checkpoint saved with the batch's last key. A failed save is fatal.
//!
//! Record-level rejections never abort: the batch commits and the run ends
//! `PartialSuccess`.
//!
//! # Watermarks
//!
//! Intermediate checkpoints carry the watermark the run planned against, so
//! a crashed run re-plans the same window. The final checkpoint is marked
//! `completed` and advances the watermark, unless some record failed or the
//! run resumed. A resumed run skips keys at or before its cursor even when
//! they changed after the crash, so the next run re-plans the old window.

use crate::adapter::{RecordAdapter, RecordFailure, WriteOutcome};
use crate::checkpoint::{BatchCursor, Checkpoint, CheckpointStore, Lane, MemoryCheckpointStore, Phase};
use crate::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitRegistry};
use crate::config::ExecutorConfig;
use crate::conflict::{ConflictQueue, MemoryConflictQueue};
use crate::error::{AdapterError, Result, SyncError};
use crate::events::{self, EventSink, SyncEvent, TracingEventSink};
use crate::job::JobState;
use crate::metrics;
use crate::planner::{SyncPlan, WritePlan};
use crate::profile::DEFAULT_BATCH_SIZE;
use crate::record::{Record, Value};
use crate::resilience::{RateLimiter, RetryConfig};
use chrono::Utc;
use serde::Serialize;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

// =============================================================================
// Stop signal
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    TimedOut,
}

impl StopReason {
    pub fn terminal_state(self) -> JobState {
        match self {
            Self::Cancelled => JobState::Cancelled,
            Self::TimedOut => JobState::TimedOut,
        }
    }
}

/// Cooperative stop request, checked at batch boundaries. The first reason
/// given wins.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<StopReason>>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.stop(StopReason::Cancelled);
    }

    pub fn time_out(&self) {
        self.stop(StopReason::TimedOut);
    }

    fn stop(&self, reason: StopReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<StopReason> {
        self.reason.get().copied()
    }

    /// Resolves once a stop is requested.
    pub async fn stopped(&self) {
        self.token.cancelled().await;
    }
}

// =============================================================================
// Run context
// =============================================================================

/// Everything one run needs, passed explicitly through the pipeline.
#[derive(Clone)]
pub struct RunContext {
    pub job_id: String,
    pub collection: String,
    pub source: Arc<dyn RecordAdapter>,
    pub destination: Arc<dyn RecordAdapter>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub events: Arc<dyn EventSink>,
    pub conflicts: Arc<dyn ConflictQueue>,
    pub retry: RetryConfig,
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub circuit: Arc<CircuitBreaker>,
    pub stop: StopSignal,
    pub batch_size: usize,
}

impl RunContext {
    /// In-memory checkpoints, tracing events and an in-memory conflict queue
    /// until replaced.
    pub fn new(
        job_id: impl Into<String>,
        collection: impl Into<String>,
        source: Arc<dyn RecordAdapter>,
        destination: Arc<dyn RecordAdapter>,
    ) -> Self {
        let circuit = Arc::new(CircuitBreaker::new(destination.name(), CircuitConfig::default()));
        Self {
            job_id: job_id.into(),
            collection: collection.into(),
            source,
            destination,
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
            events: Arc::new(TracingEventSink),
            conflicts: Arc::new(MemoryConflictQueue::new()),
            retry: RetryConfig::default(),
            rate_limiter: None,
            circuit,
            stop: StopSignal::new(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = store;
        self
    }

    pub fn with_events(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    pub fn with_conflicts(mut self, queue: Arc<dyn ConflictQueue>) -> Self {
        self.conflicts = queue;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn with_circuit(mut self, circuit: Arc<CircuitBreaker>) -> Self {
        self.circuit = circuit;
        self
    }

    pub fn with_stop(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Retry policy and throttling from `config`, and the destination's
    /// shared breaker from `circuits`.
    pub fn with_executor_config(mut self, config: &ExecutorConfig, circuits: &CircuitRegistry) -> Self {
        self.retry = config.retry_config();
        self.rate_limiter = config.rate_limit_config().map(|c| Arc::new(RateLimiter::new(c)));
        self.circuit = circuits.for_destination(self.destination.name());
        self
    }

    fn adapter(&self, lane: Lane) -> &dyn RecordAdapter {
        match lane {
            Lane::Destination => self.destination.as_ref(),
            Lane::Source => self.source.as_ref(),
        }
    }
}

// =============================================================================
// Result
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub job_id: String,
    pub status: JobState,
    pub records_read: usize,
    /// Upserts and deletes in the plan.
    pub records_planned: usize,
    pub records_written: usize,
    pub records_deleted: usize,
    /// Unchanged records, plus work a resumed run found already committed.
    pub records_skipped: usize,
    pub records_failed: usize,
    pub conflicts_detected: usize,
    pub conflicts_deferred: usize,
    pub batches_committed: u64,
    pub retries: usize,
    pub duration: Duration,
    pub error_detail: Option<String>,
    pub failures: Vec<RecordFailure>,
    pub dry_run: bool,
    /// Batch index the run resumed after.
    pub resumed_after: Option<u64>,
}

impl SyncResult {
    pub fn new(job_id: impl Into<String>, status: JobState) -> Self {
        Self {
            job_id: job_id.into(),
            status,
            records_read: 0,
            records_planned: 0,
            records_written: 0,
            records_deleted: 0,
            records_skipped: 0,
            records_failed: 0,
            conflicts_detected: 0,
            conflicts_deferred: 0,
            batches_committed: 0,
            retries: 0,
            duration: Duration::ZERO,
            error_detail: None,
            failures: Vec::new(),
            dry_run: false,
            resumed_after: None,
        }
    }

    /// A run that ended before planning.
    pub fn failed(job_id: impl Into<String>, error: &SyncError) -> Self {
        Self {
            error_detail: Some(error.to_string()),
            ..Self::new(job_id, JobState::Failed)
        }
    }

    /// What executing `plan` would do, without touching any adapter.
    pub fn simulated(job_id: impl Into<String>, plan: &SyncPlan) -> Self {
        let mut result = Self::new(job_id, JobState::Success);
        result.apply_plan_counts(plan);
        result.dry_run = true;
        if !result.failures.is_empty() {
            result.status = JobState::PartialSuccess;
        }
        result
    }

    fn apply_plan_counts(&mut self, plan: &SyncPlan) {
        self.records_read = plan.records_read;
        self.records_planned = plan.destination.len() + plan.source.len();
        self.records_skipped = plan.skipped;
        self.conflicts_detected = plan.conflicts_detected;
        self.conflicts_deferred = plan.deferred.len();
        self.failures = plan.failures.clone();
        self.records_failed = self.failures.len();
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, JobState::Success | JobState::PartialSuccess)
    }
}

// =============================================================================
// Executor
// =============================================================================

enum Items<'p> {
    Upserts(&'p [Record]),
    Deletes(&'p [String]),
}

impl Items<'_> {
    fn len(&self) -> usize {
        match self {
            Items::Upserts(r) => r.len(),
            Items::Deletes(d) => d.len(),
        }
    }

    fn last_key(&self) -> Option<&str> {
        match self {
            Items::Upserts(r) => r.last().map(|r| r.key.as_str()),
            Items::Deletes(d) => d.last().map(String::as_str),
        }
    }

    fn to_write(&self) -> (Vec<Record>, Vec<String>) {
        match self {
            Items::Upserts(r) => (r.to_vec(), Vec::new()),
            Items::Deletes(d) => (Vec::new(), d.to_vec()),
        }
    }
}

struct Batch<'p> {
    lane: Lane,
    phase: Phase,
    items: Items<'p>,
}

/// Split the plan into batches, dropping whatever `resume` already covers.
/// Returns the batches and how many items were dropped.
fn batches<'p>(
    plan: &'p SyncPlan,
    batch_size: usize,
    resume: Option<&BatchCursor>,
) -> (Vec<Batch<'p>>, usize) {
    let lanes: [(Lane, &WritePlan); 2] = [(Lane::Destination, &plan.destination), (Lane::Source, &plan.source)];
    let mut out = Vec::new();
    let mut already_done = 0;

    for (lane, write_plan) in lanes {
        let upserts = &write_plan.upserts;
        let start = resume.map_or(0, |c| upserts.partition_point(|r| c.covers(lane, Phase::Upserts, &r.key)));
        already_done += start;
        for chunk in upserts[start..].chunks(batch_size) {
            out.push(Batch {
                lane,
                phase: Phase::Upserts,
                items: Items::Upserts(chunk),
            });
        }

        let deletes = &write_plan.deletes;
        let start = resume.map_or(0, |c| deletes.partition_point(|k| c.covers(lane, Phase::Deletes, k)));
        already_done += start;
        for chunk in deletes[start..].chunks(batch_size) {
            out.push(Batch {
                lane,
                phase: Phase::Deletes,
                items: Items::Deletes(chunk),
            });
        }
    }
    (out, already_done)
}

pub struct BatchExecutor<'c> {
    ctx: &'c RunContext,
}

impl<'c> BatchExecutor<'c> {
    pub fn new(ctx: &'c RunContext) -> Self {
        Self { ctx }
    }

    /// Execute `plan`, resuming after `last` when it is an unfinished run.
    #[instrument(skip_all, fields(job_id = %self.ctx.job_id, collection = %self.ctx.collection))]
    pub async fn execute(&self, plan: &SyncPlan, last: Option<&Checkpoint>) -> SyncResult {
        let ctx = self.ctx;
        let start = Instant::now();
        let mut result = SyncResult::new(&ctx.job_id, JobState::Success);
        result.apply_plan_counts(plan);

        let resume = last.and_then(Checkpoint::resume_cursor);
        let mut next_index = match last {
            Some(cp) if !cp.completed => {
                result.resumed_after = Some(cp.batch_index);
                cp.batch_index + 1
            }
            _ => 0,
        };
        let prior_watermark = last.and_then(|cp| cp.last_timestamp.clone());

        let (batches, already_done) = batches(plan, ctx.batch_size, resume);
        result.records_skipped += already_done;

        if let Some(cursor) = resume {
            info!(
                resume_cursor = %cursor,
                next_batch = next_index,
                already_done,
                "Resuming from checkpoint"
            );
        }
        debug!(batches = batches.len(), planned = result.records_planned, "Executing plan");

        let total = batches.len();
        let mut stopped_by = None;

        for (i, batch) in batches.iter().enumerate() {
            if let Some(reason) = ctx.stop.reason() {
                stopped_by = Some(reason);
                break;
            }

            let is_last = i + 1 == total;
            if let Err(e) = self.run_batch(batch, next_index, &mut result).await {
                error!(batch_index = next_index, error = %e, "Run aborted");
                metrics::record_batch_failure(&ctx.job_id, &e.class().to_string());
                result.status = JobState::Failed;
                result.error_detail = Some(e.to_string());
                break;
            }

            let watermark = if is_last {
                self.final_watermark(plan, &result, &prior_watermark)
            } else {
                prior_watermark.clone()
            };
            let cursor = batch
                .items
                .last_key()
                .map(|k| BatchCursor::new(batch.lane, batch.phase, k));
            if let Err(e) = self.checkpoint(next_index, cursor, watermark, is_last).await {
                error!(batch_index = next_index, error = %e, "Checkpoint save failed");
                result.status = JobState::Failed;
                result.error_detail = Some(e.to_string());
                break;
            }

            result.batches_committed += 1;
            next_index += 1;
        }

        if total == 0 && result.status == JobState::Success && !ctx.stop.is_stopped() {
            // nothing to write still closes the run and advances the watermark
            let watermark = self.final_watermark(plan, &result, &prior_watermark);
            if let Err(e) = self.checkpoint(next_index, None, watermark, true).await {
                result.status = JobState::Failed;
                result.error_detail = Some(e.to_string());
            }
        } else if total == 0 {
            stopped_by = ctx.stop.reason();
        }

        result.records_failed = result.failures.len();
        if result.status != JobState::Failed {
            result.status = match stopped_by {
                Some(reason) => reason.terminal_state(),
                None if result.records_failed > 0 => JobState::PartialSuccess,
                None => JobState::Success,
            };
        }
        result.duration = start.elapsed();

        info!(
            status = %result.status,
            written = result.records_written,
            deleted = result.records_deleted,
            skipped = result.records_skipped,
            failed = result.records_failed,
            batches = result.batches_committed,
            retries = result.retries,
            duration_ms = result.duration.as_millis() as u64,
            "Plan executed"
        );
        result
    }

    fn final_watermark(&self, plan: &SyncPlan, result: &SyncResult, prior: &Option<Value>) -> Option<Value> {
        if result.failures.is_empty() && result.resumed_after.is_none() {
            plan.high_watermark.clone().or_else(|| prior.clone())
        } else {
            prior.clone()
        }
    }

    async fn checkpoint(
        &self,
        batch_index: u64,
        cursor: Option<BatchCursor>,
        last_timestamp: Option<Value>,
        completed: bool,
    ) -> Result<()> {
        let checkpoint = Checkpoint {
            job_id: self.ctx.job_id.clone(),
            batch_index,
            cursor,
            last_timestamp,
            completed,
            saved_at: Utc::now(),
        };
        self.ctx.checkpoints.save(&self.ctx.job_id, checkpoint).await
    }

    async fn run_batch(&self, batch: &Batch<'_>, batch_index: u64, result: &mut SyncResult) -> Result<()> {
        let ctx = self.ctx;
        let adapter = ctx.adapter(batch.lane);
        let batch_start = Instant::now();

        if batch.phase == Phase::Deletes && !adapter.capabilities().supports_delete {
            if let Items::Deletes(keys) = &batch.items {
                warn!(adapter = adapter.name(), count = keys.len(), "Adapter cannot delete, keys left in place");
                result
                    .failures
                    .extend(keys.iter().map(|k| RecordFailure::new(k, "adapter does not support deletes")));
            }
            return Ok(());
        }

        if let Some(limiter) = &ctx.rate_limiter {
            limiter.acquire().await;
        }

        let outcome = self.write_with_retry(adapter, batch, batch_index, result).await?;

        debug!(
            batch_index,
            lane = ?batch.lane,
            phase = ?batch.phase,
            size = batch.items.len(),
            written = outcome.written,
            deleted = outcome.deleted,
            failed = outcome.failed.len(),
            "Batch committed"
        );
        metrics::record_batch_commit(
            &ctx.job_id,
            outcome.written,
            outcome.deleted,
            outcome.failed.len(),
            batch_start.elapsed(),
        );
        events::emit(
            ctx.events.as_ref(),
            SyncEvent::BatchCommitted {
                job_id: ctx.job_id.clone(),
                batch_index,
                written: outcome.written,
                deleted: outcome.deleted,
                failed: outcome.failed.len(),
            },
        )
        .await;

        result.records_written += outcome.written;
        result.records_deleted += outcome.deleted;
        result.failures.extend(outcome.failed);
        Ok(())
    }

    async fn write_with_retry(
        &self,
        adapter: &dyn RecordAdapter,
        batch: &Batch<'_>,
        batch_index: u64,
        result: &mut SyncResult,
    ) -> Result<WriteOutcome> {
        let ctx = self.ctx;
        let max_attempts = ctx.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let (upserts, deletes) = batch.items.to_write();
            let call = ctx
                .circuit
                .call(|| adapter.write_batch(&ctx.collection, upserts, deletes))
                .await;

            let err = match call {
                Ok(outcome) => return Ok(outcome),
                Err(CircuitError::Rejected) => SyncError::transient("write_batch", "destination circuit open"),
                Err(CircuitError::Inner(e)) => AdapterError::into_sync_error(e, "write_batch"),
            };

            if !err.is_retryable() {
                return Err(err);
            }
            if attempt >= max_attempts {
                warn!(batch_index, attempts = attempt, error = %err, "Retries exhausted");
                return Err(err);
            }

            let delay = ctx.retry.delay_for_attempt(attempt);
            warn!(
                batch_index,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient batch failure, retrying"
            );
            result.retries += 1;
            metrics::record_batch_retry(&ctx.job_id);
            events::emit(
                ctx.events.as_ref(),
                SyncEvent::BatchRetry {
                    job_id: ctx.job_id.clone(),
                    batch_index,
                    attempt,
                    error: err.to_string(),
                },
            )
            .await;
            tokio::time::sleep(delay).await;
        }
    }
}
