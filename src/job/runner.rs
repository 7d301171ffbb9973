// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One run of one job.
//!
//! # Pipeline
//!
//! ```text
//! validate profile → load checkpoint → connect both sides
//!     → read source (filter, strip, map) + read destination
//!     → plan (watermark from the checkpoint)
//!     → enqueue deferred conflicts → execute batches
//! ```
//!
//! Connects and reads retry transient errors with the run's backoff. A stop
//! request while reading ends the run without writing anything. A deadline
//! is enforced by a supervising task that stops the run with reason
//! `TimedOut`; the executor drains the in-flight batch first.

use crate::adapter::{collect_records, ReadFilter};
use crate::config::JobConfig;
use crate::conflict::enqueue_deferred;
use crate::error::Result;
use crate::events::{self, SyncEvent};
use crate::executor::{BatchExecutor, RunContext, StopReason, StopSignal, SyncResult};
use crate::job::{JobState, JobStateMachine};
use crate::metrics;
use crate::planner::{self, PlanInput};
use crate::record::Record;
use crate::resilience::RetryConfig;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

/// A configured job bound to its adapters, ready to run once.
pub struct SyncJob {
    config: JobConfig,
    ctx: RunContext,
    state: Arc<JobStateMachine>,
}

struct Inputs {
    source: Vec<Record>,
    dest: Vec<Record>,
    read: usize,
    filtered: usize,
}

impl SyncJob {
    /// The profile's batch size overrides the context's.
    pub fn new(config: JobConfig, ctx: RunContext) -> Self {
        let mut ctx = ctx.with_batch_size(config.profile.batch_size);
        ctx.job_id = config.job_id.clone();
        ctx.collection = config.collection.clone();
        let state = Arc::new(JobStateMachine::new(&config.job_id));
        Self { config, ctx, state }
    }

    pub fn job_id(&self) -> &str {
        &self.config.job_id
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn state(&self) -> Arc<JobStateMachine> {
        Arc::clone(&self.state)
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.ctx.stop.clone()
    }

    /// Run to a terminal state. Never returns an error: failures end up in
    /// the result's status and `error_detail`.
    #[instrument(skip_all, fields(job_id = %self.config.job_id, mode = %self.config.profile.mode))]
    pub async fn run(self) -> SyncResult {
        let start = Instant::now();
        let job_id = self.config.job_id.clone();

        if let Err(e) = self.state.transition(JobState::Running) {
            warn!(error = %e, "Job cannot start");
            let mut result = SyncResult::new(&job_id, self.state.state());
            result.error_detail = Some(e.to_string());
            return result;
        }
        self.emit_state(JobState::Running).await;

        let deadline = self
            .config
            .timeout_duration()
            .map(|limit| spawn_deadline(limit, self.ctx.stop.clone()));

        let mut result = match self.pipeline().await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, class = %e.class(), "Run failed before writing");
                SyncResult::failed(&job_id, &e)
            }
        };

        if let Some(handle) = deadline {
            handle.abort();
        }
        result.duration = start.elapsed();
        result.dry_run |= self.config.dry_run;

        if let Err(e) = self.state.transition(result.status) {
            warn!(error = %e, "Unexpected final state");
        }
        self.emit_state(result.status).await;
        events::emit(
            self.ctx.events.as_ref(),
            SyncEvent::RunFinished {
                job_id: job_id.clone(),
                status: result.status.to_string(),
                records_written: result.records_written,
                records_failed: result.records_failed,
                duration_ms: result.duration.as_millis() as u64,
            },
        )
        .await;
        metrics::record_job_run(&job_id, &result.status.to_string(), result.duration);

        info!(
            status = %result.status,
            read = result.records_read,
            planned = result.records_planned,
            written = result.records_written,
            deleted = result.records_deleted,
            failed = result.records_failed,
            dry_run = result.dry_run,
            duration_ms = result.duration.as_millis() as u64,
            "Job run finished"
        );
        result
    }

    async fn pipeline(&self) -> Result<SyncResult> {
        let ctx = &self.ctx;
        let profile = &self.config.profile;
        profile.validate()?;

        let last = ctx.checkpoints.load(&ctx.job_id).await?;
        let watermark = last.as_ref().and_then(|cp| cp.last_timestamp.clone());

        let inputs = tokio::select! {
            biased;
            _ = ctx.stop.stopped() => return Ok(self.stopped_before_writes()),
            inputs = self.read_inputs() => inputs?,
        };

        let excluded = profile.exclusion_set();
        let mut plan = planner::plan(
            profile.mode,
            &PlanInput {
                source: &inputs.source,
                dest: &inputs.dest,
                profile,
                excluded: &excluded,
                watermark: watermark.as_ref(),
            },
        );
        plan.records_read = inputs.read;
        plan.skipped += inputs.filtered;
        if !plan.source.upserts.is_empty() {
            plan.source.upserts = std::mem::take(&mut plan.source.upserts)
                .into_iter()
                .map(|r| profile.restore_source_names(r))
                .collect();
        }
        metrics::record_plan_failures(&ctx.job_id, plan.failures.len());
        debug!(
            dest_upserts = plan.destination.upserts.len(),
            dest_deletes = plan.destination.deletes.len(),
            source_upserts = plan.source.upserts.len(),
            source_deletes = plan.source.deletes.len(),
            skipped = plan.skipped,
            conflicts = plan.conflicts_detected,
            deferred = plan.deferred.len(),
            "Plan built"
        );

        if self.config.dry_run {
            return Ok(SyncResult::simulated(&ctx.job_id, &plan));
        }

        if !plan.deferred.is_empty() {
            let count = enqueue_deferred(
                ctx.conflicts.as_ref(),
                plan.deferred.clone(),
                &ctx.job_id,
                &ctx.collection,
            )
            .await;
            events::emit(
                ctx.events.as_ref(),
                SyncEvent::ConflictsDeferred {
                    job_id: ctx.job_id.clone(),
                    count,
                },
            )
            .await;
        }

        Ok(BatchExecutor::new(ctx).execute(&plan, last.as_ref()).await)
    }

    async fn read_inputs(&self) -> Result<Inputs> {
        let ctx = &self.ctx;
        let retry = &ctx.retry;

        with_retry(retry, "connect_source", || async {
            ctx.source.connect().await.map_err(|e| e.into_sync_error("connect_source"))
        })
        .await?;
        with_retry(retry, "connect_destination", || async {
            ctx.destination
                .connect()
                .await
                .map_err(|e| e.into_sync_error("connect_destination"))
        })
        .await?;

        let raw = with_retry(retry, "read_source", || {
            collect_records(ctx.source.as_ref(), &ctx.collection, ReadFilter::all())
        })
        .await?;
        let read = raw.len();
        let source: Vec<Record> = raw
            .into_iter()
            .filter_map(|r| self.config.profile.prepare(r))
            .collect();
        let filtered = read - source.len();

        let dest = with_retry(retry, "read_destination", || {
            collect_records(ctx.destination.as_ref(), &ctx.collection, ReadFilter::all())
        })
        .await?;

        debug!(read, filtered, dest = dest.len(), "Inputs read");
        Ok(Inputs {
            source,
            dest,
            read,
            filtered,
        })
    }

    fn stopped_before_writes(&self) -> SyncResult {
        let reason = self.ctx.stop.reason().unwrap_or(StopReason::Cancelled);
        info!(reason = ?reason, "Stopped before planning");
        let mut result = SyncResult::new(&self.ctx.job_id, reason.terminal_state());
        result.error_detail = Some("stopped before planning".to_string());
        result
    }

    async fn emit_state(&self, state: JobState) {
        events::emit(
            self.ctx.events.as_ref(),
            SyncEvent::JobStateChanged {
                job_id: self.config.job_id.clone(),
                state: state.to_string(),
                at: Utc::now(),
            },
        )
        .await;
    }
}

/// Retry `op` while it fails transiently, with the run's backoff.
async fn with_retry<T, F, Fut>(retry: &RetryConfig, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = retry.delay_for_attempt(attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient error, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn spawn_deadline(limit: Duration, stop: StopSignal) -> JoinHandle<()> {
    let span = info_span!("job_deadline", limit_ms = limit.as_millis() as u64);
    tokio::spawn(
        async move {
            tokio::select! {
                biased;
                _ = stop.stopped() => {}
                _ = tokio::time::sleep(limit) => {
                    warn!("Deadline passed, stopping after the in-flight batch");
                    stop.time_out();
                }
            }
        }
        .instrument(span),
    )
}
