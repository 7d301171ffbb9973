//! Priority scheduler with admission control.
//!
//! # Admission
//!
//! ```text
//! submit(job, priority)
//!   ├─ same job id queued or running? ──→ DuplicateJob
//!   ├─ dependencies close a cycle?    ──→ DependencyCycle
//!   └─ queue (Critical > Normal > Low, FIFO within a tier)
//!
//! pump: while running < max_parallel_jobs
//!   take the best queued job whose dependencies are neither queued nor running
//!   spawn: destination lease → run → release → pump
//! ```
//!
//! A destination whose adapter is not `concurrent_safe` is leased
//! exclusively, so two jobs never write to it at once. Cancelling a queued
//! job removes it and resolves its handle as `Cancelled`; cancelling a
//! running job stops it at the next batch boundary. A job that panics
//! resolves `Failed` and frees its slot.

use crate::config::SchedulerConfig;
use crate::error::{Result, SyncError};
use crate::executor::{StopSignal, SyncResult};
use crate::job::{DependencyGraph, JobState, JobStateMachine, Priority, SyncJob};
use crate::metrics;
use crate::resilience::DestinationLeases;
use futures::FutureExt;
use std::any::Any;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, info_span, warn, Instrument};

struct Queued {
    priority: Priority,
    sequence: u64,
    job: SyncJob,
    done: oneshot::Sender<SyncResult>,
}

impl Queued {
    fn job_id(&self) -> &str {
        self.job.job_id()
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    /// Max-heap order: higher priority first, then earlier submission.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Default)]
struct SchedulerState {
    queue: BinaryHeap<Queued>,
    queued: HashSet<String>,
    running: HashSet<String>,
    graph: DependencyGraph,
    sequence: u64,
}

impl SchedulerState {
    fn is_active(&self, job_id: &str) -> bool {
        self.queued.contains(job_id) || self.running.contains(job_id)
    }

    /// Best queued job whose dependencies are all settled.
    fn take_next(&mut self) -> Option<Queued> {
        let mut held = Vec::new();
        let mut picked = None;
        while let Some(candidate) = self.queue.pop() {
            let blocked = self
                .graph
                .dependencies(candidate.job_id())
                .iter()
                .any(|dep| self.is_active(dep));
            if blocked {
                held.push(candidate);
            } else {
                picked = Some(candidate);
                break;
            }
        }
        self.queue.extend(held);
        if let Some(q) = &picked {
            self.queued.remove(q.job_id());
        }
        picked
    }

    fn remove_queued(&mut self, job_id: &str) -> Option<Queued> {
        if !self.queued.remove(job_id) {
            return None;
        }
        let mut removed = None;
        let rest: Vec<Queued> = std::mem::take(&mut self.queue)
            .into_vec()
            .into_iter()
            .filter_map(|q| {
                if removed.is_none() && q.job_id() == job_id {
                    removed = Some(q);
                    None
                } else {
                    Some(q)
                }
            })
            .collect();
        self.queue = rest.into();
        removed
    }

    fn publish_gauges(&self) {
        metrics::set_scheduler_queue_depth(self.queue.len());
        metrics::set_running_jobs(self.running.len());
    }
}

struct Inner {
    config: SchedulerConfig,
    leases: Arc<DestinationLeases>,
    state: Mutex<SchedulerState>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Admits submitted jobs onto the tokio runtime.
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<Inner>,
}

impl JobScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_leases(config, Arc::new(DestinationLeases::new()))
    }

    /// Share destination leases with another scheduler or the host.
    pub fn with_leases(config: SchedulerConfig, leases: Arc<DestinationLeases>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                leases,
                state: Mutex::new(SchedulerState::default()),
            }),
        }
    }

    /// Queue `job` and start it as soon as a slot and its dependencies allow.
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, job: SyncJob, priority: Priority) -> Result<JobHandle> {
        let job_id = job.job_id().to_string();
        let mut state = self.inner.lock();

        if state.is_active(&job_id) {
            metrics::record_job_rejected("duplicate");
            warn!(job_id = %job_id, "Rejected duplicate submission");
            return Err(SyncError::DuplicateJob(job_id));
        }
        if let Err(e) = state.graph.declare(&job_id, &job.config().depends_on) {
            metrics::record_job_rejected("dependency_cycle");
            warn!(job_id = %job_id, error = %e, "Rejected submission");
            return Err(e);
        }

        let (done, result_rx) = oneshot::channel();
        let handle = JobHandle {
            job_id: job_id.clone(),
            stop: job.stop_signal(),
            state: job.state(),
            result_rx,
            scheduler: Arc::clone(&self.inner),
        };

        state.sequence += 1;
        let sequence = state.sequence;
        state.queued.insert(job_id.clone());
        state.queue.push(Queued {
            priority,
            sequence,
            job,
            done,
        });
        info!(job_id = %job_id, %priority, queued = state.queue.len(), "Job submitted");

        pump(&self.inner, &mut state);
        Ok(handle)
    }

    pub fn queued(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn running(&self) -> usize {
        self.inner.lock().running.len()
    }

    pub fn is_active(&self, job_id: &str) -> bool {
        self.inner.lock().is_active(job_id)
    }

    pub fn leases(&self) -> &Arc<DestinationLeases> {
        &self.inner.leases
    }

    pub fn max_parallel_jobs(&self) -> usize {
        self.inner.config.max_parallel_jobs
    }
}

/// Start queued jobs while slots are free.
fn pump(inner: &Arc<Inner>, state: &mut SchedulerState) {
    let limit = inner.config.max_parallel_jobs.max(1);
    while state.running.len() < limit {
        let Some(next) = state.take_next() else { break };
        let job_id = next.job_id().to_string();
        state.running.insert(job_id.clone());
        debug!(job_id = %job_id, running = state.running.len(), "Job admitted");
        spawn_job(Arc::clone(inner), next);
    }
    state.publish_gauges();
}

fn spawn_job(inner: Arc<Inner>, queued: Queued) {
    let Queued { priority, job, done, .. } = queued;
    let job_id = job.job_id().to_string();
    let span = info_span!("sync_job", job_id = %job_id, %priority);

    tokio::spawn(
        async move {
            let destination = Arc::clone(&job.context().destination);
            let stop = job.stop_signal();
            let concurrent_safe = destination.capabilities().concurrent_safe;

            let lease = tokio::select! {
                biased;
                _ = stop.stopped() => None,
                lease = inner.leases.acquire(destination.name(), concurrent_safe) => lease.ok(),
            };
            if lease.as_ref().is_some_and(|l| l.is_exclusive()) {
                debug!(destination = destination.name(), "Exclusive destination lease acquired");
            }
            // a stopped job still runs so it settles through the state machine
            let state = job.state();
            let result = match AssertUnwindSafe(job.run()).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => {
                    let detail = panic_message(panic.as_ref());
                    error!(panic = %detail, "Job panicked");
                    if let Err(e) = state.transition(JobState::Failed) {
                        warn!(error = %e, "Failed transition refused after panic");
                    }
                    SyncResult::failed(&job_id, &SyncError::Internal(format!("job panicked: {}", detail)))
                }
            };
            drop(lease);

            finish(&inner, &job_id);
            if done.send(result).is_err() {
                debug!("Job handle dropped before completion");
            }
        }
        .instrument(span),
    );
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn finish(inner: &Arc<Inner>, job_id: &str) {
    let mut state = inner.lock();
    state.running.remove(job_id);
    pump(inner, &mut state);
}

// =============================================================================
// Handle
// =============================================================================

/// Caller's view of a submitted job.
pub struct JobHandle {
    job_id: String,
    stop: StopSignal,
    state: Arc<JobStateMachine>,
    result_rx: oneshot::Receiver<SyncResult>,
    scheduler: Arc<Inner>,
}

impl JobHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn state(&self) -> JobState {
        self.state.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.state.subscribe()
    }

    /// Drop a queued job, or stop a running one at its next batch boundary.
    pub fn cancel(&self) {
        let removed = {
            let mut state = self.scheduler.lock();
            let removed = state.remove_queued(&self.job_id);
            if removed.is_some() {
                // dependents may have been waiting on it
                pump(&self.scheduler, &mut state);
            }
            removed
        };

        match removed {
            Some(queued) => {
                info!(job_id = %self.job_id, "Queued job cancelled");
                self.stop.cancel();
                if let Err(e) = self.state.transition(JobState::Cancelled) {
                    warn!(job_id = %self.job_id, error = %e, "Cancel transition refused");
                }
                let mut result = SyncResult::new(&self.job_id, JobState::Cancelled);
                result.error_detail = Some("cancelled while queued".to_string());
                let _ = queued.done.send(result);
            }
            None => {
                info!(job_id = %self.job_id, "Cancelling running job");
                self.stop.cancel();
            }
        }
    }

    /// Wait for the run's result.
    pub async fn wait(self) -> SyncResult {
        match self.result_rx.await {
            Ok(result) => result,
            Err(_) => {
                let err = SyncError::Internal(format!("job {} dropped without a result", self.job_id));
                SyncResult::failed(&self.job_id, &err)
            }
        }
    }
}
