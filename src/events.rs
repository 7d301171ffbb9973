//! Status and audit events.
//!
//! The core emits a [`SyncEvent`] at every job transition, batch commit,
//! retry and verification. Sinks are fire-and-forget: [`emit`] logs a
//! failing sink at `warn` and moves on.

use crate::adapter::BoxFuture;
use crate::metrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    JobStateChanged {
        job_id: String,
        state: String,
        at: DateTime<Utc>,
    },
    BatchCommitted {
        job_id: String,
        batch_index: u64,
        written: usize,
        deleted: usize,
        failed: usize,
    },
    BatchRetry {
        job_id: String,
        batch_index: u64,
        attempt: usize,
        error: String,
    },
    ConflictsDeferred {
        job_id: String,
        count: usize,
    },
    RunFinished {
        job_id: String,
        status: String,
        records_written: usize,
        records_failed: usize,
        duration_ms: u64,
    },
    IntegrityChecked {
        collection: String,
        destination: String,
        status: String,
    },
}

impl SyncEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::JobStateChanged { .. } => "job_state_changed",
            Self::BatchCommitted { .. } => "batch_committed",
            Self::BatchRetry { .. } => "batch_retry",
            Self::ConflictsDeferred { .. } => "conflicts_deferred",
            Self::RunFinished { .. } => "run_finished",
            Self::IntegrityChecked { .. } => "integrity_checked",
        }
    }
}

pub trait EventSink: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn emit(&self, event: SyncEvent) -> BoxFuture<'_, ()>;
}

/// Emit without letting the sink fail the caller.
pub async fn emit(sink: &dyn EventSink, event: SyncEvent) {
    let kind = event.kind();
    if let Err(e) = sink.emit(event).await {
        warn!(sink = sink.name(), event = kind, error = %e, "Event sink rejected event");
        metrics::record_event_emit_failure(sink.name());
    }
}

/// Writes events to the `tracing` pipeline. The default sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn name(&self) -> &str {
        "tracing"
    }

    fn emit(&self, event: SyncEvent) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            match &event {
                SyncEvent::RunFinished { job_id, status, .. } => {
                    info!(job_id = %job_id, status = %status, event = ?event, "Sync run finished")
                }
                SyncEvent::IntegrityChecked { destination, status, .. } => {
                    info!(destination = %destination, status = %status, "Integrity check recorded")
                }
                other => debug!(event = ?other, "Sync event"),
            }
            Ok(())
        })
    }
}

/// Keeps every event. For tests and embedding hosts that poll.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<SyncEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().await.clone()
    }

    pub async fn count(&self, kind: &str) -> usize {
        self.events.lock().await.iter().filter(|e| e.kind() == kind).count()
    }
}

impl EventSink for MemoryEventSink {
    fn name(&self) -> &str {
        "memory"
    }

    fn emit(&self, event: SyncEvent) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.events.lock().await.push(event);
            Ok(())
        })
    }
}
