//! Job state machine.
//!
//! # State Transitions
//!
//! ```text
//!            start()
//! Idle ───────────────→ Running ──┬──→ Success
//!   │                             ├──→ PartialSuccess
//!   │ (cancelled while queued)    ├──→ Failed
//!   ↓                             ├──→ TimedOut
//! Cancelled ←─────────────────────┘
//! ```
//!
//! Terminal states are final for the run. Retries happen inside `Running`
//! and are not visible here. A new run gets a fresh machine starting at
//! `Idle` and resumes from the job's last checkpoint.

use crate::error::{Result, SyncError};
use crate::metrics;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Running,
    Success,
    /// Finished, but some records were rejected.
    PartialSuccess,
    /// Fatal error, or a transient error that exhausted its retries.
    Failed,
    /// Deadline passed; the in-flight batch drained and checkpointed first.
    TimedOut,
    /// Explicit cancellation only.
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Idle | Self::Running)
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        match self {
            Self::Idle => matches!(next, Self::Running | Self::Cancelled),
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::PartialSuccess => write!(f, "partial_success"),
            Self::Failed => write!(f, "failed"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One run's state, broadcast to watchers.
#[derive(Debug)]
pub struct JobStateMachine {
    job_id: String,
    state_tx: watch::Sender<JobState>,
}

impl JobStateMachine {
    pub fn new(job_id: impl Into<String>) -> Self {
        let (state_tx, _) = watch::channel(JobState::Idle);
        Self {
            job_id: job_id.into(),
            state_tx,
        }
    }

    pub fn state(&self) -> JobState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.state_tx.subscribe()
    }

    /// Move to `next`, or fail with `InvalidState` if the edge doesn't exist.
    pub fn transition(&self, next: JobState) -> Result<()> {
        let mut outcome = Ok(());
        self.state_tx.send_if_modified(|current| {
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                outcome = Err(SyncError::InvalidState {
                    expected: format!("a state reachable from {}", current),
                    actual: next.to_string(),
                });
                false
            }
        });
        if outcome.is_ok() {
            debug!(job_id = %self.job_id, state = %next, "Job state changed");
            metrics::record_job_transition(&self.job_id, &next.to_string());
        }
        outcome
    }

    /// Resolves once the run reaches a terminal state.
    pub async fn wait_terminal(&self) -> JobState {
        let mut rx = self.subscribe();
        let state = match rx.wait_for(JobState::is_terminal).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        state
    }
}
