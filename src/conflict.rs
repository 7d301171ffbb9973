//! Conflict resolution between a source and a destination version of the
//! same key.
//!
//! Resolution is pure. The `manual` policy resolves nothing: the planner
//! leaves the key out of the write plan and the pair is handed to a
//! [`ConflictQueue`] after planning.

use crate::adapter::BoxFuture;
use crate::metrics;
use crate::record::{Record, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    #[default]
    SourceWins,
    DestinationWins,
    NewestWins,
    /// Shallow union, source fields overwrite.
    Merge,
    Manual,
}

impl std::fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SourceWins => write!(f, "source_wins"),
            Self::DestinationWins => write!(f, "destination_wins"),
            Self::NewestWins => write!(f, "newest_wins"),
            Self::Merge => write!(f, "merge"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved(Record),
    /// Left for an operator; never written this run.
    Deferred,
}

/// A timestamp field value in comparable form.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncTimestamp {
    Number(f64),
    Instant(DateTime<Utc>),
    Text(String),
}

impl SyncTimestamp {
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(i) => Some(Self::Number(*i as f64)),
            Value::Float(f) if !f.is_nan() => Some(Self::Number(*f)),
            Value::String(s) => Some(
                DateTime::parse_from_rfc3339(s)
                    .map(|dt| Self::Instant(dt.with_timezone(&Utc)))
                    .unwrap_or_else(|_| Self::Text(s.clone())),
            ),
            _ => None,
        }
    }

    pub fn of(record: &Record, field: &str) -> Option<Self> {
        record.get(field).and_then(Self::from_value)
    }

    fn epoch_seconds(dt: &DateTime<Utc>) -> f64 {
        dt.timestamp() as f64 + f64::from(dt.timestamp_subsec_nanos()) / 1e9
    }
}

impl PartialOrd for SyncTimestamp {
    /// Numbers compare numerically, instants chronologically, an instant
    /// against a number as epoch seconds. Free text only compares with text.
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => a.partial_cmp(b),
            (Self::Instant(a), Self::Instant(b)) => a.partial_cmp(b),
            (Self::Instant(a), Self::Number(b)) => Self::epoch_seconds(a).partial_cmp(b),
            (Self::Number(a), Self::Instant(b)) => a.partial_cmp(&Self::epoch_seconds(b)),
            (Self::Text(a), Self::Text(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

/// Resolve a conflicting pair.
///
/// `newest_wins` keeps source on a tie, when either timestamp is absent and
/// when the two timestamps are not comparable.
pub fn resolve(source: &Record, dest: &Record, policy: ConflictPolicy, timestamp_field: &str) -> Resolution {
    metrics::record_conflict(policy);
    match policy {
        ConflictPolicy::SourceWins => Resolution::Resolved(source.clone()),
        ConflictPolicy::DestinationWins => Resolution::Resolved(dest.clone()),
        ConflictPolicy::NewestWins => {
            let src = SyncTimestamp::of(source, timestamp_field);
            let dst = SyncTimestamp::of(dest, timestamp_field);
            let dest_newer = matches!(
                (src, dst),
                (Some(s), Some(d)) if d.partial_cmp(&s) == Some(Ordering::Greater)
            );
            if dest_newer {
                Resolution::Resolved(dest.clone())
            } else {
                Resolution::Resolved(source.clone())
            }
        }
        ConflictPolicy::Merge => {
            let mut merged = dest.clone();
            merged.key = source.key.clone();
            for (name, value) in &source.fields {
                merged.fields.insert(name.clone(), value.clone());
            }
            Resolution::Resolved(merged)
        }
        ConflictPolicy::Manual => Resolution::Deferred,
    }
}

// =============================================================================
// Conflict queue
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictContext {
    pub job_id: String,
    pub collection: String,
    pub key: String,
    pub policy: ConflictPolicy,
}

/// A pair left unresolved by the planner.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredConflict {
    pub source: Record,
    pub dest: Record,
}

/// External sink for manually resolved conflicts.
pub trait ConflictQueue: Send + Sync + 'static {
    fn enqueue(&self, source: Record, dest: Record, context: ConflictContext) -> BoxFuture<'_, ()>;
}

/// Hand deferred conflicts to the queue. Failures are logged and counted,
/// never propagated. Returns the number of pairs accepted.
pub async fn enqueue_deferred(
    queue: &dyn ConflictQueue,
    conflicts: Vec<DeferredConflict>,
    job_id: &str,
    collection: &str,
) -> usize {
    let mut accepted = 0;
    for c in conflicts {
        let context = ConflictContext {
            job_id: job_id.to_string(),
            collection: collection.to_string(),
            key: c.source.key.clone(),
            policy: ConflictPolicy::Manual,
        };
        let key = context.key.clone();
        match queue.enqueue(c.source, c.dest, context).await {
            Ok(()) => accepted += 1,
            Err(e) => {
                warn!(job_id, key = %key, error = %e, "Failed to enqueue manual conflict");
                metrics::record_conflict_enqueue_failure(job_id);
            }
        }
    }
    accepted
}

#[derive(Debug, Clone)]
pub struct QueuedConflict {
    pub source: Record,
    pub dest: Record,
    pub context: ConflictContext,
}

/// In-process queue, for tests and hosts without an operator inbox.
#[derive(Default)]
pub struct MemoryConflictQueue {
    entries: Mutex<Vec<QueuedConflict>>,
}

impl MemoryConflictQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<QueuedConflict> {
        self.entries.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

impl ConflictQueue for MemoryConflictQueue {
    fn enqueue(&self, source: Record, dest: Record, context: ConflictContext) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.entries.lock().await.push(QueuedConflict { source, dest, context });
            Ok(())
        })
    }
}
