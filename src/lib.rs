//! # Collection Sync
//!
//! Replicates key-value collections from a source store to heterogeneous
//! destinations, and proves (or disproves) that the copies are faithful.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                             collection-sync                               │
//! │                                                                           │
//! │  ┌──────────────┐   ┌─────────────┐   ┌─────────┐   ┌──────────────────┐  │
//! │  │ JobScheduler │──►│ SyncJob     │──►│ Planner │──►│ BatchExecutor    │  │
//! │  │ (priority,   │   │ (read both  │   │ (mode → │   │ (retry, circuit, │  │
//! │  │  deps, lease)│   │  sides)     │   │  plan)  │   │  checkpoints)    │  │
//! │  └──────────────┘   └─────────────┘   └─────────┘   └──────────────────┘  │
//! │                            │                                │             │
//! │                            ▼                                ▼             │
//! │                    ┌───────────────┐               ┌─────────────────┐    │
//! │                    │ RecordAdapter │◄──────────────│ CheckpointStore │    │
//! │                    │ (source/dest) │               │ (SQLite)        │    │
//! │                    └───────────────┘               └─────────────────┘    │
//! │                            │                                              │
//! │                            ▼                                              │
//! │  ┌──────────────────────────────────────────┐   ┌──────────────────────┐  │
//! │  │ IntegrityChecker (fingerprint, probe,    │──►│ reconcile            │  │
//! │  │ Merkle diff, parity)                     │   │ (repair by key)      │  │
//! │  └──────────────────────────────────────────┘   └──────────────────────┘  │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Two Engines
//!
//! 1. **Sync**: moves records under one of five modes (`full_sync`,
//!    `incremental`, `append_only`, `master_slave`, `bidirectional`) with
//!    conflict policies, batching, checkpointed resume, retry and cancellation.
//! 2. **Integrity**: canonical record checksums, a Merkle tree per snapshot,
//!    parity blocks, and a key-level diff when roots disagree.
//!
//! Delivery is at-least-once: a crashed run resumes after its last
//! checkpoint and re-applies idempotent upserts.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use collection_sync::{
//!     JobConfig, JobScheduler, MemoryAdapter, Priority, RunContext, SchedulerConfig, SyncJob,
//!     SyncMode, SyncProfile,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let source = Arc::new(MemoryAdapter::new("crm"));
//!     let warehouse = Arc::new(MemoryAdapter::new("warehouse"));
//!
//!     let profile = SyncProfile::new(SyncMode::Incremental);
//!     let config = JobConfig::new("crm-users", "users", "crm", "warehouse", profile);
//!     let ctx = RunContext::new("crm-users", "users", source, warehouse);
//!
//!     let scheduler = JobScheduler::new(SchedulerConfig::default());
//!     let handle = scheduler
//!         .submit(SyncJob::new(config, ctx), Priority::Normal)
//!         .expect("admitted");
//!     let result = handle.wait().await;
//!     println!("{} -> {}", result.job_id, result.status);
//! }
//! ```

pub mod adapter;
pub mod checkpoint;
pub mod circuit_breaker;
pub mod codec;
pub mod config;
pub mod conflict;
pub mod diff;
pub mod error;
pub mod events;
pub mod executor;
pub mod fingerprint;
pub mod integrity;
pub mod job;
pub mod merkle;
pub mod metrics;
pub mod parity;
pub mod planner;
pub mod profile;
pub mod reconcile;
pub mod record;
pub mod resilience;

// Re-exports for convenience
pub use adapter::{Capabilities, DestinationKind, MemoryAdapter, ReadFilter, RecordAdapter, WriteOutcome};
pub use checkpoint::{Checkpoint, CheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore};
pub use config::{EngineConfig, ExecutorConfig, FingerprintConfig, JobConfig, SchedulerConfig};
pub use conflict::{ConflictPolicy, ConflictQueue, MemoryConflictQueue};
pub use error::{AdapterError, Result, SyncError};
pub use events::{EventSink, MemoryEventSink, SyncEvent};
pub use executor::{BatchExecutor, RunContext, StopSignal, SyncResult};
pub use integrity::{IntegrityChecker, IntegrityReport, OverallStatus};
pub use job::{JobHandle, JobScheduler, JobState, Priority, SyncJob};
pub use profile::{SyncMode, SyncProfile};
pub use reconcile::{reconcile, Direction, ReconcileOutcome};
pub use record::{Record, Value};
