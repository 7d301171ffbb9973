// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the collection sync engine.
//!
//! Errors follow a four-way taxonomy that decides how a run reacts to them.
//! Adapters classify their own failures into [`AdapterError`]; the core never
//! looks at adapter-specific error types.
//!
//! # Error Categories
//!
//! | Error Type | Class | Retryable | Description |
//! |------------|-------|-----------|-------------|
//! | `Transient` | Transient | Yes | Timeouts, 5xx-equivalents, rate limiting |
//! | `Fatal` | Fatal | No | Auth failure, malformed destination config |
//! | `Record` | Record | No | Single record rejected (reported, never aborts) |
//! | `Integrity` | Integrity | No | Checksum / Merkle mismatch during verification |
//! | `Encoding` | Fatal | No | Field value cannot be canonicalized |
//! | `ResourceExceeded` | Fatal | No | Re-sort buffer ceiling hit |
//! | `DuplicateKey` | Fatal | No | Snapshot violated key uniqueness |
//! | `CheckpointStore` | Fatal | No | Local SQLite errors (needs operator attention) |
//! | `CheckpointOrder` | Fatal | No | Out-of-order checkpoint commit refused |
//! | `Config` | Fatal | No | Configuration invalid |
//! | `InvalidState` | Fatal | No | Job state machine violation |
//! | `DuplicateJob` | Fatal | No | Job id already queued or running |
//! | `DependencyCycle` | Fatal | No | Job dependencies form a cycle |
//! | `Cancelled` | Fatal | No | Job cancelled before it started |
//! | `Internal` | Fatal | No | Unexpected internal error |
//!
//! # Run Outcome
//!
//! A run ends `Failed` only on a fatal error or when a transient error
//! exhausts its retries. Record errors end the run `PartialSuccess`.

use thiserror::Error;

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Coarse classification used by the executor and by reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Fatal,
    Record,
    Integrity,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Fatal => write!(f, "fatal"),
            Self::Record => write!(f, "record"),
            Self::Integrity => write!(f, "integrity"),
        }
    }
}

/// Errors that can occur while syncing or verifying collections.
///
/// Use [`is_retryable()`](Self::is_retryable) to decide whether to back off
/// and try again.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Temporary failure talking to a store.
    ///
    /// Retried with exponential backoff up to the configured limit.
    #[error("Transient error ({operation}): {message}")]
    Transient { operation: String, message: String },

    /// Unrecoverable failure talking to a store (e.g. authentication).
    ///
    /// Aborts the run immediately.
    #[error("Fatal error ({operation}): {message}")]
    Fatal { operation: String, message: String },

    /// A single record was rejected.
    #[error("Record error ({key}): {reason}")]
    Record { key: String, reason: String },

    /// Verification found the two sides differ.
    #[error("Integrity error ({destination}): {message}")]
    Integrity { destination: String, message: String },

    /// A field value has no canonical encoding.
    #[error("Encoding error in field '{field}': {reason}")]
    Encoding { field: String, reason: String },

    /// A bounded buffer would have to grow past its ceiling.
    #[error("Resource exceeded: {resource} over limit {limit}")]
    ResourceExceeded { resource: String, limit: usize },

    /// The same key appeared twice in one snapshot.
    #[error("Duplicate key in snapshot: {0}")]
    DuplicateKey(String),

    /// SQLite error during checkpoint persistence.
    #[error("Checkpoint store error: {0}")]
    CheckpointStore(#[from] sqlx::Error),

    /// A checkpoint older than the stored one was offered.
    #[error("Checkpoint out of order for job {job_id}: stored batch {stored}, offered {offered}")]
    CheckpointOrder {
        job_id: String,
        stored: u64,
        offered: u64,
    },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Job state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// The job id is already queued or running.
    #[error("Job already admitted: {0}")]
    DuplicateJob(String),

    /// Admitting the job would close a dependency cycle.
    #[error("Dependency cycle: {}", path.join(" -> "))]
    DependencyCycle { path: Vec<String> },

    /// The job was cancelled before it could produce a result.
    #[error("Job cancelled: {0}")]
    Cancelled(String),

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn fatal(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fatal {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn encoding(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Encoding {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Map to the four-way taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transient { .. } => ErrorClass::Transient,
            Self::Record { .. } => ErrorClass::Record,
            Self::Integrity { .. } => ErrorClass::Integrity,
            _ => ErrorClass::Fatal,
        }
    }
}

/// Error surface of a [`RecordAdapter`](crate::adapter::RecordAdapter).
///
/// Adapters decide which of their failures are worth retrying.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl AdapterError {
    pub fn into_sync_error(self, operation: &str) -> SyncError {
        match self {
            Self::Transient(m) => SyncError::transient(operation, m),
            Self::Fatal(m) => SyncError::fatal(operation, m),
        }
    }
}

impl From<AdapterError> for SyncError {
    fn from(e: AdapterError) -> Self {
        e.into_sync_error("adapter")
    }
}
