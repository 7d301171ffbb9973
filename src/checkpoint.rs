// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpoint persistence for batch progress.
//!
//! The executor saves a [`Checkpoint`] after every committed batch. A resumed
//! run loads it and skips everything at or before its cursor.
//!
//! # Ordering
//!
//! Within one run, checkpoint N+1 must never land before checkpoint N. Every
//! store enforces this atomically: a save whose `batch_index` is not greater
//! than the stored, not-yet-completed checkpoint fails with
//! `CheckpointOrder`. A `completed` checkpoint closes the run; the next save
//! for that job starts a new sequence.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Writes are retried with exponential backoff, up to 5 attempts.
//!
//! ## Cursor Semantics
//!
//! The cursor names the **last key of the last committed batch**, prefixed
//! with its lane and phase:
//!
//! ```text
//! dst:u:order-0099   destination upserts, through order-0099
//! dst:d:order-0420   destination deletes, through order-0420
//! src:u:user-7       write-back upserts (bidirectional), through user-7
//! ```
//!
//! Keys are matched, not batch positions, so a resumed run that re-plans
//! against fresher data still skips exactly what already landed.

use crate::adapter::BoxFuture;
use crate::error::{Result, SyncError};
use crate::record::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Which store a batch was written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Destination,
    Source,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Upserts,
    Deletes,
}

/// Position of the last committed batch. Orders by lane, then phase, then key,
/// which is the order the executor writes in.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BatchCursor {
    pub lane: Lane,
    pub phase: Phase,
    pub key: String,
}

impl BatchCursor {
    pub fn new(lane: Lane, phase: Phase, key: impl Into<String>) -> Self {
        Self {
            lane,
            phase,
            key: key.into(),
        }
    }

    /// Has the item at this position already been committed?
    pub fn covers(&self, lane: Lane, phase: Phase, key: &str) -> bool {
        (lane, phase, key) <= (self.lane, self.phase, self.key.as_str())
    }
}

impl std::fmt::Display for BatchCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lane = match self.lane {
            Lane::Destination => "dst",
            Lane::Source => "src",
        };
        let phase = match self.phase {
            Phase::Upserts => "u",
            Phase::Deletes => "d",
        };
        write!(f, "{}:{}:{}", lane, phase, self.key)
    }
}

impl FromStr for BatchCursor {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, ':');
        let lane = match parts.next() {
            Some("dst") => Lane::Destination,
            Some("src") => Lane::Source,
            _ => return Err(SyncError::Internal(format!("bad checkpoint cursor: {}", s))),
        };
        let phase = match parts.next() {
            Some("u") => Phase::Upserts,
            Some("d") => Phase::Deletes,
            _ => return Err(SyncError::Internal(format!("bad checkpoint cursor: {}", s))),
        };
        let key = parts
            .next()
            .ok_or_else(|| SyncError::Internal(format!("bad checkpoint cursor: {}", s)))?;
        Ok(Self::new(lane, phase, key))
    }
}

impl Serialize for BatchCursor {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BatchCursor {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_id: String,
    pub batch_index: u64,
    /// `None` only on the completion marker of a run with nothing to write.
    pub cursor: Option<BatchCursor>,
    /// Incremental watermark the next run plans against.
    pub last_timestamp: Option<Value>,
    /// Written by the final batch of a run.
    pub completed: bool,
    pub saved_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Where a new run should resume, if anywhere.
    pub fn resume_cursor(&self) -> Option<&BatchCursor> {
        if self.completed {
            None
        } else {
            self.cursor.as_ref()
        }
    }
}

/// Reject a save that would move a run's progress backwards.
pub fn check_order(stored: Option<&Checkpoint>, offered: &Checkpoint) -> Result<()> {
    match stored {
        Some(s) if !s.completed && offered.batch_index <= s.batch_index => Err(SyncError::CheckpointOrder {
            job_id: offered.job_id.clone(),
            stored: s.batch_index,
            offered: offered.batch_index,
        }),
        _ => Ok(()),
    }
}

/// Durable per-job progress.
pub trait CheckpointStore: Send + Sync + 'static {
    fn load(&self, job_id: &str) -> BoxFuture<'_, Option<Checkpoint>>;

    /// Atomic check-and-write; see the module docs for ordering.
    fn save(&self, job_id: &str, checkpoint: Checkpoint) -> BoxFuture<'_, ()>;

    fn clear(&self, job_id: &str) -> BoxFuture<'_, ()>;

    /// Every checkpoint saved for the job, oldest first.
    fn history(&self, job_id: &str) -> BoxFuture<'_, Vec<Checkpoint>>;
}

// =============================================================================
// In-memory store
// =============================================================================

#[derive(Default)]
pub struct MemoryCheckpointStore {
    jobs: Mutex<HashMap<String, Vec<Checkpoint>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self, job_id: &str) -> BoxFuture<'_, Option<Checkpoint>> {
        let job_id = job_id.to_string();
        Box::pin(async move { Ok(self.jobs.lock().await.get(&job_id).and_then(|h| h.last().cloned())) })
    }

    fn save(&self, job_id: &str, checkpoint: Checkpoint) -> BoxFuture<'_, ()> {
        let job_id = job_id.to_string();
        Box::pin(async move {
            let mut jobs = self.jobs.lock().await;
            let history = jobs.entry(job_id).or_default();
            check_order(history.last(), &checkpoint)?;
            history.push(checkpoint);
            Ok(())
        })
    }

    fn clear(&self, job_id: &str) -> BoxFuture<'_, ()> {
        let job_id = job_id.to_string();
        Box::pin(async move {
            self.jobs.lock().await.remove(&job_id);
            Ok(())
        })
    }

    fn history(&self, job_id: &str) -> BoxFuture<'_, Vec<Checkpoint>> {
        let job_id = job_id.to_string();
        Box::pin(async move { Ok(self.jobs.lock().await.get(&job_id).cloned().unwrap_or_default()) })
    }
}

// =============================================================================
// SQLite store
// =============================================================================

fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_checkpoint_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

type CheckpointRow = (String, i64, Option<String>, Option<String>, i64, i64);

fn from_row(row: CheckpointRow) -> Result<Checkpoint> {
    let (job_id, batch_index, cursor, last_timestamp, completed, saved_at) = row;
    let cursor = cursor.map(|c| c.parse()).transpose()?;
    let last_timestamp = match last_timestamp {
        Some(json) => Some(
            serde_json::from_str::<Value>(&json)
                .map_err(|e| SyncError::Internal(format!("bad stored watermark for {}: {}", job_id, e)))?,
        ),
        None => None,
    };
    Ok(Checkpoint {
        job_id,
        batch_index: batch_index.max(0) as u64,
        cursor,
        last_timestamp,
        completed: completed != 0,
        saved_at: DateTime::from_timestamp_millis(saved_at).unwrap_or_default(),
    })
}

/// Durable checkpoint storage backed by SQLite.
///
/// `checkpoints` holds the latest entry per job, `checkpoint_history` every
/// entry ever saved.
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
    cache: Arc<RwLock<HashMap<String, Checkpoint>>>,
    path: String,
}

impl SqliteCheckpointStore {
    /// Open (or create) the store at `path`. `":memory:"` gives a private
    /// in-memory database.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(path, true).await
    }

    pub async fn from_config(config: &crate::config::CheckpointConfig) -> Result<Self> {
        Self::open(&config.sqlite_path, config.wal_mode).await
    }

    async fn open(path: impl AsRef<Path>, wal_mode: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let in_memory = path_str == ":memory:";
        info!(path = %path_str, "Initializing checkpoint store");

        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path_str)
        };
        let journal = if wal_mode && !in_memory {
            sqlx::sqlite::SqliteJournalMode::Wal
        } else {
            sqlx::sqlite::SqliteJournalMode::Delete
        };
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| SyncError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(journal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        // every in-memory connection is its own database
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 2 })
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                job_id TEXT PRIMARY KEY,
                batch_index INTEGER NOT NULL,
                cursor TEXT,
                last_timestamp TEXT,
                completed INTEGER NOT NULL,
                saved_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoint_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                batch_index INTEGER NOT NULL,
                cursor TEXT,
                last_timestamp TEXT,
                completed INTEGER NOT NULL,
                saved_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<CheckpointRow> = sqlx::query_as(
            "SELECT job_id, batch_index, cursor, last_timestamp, completed, saved_at FROM checkpoints",
        )
        .fetch_all(&pool)
        .await?;

        let mut cache = HashMap::new();
        for row in rows {
            let cp = from_row(row)?;
            debug!(job_id = %cp.job_id, batch_index = cp.batch_index, "Loaded checkpoint from disk");
            cache.insert(cp.job_id.clone(), cp);
        }
        if !cache.is_empty() {
            info!(count = cache.len(), "Restored checkpoints from previous run");
        }

        Ok(Self {
            pool,
            cache: Arc::new(RwLock::new(cache)),
            path: path_str,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    async fn save_inner(&self, job_id: String, checkpoint: Checkpoint) -> Result<()> {
        let cursor = checkpoint.cursor.as_ref().map(ToString::to_string);
        let last_timestamp = checkpoint
            .last_timestamp
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| SyncError::Internal(format!("watermark not serializable: {}", e)))?;
        let batch_index = checkpoint.batch_index as i64;
        let completed = i64::from(checkpoint.completed);
        let saved_at = checkpoint.saved_at.timestamp_millis();
        let pool = &self.pool;

        let applied = execute_with_retry("checkpoint_save", || {
            let job_id = job_id.clone();
            let cursor = cursor.clone();
            let last_timestamp = last_timestamp.clone();
            async move {
                let mut tx = pool.begin().await?;
                // the WHERE clause is the ordering rule, applied atomically
                let res = sqlx::query(
                    r#"
                    INSERT INTO checkpoints (job_id, batch_index, cursor, last_timestamp, completed, saved_at)
                    VALUES (?, ?, ?, ?, ?, ?)
                    ON CONFLICT(job_id) DO UPDATE SET
                        batch_index = excluded.batch_index,
                        cursor = excluded.cursor,
                        last_timestamp = excluded.last_timestamp,
                        completed = excluded.completed,
                        saved_at = excluded.saved_at
                    WHERE checkpoints.completed = 1 OR excluded.batch_index > checkpoints.batch_index
                    "#,
                )
                .bind(&job_id)
                .bind(batch_index)
                .bind(&cursor)
                .bind(&last_timestamp)
                .bind(completed)
                .bind(saved_at)
                .execute(&mut *tx)
                .await?;

                if res.rows_affected() == 0 {
                    tx.rollback().await?;
                    return Ok(false);
                }

                sqlx::query(
                    r#"
                    INSERT INTO checkpoint_history (job_id, batch_index, cursor, last_timestamp, completed, saved_at)
                    VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&job_id)
                .bind(batch_index)
                .bind(&cursor)
                .bind(&last_timestamp)
                .bind(completed)
                .bind(saved_at)
                .execute(&mut *tx)
                .await?;

                tx.commit().await?;
                Ok(true)
            }
        })
        .await;

        let applied = match applied {
            Ok(applied) => applied,
            Err(e) => {
                crate::metrics::record_checkpoint_save(false);
                return Err(e.into());
            }
        };

        if !applied {
            let stored = self.cache.read().await.get(&job_id).map_or(0, |c| c.batch_index);
            crate::metrics::record_checkpoint_save(false);
            return Err(SyncError::CheckpointOrder {
                job_id,
                stored,
                offered: checkpoint.batch_index,
            });
        }

        crate::metrics::record_checkpoint_save(true);
        debug!(job_id = %job_id, batch_index = checkpoint.batch_index, "Checkpoint saved");
        self.cache.write().await.insert(job_id, checkpoint);
        Ok(())
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn wal_checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("checkpoint_wal", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    pub async fn close(&self) {
        if let Err(e) = self.wal_checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Checkpoint store closed");
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn load(&self, job_id: &str) -> BoxFuture<'_, Option<Checkpoint>> {
        let job_id = job_id.to_string();
        Box::pin(async move { Ok(self.cache.read().await.get(&job_id).cloned()) })
    }

    fn save(&self, job_id: &str, checkpoint: Checkpoint) -> BoxFuture<'_, ()> {
        let job_id = job_id.to_string();
        Box::pin(self.save_inner(job_id, checkpoint))
    }

    fn clear(&self, job_id: &str) -> BoxFuture<'_, ()> {
        let job_id = job_id.to_string();
        Box::pin(async move {
            self.cache.write().await.remove(&job_id);
            let pool = &self.pool;
            execute_with_retry("checkpoint_clear", || {
                let job_id = job_id.clone();
                async move {
                    let mut tx = pool.begin().await?;
                    sqlx::query("DELETE FROM checkpoints WHERE job_id = ?")
                        .bind(&job_id)
                        .execute(&mut *tx)
                        .await?;
                    sqlx::query("DELETE FROM checkpoint_history WHERE job_id = ?")
                        .bind(&job_id)
                        .execute(&mut *tx)
                        .await?;
                    tx.commit().await
                }
            })
            .await?;
            info!(job_id = %job_id, "Cleared checkpoints");
            Ok(())
        })
    }

    fn history(&self, job_id: &str) -> BoxFuture<'_, Vec<Checkpoint>> {
        let job_id = job_id.to_string();
        Box::pin(async move {
            let rows: Vec<CheckpointRow> = sqlx::query_as(
                r#"
                SELECT job_id, batch_index, cursor, last_timestamp, completed, saved_at
                FROM checkpoint_history WHERE job_id = ? ORDER BY id
                "#,
            )
            .bind(&job_id)
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter().map(from_row).collect()
        })
    }
}
