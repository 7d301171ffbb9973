//! Record fixtures and run-context helpers.

use collection_sync::circuit_breaker::{CircuitBreaker, CircuitConfig};
use collection_sync::resilience::RetryConfig;
use collection_sync::{
    CheckpointStore, JobConfig, MemoryAdapter, MemoryCheckpointStore, Record, RecordAdapter, RunContext,
    SyncJob, SyncProfile, SyncResult,
};
use std::sync::Arc;

pub const USERS: &str = "users";

/// `n` user records keyed `u0000..`, with `_updated` set to `ts`.
pub fn users(n: usize, ts: i64) -> Vec<Record> {
    (0..n).map(|i| user(i, ts)).collect()
}

pub fn user(i: usize, ts: i64) -> Record {
    Record::new(format!("u{:04}", i))
        .with("name", format!("user-{}", i))
        .with("score", i as i64)
        .with("_updated", ts)
}

pub async fn seeded(name: &str, records: Vec<Record>) -> Arc<MemoryAdapter> {
    let adapter = Arc::new(MemoryAdapter::new(name));
    adapter.insert(USERS, records).await;
    adapter
}

pub async fn keys_of(adapter: &MemoryAdapter) -> Vec<String> {
    adapter.records(USERS).await.into_iter().map(|r| r.key).collect()
}

/// Context with fast retries, a breaker that never trips and the given
/// checkpoint store.
pub fn context(
    job_id: &str,
    source: Arc<dyn RecordAdapter>,
    dest: Arc<dyn RecordAdapter>,
    checkpoints: Arc<dyn CheckpointStore>,
) -> RunContext {
    let circuit = Arc::new(CircuitBreaker::new(dest.name(), CircuitConfig::disabled()));
    RunContext::new(job_id, USERS, source, dest)
        .with_checkpoints(checkpoints)
        .with_retry(RetryConfig::testing())
        .with_circuit(circuit)
}

/// One job run against in-memory checkpoints shared across calls.
pub async fn run_job(
    job_id: &str,
    profile: SyncProfile,
    source: Arc<dyn RecordAdapter>,
    dest: Arc<dyn RecordAdapter>,
    checkpoints: Arc<dyn CheckpointStore>,
) -> SyncResult {
    let config = JobConfig::new(job_id, USERS, source.name(), dest.name(), profile);
    SyncJob::new(config, context(job_id, source, dest, checkpoints)).run().await
}

pub fn memory_checkpoints() -> Arc<MemoryCheckpointStore> {
    Arc::new(MemoryCheckpointStore::new())
}
