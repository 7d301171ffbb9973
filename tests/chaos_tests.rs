// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate failures and verify graceful degradation.
//!
//! These tests verify the engine handles failing destinations, crashes,
//! cancellation and broken collaborators without panics, lost progress or
//! silent data damage.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use chrono::Utc;
use collection_sync::checkpoint::{BatchCursor, Checkpoint, Lane, Phase};
use collection_sync::circuit_breaker::{CircuitBreaker, CircuitConfig};
use collection_sync::conflict::ConflictPolicy;
use collection_sync::resilience::RetryConfig;
use collection_sync::{
    AdapterError, CheckpointStore, JobConfig, JobScheduler, JobState, MemoryAdapter, MemoryConflictQueue,
    Priority, RecordAdapter, SchedulerConfig, SqliteCheckpointStore, SyncJob, SyncMode, SyncProfile, Value,
};
use common::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn batched(mode: SyncMode, size: usize) -> SyncProfile {
    SyncProfile::new(mode).with_batch_size(size)
}

// =============================================================================
// Crash and Resume
// =============================================================================

/// Test: A fatal error mid-run keeps the committed prefix, and a restarted
/// process resumes after the last checkpoint instead of starting over.
#[tokio::test]
async fn fatal_mid_run_resumes_after_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("checkpoints.db");
    let source = seeded("primary", users(500, 1)).await;
    let dest = Arc::new(ScriptedAdapter::new("backup"));
    dest.fail_call(3, AdapterError::Fatal("401 unauthorized".into()));

    let store = Arc::new(SqliteCheckpointStore::new(&path).await.unwrap());
    let crashed = run_job(
        "nightly",
        batched(SyncMode::FullSync, 100),
        source.clone(),
        dest.clone(),
        store.clone(),
    )
    .await;

    assert_eq!(crashed.status, JobState::Failed);
    assert_eq!(crashed.records_written, 200);
    assert_eq!(crashed.retries, 0, "fatal errors are not retried");
    assert!(crashed.error_detail.as_deref().unwrap_or_default().contains("401"));
    let last = store.load("nightly").await.unwrap().unwrap();
    assert_eq!(last.batch_index, 1);
    assert!(!last.completed);
    store.close().await;

    // "restart": new store handle on the same file, destination healthy again
    dest.heal();
    let reopened = Arc::new(SqliteCheckpointStore::new(&path).await.unwrap());
    let resumed = run_job(
        "nightly",
        batched(SyncMode::FullSync, 100),
        source.clone(),
        dest.clone(),
        reopened.clone(),
    )
    .await;

    assert_eq!(resumed.status, JobState::Success);
    assert_eq!(resumed.resumed_after, Some(1));
    assert_eq!(resumed.records_written, 300);
    assert_eq!(dest.inner.records(USERS).await, source.records(USERS).await);

    let indices: Vec<u64> = reopened
        .history("nightly")
        .await
        .unwrap()
        .iter()
        .map(|c| c.batch_index)
        .collect();
    assert_eq!(indices, vec![0, 1, 2, 3, 4]);
}

/// Test: A record that changes after the crash, at a key the resumed run
/// skips as already committed, is still delivered by the following run.
#[tokio::test]
async fn change_behind_resume_cursor_delivered_next_run() {
    let source = seeded("primary", users(2, 100)).await;
    let dest = seeded("backup", users(2, 100)).await;
    let checkpoints = memory_checkpoints();
    checkpoints
        .save(
            "catchup",
            Checkpoint {
                job_id: "catchup".into(),
                batch_index: 0,
                cursor: Some(BatchCursor::new(Lane::Destination, Phase::Upserts, "u0001")),
                last_timestamp: Some(Value::Int(150)),
                completed: false,
                saved_at: Utc::now(),
            },
        )
        .await
        .unwrap();

    // after the crash: u0001 is edited and u0002 appears
    source
        .insert(USERS, vec![user(1, 200).with("name", "renamed"), user(2, 300)])
        .await;

    let resumed = run_job(
        "catchup",
        SyncProfile::new(SyncMode::Incremental),
        source.clone(),
        dest.clone(),
        checkpoints.clone(),
    )
    .await;
    assert_eq!(resumed.status, JobState::Success);
    assert_eq!(resumed.resumed_after, Some(0));
    assert_eq!(resumed.records_written, 1);
    let last = checkpoints.load("catchup").await.unwrap().unwrap();
    assert!(last.completed);
    assert_eq!(last.last_timestamp, Some(Value::Int(150)));

    let next = run_job(
        "catchup",
        SyncProfile::new(SyncMode::Incremental),
        source.clone(),
        dest.clone(),
        checkpoints.clone(),
    )
    .await;
    assert_eq!(next.status, JobState::Success);
    assert_eq!(next.records_written, 1);
    let u1 = dest.get(USERS, "u0001").await.unwrap();
    assert_eq!(u1.get("name"), Some(&Value::String("renamed".into())));
    let last = checkpoints.load("catchup").await.unwrap().unwrap();
    assert_eq!(last.last_timestamp, Some(Value::Int(300)));
}

/// Test: Transient failures that never clear exhaust the retry budget and
/// fail the run without writing a checkpoint.
#[tokio::test]
async fn retry_exhaustion_fails_cleanly() {
    let source = seeded("primary", users(10, 1)).await;
    let dest = Arc::new(ScriptedAdapter::new("backup"));
    dest.fail_from(1, AdapterError::Transient("connection reset".into()));
    let checkpoints = memory_checkpoints();

    let result = run_job("doomed", SyncProfile::default(), source, dest.clone(), checkpoints.clone()).await;

    assert_eq!(result.status, JobState::Failed);
    assert_eq!(result.retries, 2);
    assert_eq!(dest.write_calls(), 3);
    assert!(result.error_detail.unwrap().contains("connection reset"));
    assert!(checkpoints.history("doomed").await.unwrap().is_empty());
    assert_eq!(dest.inner.len(USERS).await, 0);
}

/// Test: Record-level rejections end in partial success and hold the
/// watermark back so the next run sees those records again.
#[tokio::test]
async fn rejected_records_hold_watermark() {
    let source = seeded("primary", users(10, 100)).await;
    let dest = Arc::new(ScriptedAdapter::new("strict"));
    dest.reject_key("u0003");
    let checkpoints = memory_checkpoints();

    let result = run_job(
        "strict",
        SyncProfile::new(SyncMode::Incremental),
        source,
        dest.clone(),
        checkpoints.clone(),
    )
    .await;

    assert_eq!(result.status, JobState::PartialSuccess);
    assert_eq!(result.records_written, 9);
    assert_eq!(result.records_failed, 1);
    assert_eq!(result.failures[0].key, "u0003");
    let last = checkpoints.load("strict").await.unwrap().unwrap();
    assert!(last.completed);
    assert_eq!(last.last_timestamp, None);
}

// =============================================================================
// Cancellation and Timeouts
// =============================================================================

/// Test: Cancelling mid-run stops at a batch boundary, and the next run
/// picks up where the cancelled one stopped.
#[tokio::test(start_paused = true)]
async fn cancel_mid_run_then_resume() {
    let source = seeded("primary", users(50, 1)).await;
    let dest = Arc::new(ScriptedAdapter::new("slow").with_write_delay(Duration::from_millis(200)));
    let checkpoints = memory_checkpoints();

    let config = JobConfig::new("slow-copy", USERS, "primary", "slow", batched(SyncMode::FullSync, 10));
    let job = SyncJob::new(
        config.clone(),
        context("slow-copy", source.clone(), dest.clone(), checkpoints.clone()),
    );
    let stop = job.stop_signal();
    let running = tokio::spawn(job.run());

    tokio::time::sleep(Duration::from_millis(300)).await;
    stop.cancel();
    let cancelled = running.await.unwrap();

    assert_eq!(cancelled.status, JobState::Cancelled);
    assert_eq!(cancelled.records_written, 20);
    let last = checkpoints.load("slow-copy").await.unwrap().unwrap();
    assert_eq!(last.batch_index, 1);
    assert!(!last.completed);

    let again = SyncJob::new(config, context("slow-copy", source.clone(), dest.clone(), checkpoints))
        .run()
        .await;
    assert_eq!(again.status, JobState::Success);
    assert_eq!(again.resumed_after, Some(1));
    assert_eq!(again.records_written, 30);
    assert_eq!(dest.inner.len(USERS).await, 50);
}

/// Test: A job past its deadline ends TimedOut with its progress saved.
#[tokio::test(start_paused = true)]
async fn timeout_stops_at_batch_boundary() {
    let source = seeded("primary", users(50, 1)).await;
    let dest = Arc::new(ScriptedAdapter::new("slow").with_write_delay(Duration::from_millis(200)));
    let checkpoints = memory_checkpoints();

    let config =
        JobConfig::new("deadline", USERS, "primary", "slow", batched(SyncMode::FullSync, 10)).with_timeout("250ms");
    let result = SyncJob::new(config, context("deadline", source, dest.clone(), checkpoints.clone()))
        .run()
        .await;

    assert_eq!(result.status, JobState::TimedOut);
    assert_eq!(result.records_written, 20);
    assert!(!checkpoints.load("deadline").await.unwrap().unwrap().completed);
}

/// Test: Cancelling a queued job never touches its destination.
#[tokio::test]
async fn cancel_queued_job_leaves_destination_alone() {
    let scheduler = JobScheduler::new(SchedulerConfig { max_parallel_jobs: 1 });
    let source = seeded("primary", users(5, 1)).await;
    let slow = Arc::new(ScriptedAdapter::new("slow").with_write_delay(Duration::from_millis(50)));
    let idle = Arc::new(MemoryAdapter::new("idle"));

    let first = SyncJob::new(
        JobConfig::new("first", USERS, "primary", "slow", SyncProfile::default()),
        context("first", source.clone(), slow.clone(), memory_checkpoints()),
    );
    let second = SyncJob::new(
        JobConfig::new("second", USERS, "primary", "idle", SyncProfile::default()),
        context("second", source.clone(), idle.clone(), memory_checkpoints()),
    );
    let first = scheduler.submit(first, Priority::Normal).unwrap();
    let second = scheduler.submit(second, Priority::Normal).unwrap();

    second.cancel();
    let cancelled = second.wait().await;
    assert_eq!(cancelled.status, JobState::Cancelled);
    assert_eq!(first.wait().await.status, JobState::Success);
    assert_eq!(idle.write_calls(), 0);
    assert_eq!(idle.len(USERS).await, 0);
}

// =============================================================================
// Circuit Breaker
// =============================================================================

/// Test: A destination that keeps failing trips its breaker, and later runs
/// are rejected without reaching the destination.
#[tokio::test]
async fn circuit_opens_on_failing_destination() {
    let source = seeded("primary", users(10, 1)).await;
    let dest = Arc::new(ScriptedAdapter::new("down"));
    dest.fail_from(1, AdapterError::Transient("503".into()));
    let circuit = Arc::new(CircuitBreaker::new(
        "down",
        CircuitConfig {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
        },
    ));

    let run = |job_id: &'static str| {
        let ctx = context(job_id, source.clone(), dest.clone(), memory_checkpoints()).with_circuit(circuit.clone());
        SyncJob::new(JobConfig::new(job_id, USERS, "primary", "down", SyncProfile::default()), ctx).run()
    };

    let first = run("first").await;
    assert_eq!(first.status, JobState::Failed);
    assert!(circuit.rejections() >= 1);
    let calls_after_first = dest.write_calls();
    assert!(calls_after_first <= 2);

    let second = run("second").await;
    assert_eq!(second.status, JobState::Failed);
    assert!(second.error_detail.unwrap().contains("circuit open"));
    assert_eq!(dest.write_calls(), calls_after_first);
    assert_eq!(dest.inner.len(USERS).await, 0);
}

// =============================================================================
// Unreachable Stores
// =============================================================================

/// Test: A source that refuses transient connections is retried, then the
/// job fails before planning.
#[tokio::test]
async fn unreachable_source_fails_after_retries() {
    let source = Arc::new(ScriptedAdapter::new("primary"));
    source.refuse_connections(AdapterError::Transient("connection refused".into()));
    let dest = Arc::new(MemoryAdapter::new("backup"));

    let result = run_job("offline", SyncProfile::default(), source.clone(), dest.clone(), memory_checkpoints()).await;

    assert_eq!(result.status, JobState::Failed);
    assert_eq!(source.connect_calls(), RetryConfig::testing().max_attempts);
    assert!(result.error_detail.unwrap().contains("connection refused"));
    assert_eq!(dest.write_calls(), 0);
}

/// Test: A fatal connection error is not retried.
#[tokio::test]
async fn fatal_connect_is_not_retried() {
    let source = seeded("primary", users(3, 1)).await;
    let dest = Arc::new(ScriptedAdapter::new("backup"));
    dest.refuse_connections(AdapterError::Fatal("bad credentials".into()));

    let result = run_job("creds", SyncProfile::default(), source, dest.clone(), memory_checkpoints()).await;

    assert_eq!(result.status, JobState::Failed);
    assert_eq!(dest.connect_calls(), 1);
    assert_eq!(dest.write_calls(), 0);
}

// =============================================================================
// Broken Collaborators
// =============================================================================

/// Test: An event sink that rejects everything never fails a run.
#[tokio::test]
async fn failing_event_sink_does_not_fail_run() {
    let source = seeded("primary", users(20, 1)).await;
    let dest = Arc::new(MemoryAdapter::new("backup"));
    let sink = Arc::new(FailingEventSink::new());

    let ctx = context("noisy", source, dest.clone(), memory_checkpoints()).with_events(sink.clone());
    let config = JobConfig::new("noisy", USERS, "primary", "backup", batched(SyncMode::FullSync, 5));
    let result = SyncJob::new(config, ctx).run().await;

    assert_eq!(result.status, JobState::Success);
    assert_eq!(dest.len(USERS).await, 20);
    assert!(sink.attempts.load(Ordering::SeqCst) >= 4);
}

/// Test: Manual conflicts that cannot be queued are dropped from the queue
/// but still leave both sides untouched.
#[tokio::test]
async fn failing_conflict_queue_leaves_both_sides_untouched() {
    let source = seeded("left", users(4, 100)).await;
    let dest = seeded("right", users(4, 100)).await;
    let checkpoints = memory_checkpoints();
    let profile = SyncProfile::new(SyncMode::Bidirectional).with_policy(ConflictPolicy::Manual);

    run_job("manual", profile.clone(), source.clone(), dest.clone(), checkpoints.clone()).await;

    source.insert(USERS, vec![user(1, 200).with("score", 1)]).await;
    dest.insert(USERS, vec![user(1, 300).with("score", 2)]).await;

    let ctx = context("manual", source.clone(), dest.clone(), checkpoints).with_conflicts(Arc::new(FailingConflictQueue));
    let result = SyncJob::new(JobConfig::new("manual", USERS, "left", "right", profile), ctx)
        .run()
        .await;

    assert_eq!(result.status, JobState::Success);
    assert_eq!(result.conflicts_detected, 1);
    assert_eq!(result.records_written, 0);
    assert_eq!(source.get(USERS, "u0001").await.unwrap().get("score"), Some(&Value::Int(1)));
    assert_eq!(dest.get(USERS, "u0001").await.unwrap().get("score"), Some(&Value::Int(2)));
}

/// Test: The same conflict reaches a working queue with both versions.
#[tokio::test]
async fn manual_conflict_reaches_queue() {
    let source = seeded("left", users(4, 100)).await;
    let dest = seeded("right", users(4, 100)).await;
    let checkpoints = memory_checkpoints();
    let profile = SyncProfile::new(SyncMode::Bidirectional).with_policy(ConflictPolicy::Manual);
    run_job("manual", profile.clone(), source.clone(), dest.clone(), checkpoints.clone()).await;

    source.insert(USERS, vec![user(1, 200).with("score", 1)]).await;
    dest.insert(USERS, vec![user(1, 300).with("score", 2)]).await;

    let queue = Arc::new(MemoryConflictQueue::new());
    let ctx = context("manual", source.clone(), dest.clone(), checkpoints).with_conflicts(queue.clone());
    let result = SyncJob::new(JobConfig::new("manual", USERS, "left", "right", profile), ctx)
        .run()
        .await;

    assert_eq!(result.conflicts_deferred, 1);
    let queued = queue.entries().await;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].context.key, "u0001");
    assert_eq!(queued[0].source.get("score"), Some(&Value::Int(1)));
    assert_eq!(queued[0].dest.get("score"), Some(&Value::Int(2)));
}

/// Test: A destination that vanishes during verification is reported, not
/// fatal to the other destinations.
#[tokio::test]
async fn verify_survives_unreadable_destination() {
    use collection_sync::integrity::DestinationStatus;
    use collection_sync::{IntegrityChecker, OverallStatus};

    let source = seeded("primary", users(20, 1)).await;
    let healthy: Arc<dyn RecordAdapter> = seeded("healthy", users(20, 1)).await;
    let broken = Arc::new(ScriptedAdapter::new("broken"));
    broken.refuse_connections(AdapterError::Transient("timeout".into()));
    let broken: Arc<dyn RecordAdapter> = broken;

    let report = IntegrityChecker::default()
        .verify(source.as_ref(), &[healthy, broken], USERS, &SyncProfile::default())
        .await;

    assert_eq!(report.overall_status, OverallStatus::Error);
    assert_eq!(report.destination("healthy").unwrap().status, DestinationStatus::Ok);
    let broken = report.destination("broken").unwrap();
    assert_eq!(broken.status, DestinationStatus::Error);
    assert!(broken.error.as_deref().unwrap_or_default().contains("timeout"));
}
