//! Repair the differences an integrity check found.
//!
//! ```text
//! SourceToDestination: missing + mismatched keys ─ read from source ─→ upsert at destination
//! DestinationToSource: extra + mismatched keys   ─ read from destination ─→ upsert at source
//! ```
//!
//! The fetched records go through the same profile shaping as a sync run
//! and are written by the [`BatchExecutor`], so batching, retries and
//! checkpoints apply. Checkpoints go under `<job_id>:reconcile`, which leaves
//! the sync job's own resume point and watermark alone. A dry run stops
//! after planning.

use crate::adapter::{collect_records, ReadFilter, RecordAdapter};
use crate::checkpoint::CheckpointStore;
use crate::error::{Result, SyncError};
use crate::executor::{BatchExecutor, RunContext, SyncResult};
use crate::integrity::{DestinationIntegrity, DestinationStatus};
use crate::metrics;
use crate::planner::SyncPlan;
use crate::profile::SyncProfile;
use crate::record::Record;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{info, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    SourceToDestination,
    DestinationToSource,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SourceToDestination => write!(f, "source_to_destination"),
            Self::DestinationToSource => write!(f, "destination_to_source"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub direction: Direction,
    pub plan: SyncPlan,
    pub result: SyncResult,
}

/// Keys to copy for `direction`, ascending and unique.
fn keys_to_copy(entry: &DestinationIntegrity, direction: Direction) -> Vec<String> {
    let one_sided = match direction {
        Direction::SourceToDestination => &entry.missing_keys,
        Direction::DestinationToSource => &entry.extra_keys,
    };
    one_sided
        .iter()
        .chain(&entry.mismatched_keys)
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub fn checkpoint_id(job_id: &str) -> String {
    format!("{}:reconcile", job_id)
}

#[instrument(skip_all, fields(destination = %entry.destination, %direction, dry_run))]
pub async fn reconcile(
    entry: &DestinationIntegrity,
    direction: Direction,
    dry_run: bool,
    profile: &SyncProfile,
    ctx: &RunContext,
) -> Result<ReconcileOutcome> {
    if entry.status == DestinationStatus::Error {
        return Err(SyncError::Integrity {
            destination: entry.destination.clone(),
            message: "destination was not verified, nothing to reconcile".to_string(),
        });
    }
    if entry.destination != ctx.destination.name() {
        return Err(SyncError::Integrity {
            destination: entry.destination.clone(),
            message: format!("report entry does not match context destination '{}'", ctx.destination.name()),
        });
    }

    let keys = keys_to_copy(entry, direction);
    let mut plan = SyncPlan::default();

    if !keys.is_empty() {
        let (from, label): (&dyn RecordAdapter, &str) = match direction {
            Direction::SourceToDestination => (ctx.source.as_ref(), "connect_source"),
            Direction::DestinationToSource => (ctx.destination.as_ref(), "connect_destination"),
        };
        from.connect().await.map_err(|e| e.into_sync_error(label))?;
        let fetched = collect_records(from, &ctx.collection, ReadFilter::keys(keys.clone())).await?;
        plan.records_read = fetched.len();

        let mut shaped: Vec<Record> = match direction {
            Direction::SourceToDestination => fetched.into_iter().filter_map(|r| profile.prepare(r)).collect(),
            Direction::DestinationToSource => fetched
                .into_iter()
                .map(|r| profile.restore_source_names(r))
                .collect(),
        };
        shaped.sort_by(|a, b| a.key.cmp(&b.key));
        // gone since the check, or filtered out
        plan.skipped = keys.len().saturating_sub(shaped.len());

        match direction {
            Direction::SourceToDestination => plan.destination.upserts = shaped,
            Direction::DestinationToSource => plan.source.upserts = shaped,
        }
    }

    let planned = plan.destination.len() + plan.source.len();
    metrics::record_reconcile(&direction.to_string(), planned, dry_run);
    info!(keys = keys.len(), planned, "Reconcile planned");

    let result = if dry_run {
        SyncResult::simulated(&ctx.job_id, &plan)
    } else {
        let repair = RunContext {
            job_id: checkpoint_id(&ctx.job_id),
            ..ctx.clone()
        };
        let last = repair.checkpoints.load(&repair.job_id).await?;
        BatchExecutor::new(&repair).execute(&plan, last.as_ref()).await
    };

    Ok(ReconcileOutcome { direction, plan, result })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryAdapter;
    use crate::config::FingerprintConfig;
    use crate::integrity::{IntegrityChecker, OverallStatus};
    use crate::job::JobState;
    use crate::record::Value;
    use crate::resilience::RetryConfig;
    use std::sync::Arc;

    const COLL: &str = "orders";

    fn records(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| Record::new(format!("o{:03}", i)).with("total", i as i64))
            .collect()
    }

    struct Fixture {
        source: Arc<MemoryAdapter>,
        dest: Arc<MemoryAdapter>,
        ctx: RunContext,
    }

    /// Destination lost o002, has a stray o999 and a corrupted o005.
    async fn drifted() -> Fixture {
        let source = Arc::new(MemoryAdapter::new("src"));
        let dest = Arc::new(MemoryAdapter::new("dst"));
        source.insert(COLL, records(10)).await;
        let mut d = records(10);
        d.remove(2);
        d[4].set("total", -5);
        d.push(Record::new("o999").with("total", 999));
        dest.insert(COLL, d).await;
        let ctx = RunContext::new("reconcile-orders", COLL, source.clone(), dest.clone())
            .with_retry(RetryConfig::testing());
        Fixture { source, dest, ctx }
    }

    async fn check(f: &Fixture) -> DestinationIntegrity {
        let dest: Arc<dyn RecordAdapter> = f.dest.clone();
        let report = IntegrityChecker::new(FingerprintConfig::default())
            .verify(f.source.as_ref(), &[dest], COLL, &SyncProfile::default())
            .await;
        report.per_destination.into_iter().next().unwrap()
    }

    #[test]
    fn test_keys_to_copy_dedups_and_sorts() {
        let entry = DestinationIntegrity {
            destination: "d".into(),
            fingerprint: None,
            probe: crate::diff::probe(None, None),
            missing_keys: vec!["b".into(), "a".into()],
            extra_keys: vec!["z".into()],
            mismatched_keys: vec!["a".into(), "c".into()],
            parity_status: crate::parity::ParityStatus::Unavailable,
            status: DestinationStatus::Mismatch,
            error: None,
        };
        assert_eq!(keys_to_copy(&entry, Direction::SourceToDestination), vec!["a", "b", "c"]);
        assert_eq!(keys_to_copy(&entry, Direction::DestinationToSource), vec!["a", "c", "z"]);
    }

    #[tokio::test]
    async fn test_source_to_destination_repairs() {
        let f = drifted().await;
        let entry = check(&f).await;
        assert_eq!(entry.status, DestinationStatus::Mismatch);

        let outcome = reconcile(&entry, Direction::SourceToDestination, false, &SyncProfile::default(), &f.ctx)
            .await
            .unwrap();
        assert_eq!(outcome.result.status, JobState::Success);
        assert_eq!(outcome.result.records_written, 2);
        assert_eq!(f.dest.get(COLL, "o002").await.unwrap().get("total"), Some(&Value::Int(2)));
        assert_eq!(f.dest.get(COLL, "o005").await.unwrap().get("total"), Some(&Value::Int(5)));

        // the stray key stays until someone reconciles the other way
        let after = check(&f).await;
        assert_eq!(after.extra_keys, vec!["o999"]);
        assert!(after.missing_keys.is_empty() && after.mismatched_keys.is_empty());
    }

    #[tokio::test]
    async fn test_destination_to_source_copies_back() {
        let f = drifted().await;
        let entry = check(&f).await;
        let outcome = reconcile(&entry, Direction::DestinationToSource, false, &SyncProfile::default(), &f.ctx)
            .await
            .unwrap();
        assert_eq!(outcome.plan.source.upserts.len(), 2);
        assert!(f.source.get(COLL, "o999").await.is_some());
        assert_eq!(f.source.get(COLL, "o005").await.unwrap().get("total"), Some(&Value::Int(-5)));
    }

    #[tokio::test]
    async fn test_dry_run_plans_without_writing() {
        let f = drifted().await;
        let entry = check(&f).await;
        let outcome = reconcile(&entry, Direction::SourceToDestination, true, &SyncProfile::default(), &f.ctx)
            .await
            .unwrap();
        assert!(outcome.result.dry_run);
        assert_eq!(outcome.result.records_planned, 2);
        assert_eq!(outcome.result.records_written, 0);
        assert_eq!(f.dest.write_calls(), 0);
    }

    #[tokio::test]
    async fn test_full_repair_then_verify_ok() {
        let f = drifted().await;
        let entry = check(&f).await;
        reconcile(&entry, Direction::SourceToDestination, false, &SyncProfile::default(), &f.ctx)
            .await
            .unwrap();
        f.dest.write_batch(COLL, vec![], vec!["o999".into()]).await.unwrap();

        let dest: Arc<dyn RecordAdapter> = f.dest.clone();
        let report = IntegrityChecker::default()
            .verify(f.source.as_ref(), &[dest], COLL, &SyncProfile::default())
            .await;
        assert_eq!(report.overall_status, OverallStatus::Ok);
    }

    #[tokio::test]
    async fn test_checkpoints_kept_apart_from_sync_job() {
        let f = drifted().await;
        let store = Arc::new(crate::checkpoint::MemoryCheckpointStore::new());
        let ctx = f.ctx.clone().with_checkpoints(store.clone());
        // the sync job crashed mid-run at a high batch index
        let unfinished = crate::checkpoint::Checkpoint {
            job_id: ctx.job_id.clone(),
            batch_index: 7,
            cursor: Some(crate::checkpoint::BatchCursor::new(
                crate::checkpoint::Lane::Destination,
                crate::checkpoint::Phase::Upserts,
                "o004",
            )),
            last_timestamp: Some(Value::Int(150)),
            completed: false,
            saved_at: chrono::Utc::now(),
        };
        store.save(&ctx.job_id, unfinished.clone()).await.unwrap();

        let entry = check(&f).await;
        let outcome = reconcile(&entry, Direction::SourceToDestination, false, &SyncProfile::default(), &ctx)
            .await
            .unwrap();

        assert_eq!(outcome.result.status, JobState::Success);
        assert_eq!(outcome.result.records_written, 2);
        assert_eq!(store.load(&ctx.job_id).await.unwrap(), Some(unfinished));
        let repair = store.load(&checkpoint_id(&ctx.job_id)).await.unwrap().unwrap();
        assert!(repair.completed);
    }

    #[tokio::test]
    async fn test_error_entry_is_refused() {
        let f = drifted().await;
        let mut entry = check(&f).await;
        entry.status = DestinationStatus::Error;
        let err = reconcile(&entry, Direction::SourceToDestination, false, &SyncProfile::default(), &f.ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Integrity { .. }));
    }

    #[tokio::test]
    async fn test_entry_for_other_destination_is_refused() {
        let f = drifted().await;
        let mut entry = check(&f).await;
        entry.destination = "elsewhere".into();
        let err = reconcile(&entry, Direction::SourceToDestination, true, &SyncProfile::default(), &f.ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("elsewhere"));
    }
}
