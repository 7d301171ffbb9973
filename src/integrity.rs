//! Integrity verification across destinations.
//!
//! # Flow
//!
//! ```text
//! source ─→ filter/strip/map ─→ fingerprint (tree kept) ─┐
//!                                                        ├─→ probe ─→ (mismatch) diff
//! each destination ─→ fingerprint (tree kept) ───────────┘         └─→ parity compare
//! ```
//!
//! Destinations are fingerprinted concurrently and independently; one
//! unreachable destination yields an `Error` entry, not a failed call.
//! Mismatches are reported, never repaired here (see [`crate::reconcile`]).

use crate::adapter::{record_stream, ReadFilter, RecordAdapter};
use crate::config::FingerprintConfig;
use crate::diff::{self, ProbeResult, ProbeStatus};
use crate::error::Result;
use crate::events::{self, EventSink, SyncEvent, TracingEventSink};
use crate::fingerprint::{self, Fingerprint, FingerprintOutput};
use crate::metrics;
use crate::parity::{self, ParityStatus};
use crate::profile::SyncProfile;
use chrono::{DateTime, Utc};
use futures::future::{join_all, ready};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationStatus {
    Ok,
    Mismatch,
    Error,
}

impl std::fmt::Display for DestinationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Mismatch => write!(f, "mismatch"),
            Self::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    /// Every destination matches.
    Ok,
    /// Some destination differs, none errored.
    Degraded,
    /// Some destination, or the source, could not be checked.
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationIntegrity {
    pub destination: String,
    pub fingerprint: Option<Fingerprint>,
    pub probe: ProbeResult,
    /// In the source only.
    pub missing_keys: Vec<String>,
    /// In the destination only.
    pub extra_keys: Vec<String>,
    pub mismatched_keys: Vec<String>,
    pub parity_status: ParityStatus,
    pub status: DestinationStatus,
    pub error: Option<String>,
}

impl DestinationIntegrity {
    fn unavailable(destination: &str, source: Option<&Fingerprint>, error: String) -> Self {
        Self {
            destination: destination.to_string(),
            fingerprint: None,
            probe: diff::probe(source, None),
            missing_keys: Vec::new(),
            extra_keys: Vec::new(),
            mismatched_keys: Vec::new(),
            parity_status: ParityStatus::Unavailable,
            status: DestinationStatus::Error,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub collection: String,
    pub source_fingerprint: Option<Fingerprint>,
    pub per_destination: Vec<DestinationIntegrity>,
    pub overall_status: OverallStatus,
    pub checked_at: DateTime<Utc>,
}

impl IntegrityReport {
    pub fn destination(&self, name: &str) -> Option<&DestinationIntegrity> {
        self.per_destination.iter().find(|d| d.destination == name)
    }
}

fn overall(entries: &[DestinationIntegrity]) -> OverallStatus {
    if entries.iter().any(|d| d.status == DestinationStatus::Error) {
        OverallStatus::Error
    } else if entries.iter().all(|d| d.status == DestinationStatus::Ok) {
        OverallStatus::Ok
    } else {
        OverallStatus::Degraded
    }
}

pub struct IntegrityChecker {
    config: FingerprintConfig,
    events: Arc<dyn EventSink>,
}

impl IntegrityChecker {
    /// Trees are always retained: a mismatch needs them for the diff.
    pub fn new(config: FingerprintConfig) -> Self {
        Self {
            config: config.retaining_tree(),
            events: Arc::new(TracingEventSink),
        }
    }

    pub fn with_events(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    #[instrument(skip_all, fields(collection = %collection, destinations = destinations.len()))]
    pub async fn verify(
        &self,
        source: &dyn RecordAdapter,
        destinations: &[Arc<dyn RecordAdapter>],
        collection: &str,
        profile: &SyncProfile,
    ) -> IntegrityReport {
        let source_output = match self.fingerprint_source(source, collection, profile).await {
            Ok(output) => output,
            Err(e) => {
                warn!(source = source.name(), error = %e, "Source fingerprint failed");
                let error = format!("source unavailable: {}", e);
                let per_destination: Vec<DestinationIntegrity> = destinations
                    .iter()
                    .map(|d| DestinationIntegrity::unavailable(d.name(), None, error.clone()))
                    .collect();
                return self.finish(collection, None, per_destination).await;
            }
        };

        let checks = destinations
            .iter()
            .map(|dest| self.check_destination(&source_output, dest.as_ref(), collection, profile));
        let per_destination = join_all(checks).await;

        self.finish(collection, Some(source_output.fingerprint), per_destination)
            .await
    }

    async fn finish(
        &self,
        collection: &str,
        source_fingerprint: Option<Fingerprint>,
        per_destination: Vec<DestinationIntegrity>,
    ) -> IntegrityReport {
        for entry in &per_destination {
            metrics::record_integrity_check(&entry.destination, &entry.status.to_string());
            events::emit(
                self.events.as_ref(),
                SyncEvent::IntegrityChecked {
                    collection: collection.to_string(),
                    destination: entry.destination.clone(),
                    status: entry.status.to_string(),
                },
            )
            .await;
        }
        let report = IntegrityReport {
            collection: collection.to_string(),
            source_fingerprint,
            overall_status: overall(&per_destination),
            per_destination,
            checked_at: Utc::now(),
        };
        info!(overall = ?report.overall_status, "Integrity check complete");
        report
    }

    async fn fingerprint_source(
        &self,
        source: &dyn RecordAdapter,
        collection: &str,
        profile: &SyncProfile,
    ) -> Result<FingerprintOutput> {
        source
            .connect()
            .await
            .map_err(|e| e.into_sync_error("connect_source"))?;
        let records = record_stream(source, collection, ReadFilter::all())
            .try_filter_map(|r| ready(Ok(profile.prepare(r))));
        fingerprint::build(records, self.config.clone(), profile.exclusion_set()).await
    }

    async fn fingerprint_destination(
        &self,
        dest: &dyn RecordAdapter,
        collection: &str,
        profile: &SyncProfile,
    ) -> Result<FingerprintOutput> {
        dest.connect()
            .await
            .map_err(|e| e.into_sync_error("connect_destination"))?;
        let records = record_stream(dest, collection, ReadFilter::all());
        fingerprint::build(records, self.config.clone(), profile.exclusion_set()).await
    }

    async fn check_destination(
        &self,
        source: &FingerprintOutput,
        dest: &dyn RecordAdapter,
        collection: &str,
        profile: &SyncProfile,
    ) -> DestinationIntegrity {
        let output = match self.fingerprint_destination(dest, collection, profile).await {
            Ok(output) => output,
            Err(e) => {
                warn!(destination = dest.name(), error = %e, "Destination unreachable");
                return DestinationIntegrity::unavailable(dest.name(), Some(&source.fingerprint), e.to_string());
            }
        };

        let probe = diff::probe(Some(&source.fingerprint), Some(&output.fingerprint));
        let mut entry = DestinationIntegrity {
            destination: dest.name().to_string(),
            fingerprint: Some(output.fingerprint.clone()),
            probe,
            missing_keys: Vec::new(),
            extra_keys: Vec::new(),
            mismatched_keys: Vec::new(),
            parity_status: parity::compare(&source.parity, &output.parity),
            status: DestinationStatus::Ok,
            error: None,
        };

        match entry.probe.status {
            ProbeStatus::Ok => {}
            ProbeStatus::Mismatch => {
                entry.status = DestinationStatus::Mismatch;
                if let (Some(a), Some(b)) = (&source.tree, &output.tree) {
                    let keys = diff::diff(a, b);
                    entry.missing_keys = keys.missing;
                    entry.extra_keys = keys.extra;
                    entry.mismatched_keys = keys.mismatched;
                }
                info!(
                    destination = dest.name(),
                    missing = entry.missing_keys.len(),
                    extra = entry.extra_keys.len(),
                    mismatched = entry.mismatched_keys.len(),
                    "Destination differs from source"
                );
            }
            ProbeStatus::Error => {
                entry.status = DestinationStatus::Error;
                entry.error = entry.probe.detail.clone();
            }
        }
        entry
    }
}

impl Default for IntegrityChecker {
    fn default() -> Self {
        Self::new(FingerprintConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterFuture, Capabilities, ConnectionReport, MemoryAdapter, RecordStream, WriteOutcome};
    use crate::error::AdapterError;
    use crate::events::MemoryEventSink;
    use crate::record::Record;

    const COLL: &str = "items";

    fn records(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| Record::new(format!("k{:04}", i)).with("v", i as i64))
            .collect()
    }

    async fn memory(name: &str, records: Vec<Record>) -> Arc<MemoryAdapter> {
        let adapter = Arc::new(MemoryAdapter::new(name));
        adapter.insert(COLL, records).await;
        adapter
    }

    struct Unreachable;

    impl RecordAdapter for Unreachable {
        fn name(&self) -> &str {
            "offline"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::new(crate::adapter::DestinationKind::Rest)
        }

        fn connect(&self) -> AdapterFuture<'_, ()> {
            Box::pin(async { Err(AdapterError::Transient("connection refused".into())) })
        }

        fn read_records<'a>(&'a self, _collection: &'a str, _filter: ReadFilter) -> RecordStream<'a> {
            Box::pin(futures::stream::empty())
        }

        fn write_batch<'a>(
            &'a self,
            _collection: &'a str,
            _upserts: Vec<Record>,
            _deletes: Vec<String>,
        ) -> AdapterFuture<'a, WriteOutcome> {
            Box::pin(async { Err(AdapterError::Fatal("offline".into())) })
        }

        fn test_connection(&self) -> AdapterFuture<'_, ConnectionReport> {
            Box::pin(async { Err(AdapterError::Transient("offline".into())) })
        }
    }

    #[tokio::test]
    async fn test_identical_destination_is_ok() {
        let source = memory("src", records(250)).await;
        let dest: Arc<dyn RecordAdapter> = memory("dst", records(250)).await;
        let report = IntegrityChecker::default()
            .verify(source.as_ref(), &[dest], COLL, &SyncProfile::default())
            .await;

        assert_eq!(report.overall_status, OverallStatus::Ok);
        let entry = report.destination("dst").unwrap();
        assert_eq!(entry.status, DestinationStatus::Ok);
        assert!(entry.parity_status.is_ok());
        assert_eq!(report.source_fingerprint.unwrap().record_count, 250);
    }

    #[tokio::test]
    async fn test_single_corruption_is_located() {
        let source = memory("src", records(250)).await;
        let mut corrupted = records(250);
        corrupted[137].set("v", -1);
        let dest: Arc<dyn RecordAdapter> = memory("dst", corrupted).await;
        let report = IntegrityChecker::default()
            .verify(source.as_ref(), &[dest], COLL, &SyncProfile::default())
            .await;

        assert_eq!(report.overall_status, OverallStatus::Degraded);
        let entry = report.destination("dst").unwrap();
        assert_eq!(entry.status, DestinationStatus::Mismatch);
        assert_eq!(entry.mismatched_keys, vec!["k0137"]);
        assert!(entry.missing_keys.is_empty() && entry.extra_keys.is_empty());
        assert_eq!(entry.parity_status, ParityStatus::Mismatch { blocks: vec![1] });
    }

    #[tokio::test]
    async fn test_missing_and_extra_keys() {
        let source = memory("src", records(10)).await;
        let mut dest_records = records(10);
        dest_records.remove(3);
        dest_records.push(Record::new("zz").with("v", 0));
        let dest: Arc<dyn RecordAdapter> = memory("dst", dest_records).await;
        let report = IntegrityChecker::default()
            .verify(source.as_ref(), &[dest], COLL, &SyncProfile::default())
            .await;

        let entry = report.destination("dst").unwrap();
        assert_eq!(entry.missing_keys, vec!["k0003"]);
        assert_eq!(entry.extra_keys, vec!["zz"]);
    }

    #[tokio::test]
    async fn test_unreachable_destination_is_an_entry() {
        let source = memory("src", records(10)).await;
        let good: Arc<dyn RecordAdapter> = memory("dst", records(10)).await;
        let offline: Arc<dyn RecordAdapter> = Arc::new(Unreachable);
        let events = Arc::new(MemoryEventSink::new());
        let report = IntegrityChecker::default()
            .with_events(events.clone())
            .verify(source.as_ref(), &[good, offline], COLL, &SyncProfile::default())
            .await;

        assert_eq!(report.overall_status, OverallStatus::Error);
        assert_eq!(report.destination("dst").unwrap().status, DestinationStatus::Ok);
        let offline = report.destination("offline").unwrap();
        assert_eq!(offline.status, DestinationStatus::Error);
        assert_eq!(offline.parity_status, ParityStatus::Unavailable);
        assert!(offline.error.as_deref().unwrap().contains("connection refused"));
        assert_eq!(events.count("integrity_checked").await, 2);
    }

    #[tokio::test]
    async fn test_unreachable_source_marks_every_destination() {
        let dest: Arc<dyn RecordAdapter> = memory("dst", records(3)).await;
        let report = IntegrityChecker::default()
            .verify(&Unreachable, &[dest], COLL, &SyncProfile::default())
            .await;
        assert_eq!(report.overall_status, OverallStatus::Error);
        assert!(report.source_fingerprint.is_none());
        assert!(report.per_destination[0].error.as_deref().unwrap().starts_with("source unavailable"));
    }

    #[tokio::test]
    async fn test_profile_shapes_source_before_hashing() {
        let source = memory(
            "src",
            vec![Record::new("a").with("status", "on").with("secret", "x")],
        )
        .await;
        let dest: Arc<dyn RecordAdapter> = memory("dst", vec![Record::new("a").with("state", "on")]).await;
        let profile = SyncProfile::default()
            .with_mapping("status", "state")
            .with_excluded("secret");
        let report = IntegrityChecker::default()
            .verify(source.as_ref(), &[dest], COLL, &profile)
            .await;
        assert_eq!(report.overall_status, OverallStatus::Ok);
    }

    #[tokio::test]
    async fn test_no_destinations_is_ok() {
        let source = memory("src", records(3)).await;
        let report = IntegrityChecker::default()
            .verify(source.as_ref(), &[], COLL, &SyncProfile::default())
            .await;
        assert_eq!(report.overall_status, OverallStatus::Ok);
        assert!(report.per_destination.is_empty());
    }
}
