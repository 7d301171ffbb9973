// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Record adapter interface.
//!
//! Every store the engine reads from or writes to (REST APIs, direct store
//! connections, event collectors, object storage, filesystem exports) sits
//! behind [`RecordAdapter`]. Adapters are picked by [`DestinationKind`] when
//! the host builds its configuration and declare what they can do through
//! [`Capabilities`]; the core never inspects concrete adapter types.
//!
//! Adapters classify their own failures as [`AdapterError::Transient`] or
//! [`AdapterError::Fatal`]. Per-record rejections are not errors: they come
//! back in [`WriteOutcome::failed`].
//!
//! # Example
//!
//! ```rust,no_run
//! use collection_sync::adapter::{
//!     AdapterFuture, Capabilities, ConnectionReport, DestinationKind, ReadFilter,
//!     RecordAdapter, RecordStream, WriteOutcome,
//! };
//! use collection_sync::record::Record;
//!
//! struct Sink;
//!
//! impl RecordAdapter for Sink {
//!     fn name(&self) -> &str { "sink" }
//!
//!     fn capabilities(&self) -> Capabilities {
//!         Capabilities::new(DestinationKind::EventCollector)
//!     }
//!
//!     fn connect(&self) -> AdapterFuture<'_, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//!
//!     fn read_records<'a>(&'a self, _collection: &'a str, _filter: ReadFilter) -> RecordStream<'a> {
//!         Box::pin(futures::stream::empty())
//!     }
//!
//!     fn write_batch<'a>(
//!         &'a self,
//!         _collection: &'a str,
//!         upserts: Vec<Record>,
//!         _deletes: Vec<String>,
//!     ) -> AdapterFuture<'a, WriteOutcome> {
//!         Box::pin(async move { Ok(WriteOutcome::written(upserts.len())) })
//!     }
//!
//!     fn test_connection(&self) -> AdapterFuture<'_, ConnectionReport> {
//!         Box::pin(async { Ok(ConnectionReport::ok(std::time::Duration::ZERO)) })
//!     }
//! }
//! ```

use crate::error::{AdapterError, Result, SyncError};
use crate::record::Record;
use futures::{Stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Boxed future for the engine's own async traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Boxed future returned by adapters.
pub type AdapterFuture<'a, T> = Pin<Box<dyn Future<Output = std::result::Result<T, AdapterError>> + Send + 'a>>;

/// Lazy, key-ordered record sequence.
pub type RecordStream<'a> = Pin<Box<dyn Stream<Item = std::result::Result<Record, AdapterError>> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    Rest,
    DirectStore,
    EventCollector,
    ObjectStorage,
    Filesystem,
    Memory,
}

impl std::fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rest => write!(f, "rest"),
            Self::DirectStore => write!(f, "direct_store"),
            Self::EventCollector => write!(f, "event_collector"),
            Self::ObjectStorage => write!(f, "object_storage"),
            Self::Filesystem => write!(f, "filesystem"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub kind: DestinationKind,
    /// Safe to share between concurrently running jobs.
    pub concurrent_safe: bool,
    /// Honors the `deletes` half of `write_batch`.
    pub supports_delete: bool,
}

impl Capabilities {
    /// Conservative defaults per kind: append-style sinks cannot delete and
    /// nothing is shared across jobs unless it says so.
    pub fn new(kind: DestinationKind) -> Self {
        let supports_delete = !matches!(kind, DestinationKind::EventCollector);
        Self {
            kind,
            concurrent_safe: false,
            supports_delete,
        }
    }

    pub fn concurrent(mut self) -> Self {
        self.concurrent_safe = true;
        self
    }
}

/// Where to start reading and which keys to return.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadFilter {
    /// Resume strictly after this key.
    pub after_key: Option<String>,
    /// Restrict to these keys.
    pub keys: Option<Vec<String>>,
}

impl ReadFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn keys(keys: Vec<String>) -> Self {
        Self {
            after_key: None,
            keys: Some(keys),
        }
    }

    pub fn after(key: impl Into<String>) -> Self {
        Self {
            after_key: Some(key.into()),
            keys: None,
        }
    }

    pub fn admits(&self, key: &str) -> bool {
        self.after_key.as_deref().map_or(true, |after| key > after)
            && self.keys.as_ref().map_or(true, |ks| ks.iter().any(|k| k == key))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub key: String,
    pub reason: String,
}

impl RecordFailure {
    pub fn new(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    pub written: usize,
    pub deleted: usize,
    pub failed: Vec<RecordFailure>,
}

impl WriteOutcome {
    pub fn written(n: usize) -> Self {
        Self {
            written: n,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionReport {
    pub ok: bool,
    pub latency: Duration,
    pub server_info: Option<String>,
    pub error: Option<String>,
}

impl ConnectionReport {
    pub fn ok(latency: Duration) -> Self {
        Self {
            ok: true,
            latency,
            server_info: None,
            error: None,
        }
    }

    pub fn failed(latency: Duration, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            latency,
            server_info: None,
            error: Some(error.into()),
        }
    }
}

/// Source or destination store.
pub trait RecordAdapter: Send + Sync + 'static {
    /// Stable name used in logs, metrics and destination leases.
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    fn connect(&self) -> AdapterFuture<'_, ()>;

    /// Records in ascending key order. Restartable through `filter.after_key`.
    fn read_records<'a>(&'a self, collection: &'a str, filter: ReadFilter) -> RecordStream<'a>;

    /// Apply one batch. Record-level rejections go in the outcome; an `Err`
    /// means the batch as a whole did not land.
    fn write_batch<'a>(
        &'a self,
        collection: &'a str,
        upserts: Vec<Record>,
        deletes: Vec<String>,
    ) -> AdapterFuture<'a, WriteOutcome>;

    fn test_connection(&self) -> AdapterFuture<'_, ConnectionReport>;
}

/// Adapter read stream mapped into the engine's error type.
pub fn record_stream<'a>(
    adapter: &'a dyn RecordAdapter,
    collection: &'a str,
    filter: ReadFilter,
) -> impl Stream<Item = Result<Record>> + Send + 'a {
    adapter
        .read_records(collection, filter)
        .map_err(|e| e.into_sync_error("read_records"))
}

/// Drain a read into memory.
pub async fn collect_records(
    adapter: &dyn RecordAdapter,
    collection: &str,
    filter: ReadFilter,
) -> Result<Vec<Record>> {
    record_stream(adapter, collection, filter).try_collect().await
}

// =============================================================================
// In-memory adapter
// =============================================================================

/// Sorted in-memory store. Used by tests, dry runs and as a reference for
/// adapter authors.
pub struct MemoryAdapter {
    name: String,
    capabilities: Capabilities,
    collections: RwLock<HashMap<String, BTreeMap<String, Record>>>,
    write_calls: AtomicUsize,
}

impl MemoryAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: Capabilities::new(DestinationKind::Memory).concurrent(),
            collections: RwLock::new(HashMap::new()),
            write_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub async fn insert(&self, collection: &str, records: impl IntoIterator<Item = Record>) {
        let mut collections = self.collections.write().await;
        let coll = collections.entry(collection.to_string()).or_default();
        for r in records {
            coll.insert(r.key.clone(), r);
        }
    }

    /// Snapshot of a collection in key order.
    pub async fn records(&self, collection: &str) -> Vec<Record> {
        self.collections
            .read()
            .await
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn get(&self, collection: &str, key: &str) -> Option<Record> {
        self.collections.read().await.get(collection)?.get(key).cloned()
    }

    pub async fn len(&self, collection: &str) -> usize {
        self.collections.read().await.get(collection).map_or(0, BTreeMap::len)
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }
}

impl RecordAdapter for MemoryAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn connect(&self) -> AdapterFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn read_records<'a>(&'a self, collection: &'a str, filter: ReadFilter) -> RecordStream<'a> {
        Box::pin(
            futures::stream::once(async move {
                let snapshot: Vec<Record> = self
                    .collections
                    .read()
                    .await
                    .get(collection)
                    .map(|c| c.values().filter(|r| filter.admits(&r.key)).cloned().collect())
                    .unwrap_or_default();
                futures::stream::iter(snapshot.into_iter().map(Ok))
            })
            .flatten(),
        )
    }

    fn write_batch<'a>(
        &'a self,
        collection: &'a str,
        upserts: Vec<Record>,
        deletes: Vec<String>,
    ) -> AdapterFuture<'a, WriteOutcome> {
        Box::pin(async move {
            self.write_calls.fetch_add(1, Ordering::SeqCst);
            let mut collections = self.collections.write().await;
            let coll = collections.entry(collection.to_string()).or_default();
            let mut outcome = WriteOutcome::default();
            for r in upserts {
                coll.insert(r.key.clone(), r);
                outcome.written += 1;
            }
            for k in deletes {
                if coll.remove(&k).is_some() {
                    outcome.deleted += 1;
                }
            }
            tracing::trace!(adapter = %self.name, collection, written = outcome.written, deleted = outcome.deleted, "Memory batch applied");
            Ok(outcome)
        })
    }

    fn test_connection(&self) -> AdapterFuture<'_, ConnectionReport> {
        Box::pin(async move {
            let start = Instant::now();
            let collections = self.collections.read().await.len();
            Ok(ConnectionReport {
                server_info: Some(format!("memory:{} ({} collections)", self.name, collections)),
                ..ConnectionReport::ok(start.elapsed())
            })
        })
    }
}

/// Probe an adapter, folding errors into the report.
pub async fn check_connection(adapter: &dyn RecordAdapter) -> ConnectionReport {
    let start = Instant::now();
    match adapter.test_connection().await {
        Ok(report) => report,
        Err(e) => ConnectionReport::failed(start.elapsed(), e.to_string()),
    }
}

impl From<RecordFailure> for SyncError {
    fn from(f: RecordFailure) -> Self {
        SyncError::Record {
            key: f.key,
            reason: f.reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_adapter_reads_in_key_order() {
        let adapter = MemoryAdapter::new("mem");
        adapter
            .insert("c", vec![Record::new("b"), Record::new("a"), Record::new("c")])
            .await;
        let records = collect_records(&adapter, "c", ReadFilter::all()).await.unwrap();
        let keys: Vec<_> = records.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_memory_adapter_filter() {
        let adapter = MemoryAdapter::new("mem");
        adapter
            .insert("c", (0..5).map(|i| Record::new(format!("k{}", i))))
            .await;
        let after = collect_records(&adapter, "c", ReadFilter::after("k2")).await.unwrap();
        assert_eq!(after.len(), 2);
        let picked = collect_records(&adapter, "c", ReadFilter::keys(vec!["k1".into(), "k4".into()]))
            .await
            .unwrap();
        assert_eq!(picked.len(), 2);
    }

    #[tokio::test]
    async fn test_memory_adapter_write_batch() {
        let adapter = MemoryAdapter::new("mem");
        adapter.insert("c", vec![Record::new("old")]).await;
        let outcome = adapter
            .write_batch("c", vec![Record::new("new").with("v", 1)], vec!["old".into(), "absent".into()])
            .await
            .unwrap();
        assert_eq!(outcome.written, 1);
        assert_eq!(outcome.deleted, 1);
        assert!(outcome.failed.is_empty());
        assert_eq!(adapter.len("c").await, 1);
        assert_eq!(adapter.write_calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_collection_is_empty() {
        let adapter = MemoryAdapter::new("mem");
        assert!(collect_records(&adapter, "nope", ReadFilter::all()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_check_connection() {
        let adapter = MemoryAdapter::new("mem");
        let report = check_connection(&adapter).await;
        assert!(report.ok);
        assert!(report.server_info.unwrap().contains("mem"));
    }

    #[test]
    fn test_capabilities_per_kind() {
        assert!(!Capabilities::new(DestinationKind::EventCollector).supports_delete);
        assert!(Capabilities::new(DestinationKind::Rest).supports_delete);
        assert!(!Capabilities::new(DestinationKind::Rest).concurrent_safe);
        assert!(Capabilities::new(DestinationKind::DirectStore).concurrent().concurrent_safe);
    }

    #[test]
    fn test_read_filter_admits() {
        let f = ReadFilter {
            after_key: Some("b".into()),
            keys: Some(vec!["a".into(), "c".into()]),
        };
        assert!(!f.admits("a"));
        assert!(f.admits("c"));
        assert!(!f.admits("d"));
    }
}
