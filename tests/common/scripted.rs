//! Adapters and sinks with scripted misbehaviour.
//!
//! `ScriptedAdapter` wraps a [`MemoryAdapter`] and fails selected write
//! calls (1-indexed), rejects chosen keys record by record, and can refuse
//! connections. Everything else is delegated, so assertions can inspect the
//! inner store directly.

use collection_sync::adapter::{
    AdapterFuture, BoxFuture, Capabilities, ConnectionReport, RecordFailure, RecordStream,
};
use collection_sync::conflict::ConflictContext;
use collection_sync::{
    AdapterError, ConflictQueue, EventSink, MemoryAdapter, ReadFilter, Record, RecordAdapter, SyncError,
    SyncEvent, WriteOutcome,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub struct ScriptedAdapter {
    pub inner: MemoryAdapter,
    write_calls: AtomicUsize,
    connect_calls: AtomicUsize,
    script: Mutex<HashMap<usize, AdapterError>>,
    fail_from: Mutex<Option<(usize, AdapterError)>>,
    reject_keys: Mutex<Vec<String>>,
    refuse_connect: Mutex<Option<AdapterError>>,
    write_delay: Duration,
}

impl ScriptedAdapter {
    pub fn new(name: &str) -> Self {
        Self {
            inner: MemoryAdapter::new(name),
            write_calls: AtomicUsize::new(0),
            connect_calls: AtomicUsize::new(0),
            script: Mutex::new(HashMap::new()),
            fail_from: Mutex::new(None),
            reject_keys: Mutex::new(Vec::new()),
            refuse_connect: Mutex::new(None),
            write_delay: Duration::ZERO,
        }
    }

    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    /// Fail write call number `call` (1-indexed) with `error`.
    pub fn fail_call(&self, call: usize, error: AdapterError) {
        self.script.lock().unwrap().insert(call, error);
    }

    /// Fail every write call from `call` onwards.
    pub fn fail_from(&self, call: usize, error: AdapterError) {
        *self.fail_from.lock().unwrap() = Some((call, error));
    }

    pub fn heal(&self) {
        self.script.lock().unwrap().clear();
        *self.fail_from.lock().unwrap() = None;
        *self.refuse_connect.lock().unwrap() = None;
    }

    pub fn reject_key(&self, key: &str) {
        self.reject_keys.lock().unwrap().push(key.to_string());
    }

    pub fn refuse_connections(&self, error: AdapterError) {
        *self.refuse_connect.lock().unwrap() = Some(error);
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    fn scripted_error(&self, call: usize) -> Option<AdapterError> {
        if let Some(e) = self.script.lock().unwrap().get(&call) {
            return Some(e.clone());
        }
        match &*self.fail_from.lock().unwrap() {
            Some((from, e)) if call >= *from => Some(e.clone()),
            _ => None,
        }
    }
}

impl RecordAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    fn connect(&self) -> AdapterFuture<'_, ()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let refused = self.refuse_connect.lock().unwrap().clone();
        Box::pin(async move {
            match refused {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
    }

    fn read_records<'a>(&'a self, collection: &'a str, filter: ReadFilter) -> RecordStream<'a> {
        self.inner.read_records(collection, filter)
    }

    fn write_batch<'a>(
        &'a self,
        collection: &'a str,
        upserts: Vec<Record>,
        deletes: Vec<String>,
    ) -> AdapterFuture<'a, WriteOutcome> {
        Box::pin(async move {
            let call = self.write_calls.fetch_add(1, Ordering::SeqCst) + 1;
            let scripted = self.scripted_error(call);
            let reject = self.reject_keys.lock().unwrap().clone();
            if !self.write_delay.is_zero() {
                tokio::time::sleep(self.write_delay).await;
            }
            if let Some(e) = scripted {
                return Err(e);
            }
            let (rejected, accepted): (Vec<Record>, Vec<Record>) =
                upserts.into_iter().partition(|r| reject.contains(&r.key));
            let mut outcome = self.inner.write_batch(collection, accepted, deletes).await?;
            outcome
                .failed
                .extend(rejected.into_iter().map(|r| RecordFailure::new(r.key, "rejected by destination")));
            Ok(outcome)
        })
    }

    fn test_connection(&self) -> AdapterFuture<'_, ConnectionReport> {
        self.inner.test_connection()
    }
}

/// Event sink that refuses everything.
pub struct FailingEventSink {
    pub attempts: AtomicUsize,
}

impl FailingEventSink {
    pub fn new() -> Self {
        Self {
            attempts: AtomicUsize::new(0),
        }
    }
}

impl EventSink for FailingEventSink {
    fn name(&self) -> &str {
        "failing"
    }

    fn emit(&self, _event: SyncEvent) -> BoxFuture<'_, ()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Err(SyncError::Internal("event bus offline".into())) })
    }
}

/// Conflict queue that refuses everything.
pub struct FailingConflictQueue;

impl ConflictQueue for FailingConflictQueue {
    fn enqueue(&self, _source: Record, _dest: Record, _context: ConflictContext) -> BoxFuture<'_, ()> {
        Box::pin(async { Err(SyncError::transient("enqueue", "queue unavailable")) })
    }
}
