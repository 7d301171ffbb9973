//! Sync profiles: mode, conflict policy and the record transform applied to
//! source records before any comparison.
//!
//! The transform order is fixed: filter on the raw record, strip excluded
//! fields, rename mapped fields. Checksums are computed after the transform,
//! so a rename alone never looks like a content change.

use crate::codec::ExclusionSet;
use crate::conflict::ConflictPolicy;
use crate::error::{Result, SyncError};
use crate::record::{Record, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

pub const DEFAULT_TIMESTAMP_FIELD: &str = "_updated";
pub const DEFAULT_BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    #[default]
    FullSync,
    Incremental,
    AppendOnly,
    MasterSlave,
    Bidirectional,
}

impl SyncMode {
    pub const ALL: [SyncMode; 5] = [
        SyncMode::FullSync,
        SyncMode::Incremental,
        SyncMode::AppendOnly,
        SyncMode::MasterSlave,
        SyncMode::Bidirectional,
    ];
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FullSync => write!(f, "full_sync"),
            Self::Incremental => write!(f, "incremental"),
            Self::AppendOnly => write!(f, "append_only"),
            Self::MasterSlave => write!(f, "master_slave"),
            Self::Bidirectional => write!(f, "bidirectional"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncProfile {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub mode: SyncMode,

    #[serde(default)]
    pub conflict_policy: ConflictPolicy,

    /// Source field name -> destination field name.
    #[serde(default)]
    pub field_mappings: BTreeMap<String, String>,

    /// Removed before mapping and before hashing.
    #[serde(default)]
    pub excluded_fields: Vec<String>,

    /// Reserved fields (`_user`, `_raw`, `_batchID`) to sync anyway.
    #[serde(default)]
    pub include_reserved: Vec<String>,

    /// Equality predicate on raw source fields. Object values match as a
    /// subset of the record's object.
    #[serde(default)]
    pub filter_query: Option<BTreeMap<String, Value>>,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default)]
    pub delete_orphans: bool,

    /// Field compared by incremental, bidirectional and `newest_wins`.
    /// `None` makes incremental fall back to checksum comparison.
    #[serde(default = "default_timestamp_field")]
    pub timestamp_field: Option<String>,
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_timestamp_field() -> Option<String> {
    Some(DEFAULT_TIMESTAMP_FIELD.to_string())
}

impl Default for SyncProfile {
    fn default() -> Self {
        Self {
            name: String::new(),
            mode: SyncMode::default(),
            conflict_policy: ConflictPolicy::default(),
            field_mappings: BTreeMap::new(),
            excluded_fields: Vec::new(),
            include_reserved: Vec::new(),
            filter_query: None,
            batch_size: DEFAULT_BATCH_SIZE,
            delete_orphans: false,
            timestamp_field: default_timestamp_field(),
        }
    }
}

impl SyncProfile {
    pub fn new(mode: SyncMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    pub fn with_delete_orphans(mut self, delete: bool) -> Self {
        self.delete_orphans = delete;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_mapping(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.field_mappings.insert(from.into(), to.into());
        self
    }

    pub fn with_excluded(mut self, field: impl Into<String>) -> Self {
        self.excluded_fields.push(field.into());
        self
    }

    pub fn with_filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter_query
            .get_or_insert_with(BTreeMap::new)
            .insert(field.into(), value.into());
        self
    }

    pub fn with_timestamp_field(mut self, field: Option<&str>) -> Self {
        self.timestamp_field = field.map(str::to_string);
        self
    }

    pub fn timestamp_field(&self) -> Option<&str> {
        self.timestamp_field.as_deref()
    }

    /// Fields left out of hashing on both sides.
    pub fn exclusion_set(&self) -> ExclusionSet {
        let mut set = ExclusionSet::with_fields(self.excluded_fields.iter().cloned());
        for f in &self.include_reserved {
            set = set.include(f);
        }
        set
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(SyncError::Config(format!(
                "profile '{}': batch_size must be > 0",
                self.name
            )));
        }
        let mut targets = HashSet::new();
        for to in self.field_mappings.values() {
            if !targets.insert(to) {
                return Err(SyncError::Config(format!(
                    "profile '{}': two fields map to '{}'",
                    self.name, to
                )));
            }
        }
        Ok(())
    }

    /// Does the raw source record pass `filter_query`?
    pub fn matches(&self, record: &Record) -> bool {
        match &self.filter_query {
            None => true,
            Some(filter) => filter
                .iter()
                .all(|(field, expected)| record.get(field).is_some_and(|actual| sub_match(actual, expected))),
        }
    }

    /// Filter, strip, rename. `None` when the record is filtered out.
    pub fn prepare(&self, record: Record) -> Option<Record> {
        if !self.matches(&record) {
            return None;
        }
        let excluded = self.exclusion_set();
        let Record { key, fields } = record;
        let (mapped, mut fields): (HashMap<_, _>, HashMap<_, _>) = fields
            .into_iter()
            .filter(|(name, _)| !excluded.contains(name))
            .partition(|(name, _)| self.field_mappings.contains_key(name));
        // a mapped value overwrites an unmapped field of the same name
        for (name, value) in mapped {
            if let Some(to) = self.field_mappings.get(&name) {
                fields.insert(to.clone(), value);
            }
        }
        Some(Record { key, fields })
    }

    /// Undo `field_mappings` on a destination-shaped record, for writes that
    /// flow back to the source.
    pub fn restore_source_names(&self, record: Record) -> Record {
        if self.field_mappings.is_empty() {
            return record;
        }
        let Record { key, fields } = record;
        let fields = fields
            .into_iter()
            .map(|(name, value)| {
                match self.field_mappings.iter().find(|(_, to)| **to == name) {
                    Some((from, _)) => (from.clone(), value),
                    None => (name, value),
                }
            })
            .collect();
        Record { key, fields }
    }
}

fn sub_match(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Object(a), Value::Object(e)) => e
            .iter()
            .all(|(k, ev)| a.get(k).is_some_and(|av| sub_match(av, ev))),
        (Value::Int(a), Value::Float(e)) | (Value::Float(e), Value::Int(a)) => (*a as f64) == *e,
        _ => actual == expected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> Record {
        let mut addr = BTreeMap::new();
        addr.insert("city".to_string(), Value::from("Leeds"));
        addr.insert("zip".to_string(), Value::from("LS1"));
        Record::new("u1")
            .with("status", "active")
            .with("age", 30)
            .with("address", Value::Object(addr))
            .with("secret", "x")
            .with("_raw", "payload")
    }

    #[test]
    fn test_default_profile() {
        let p = SyncProfile::default();
        assert_eq!(p.mode, SyncMode::FullSync);
        assert_eq!(p.batch_size, 1000);
        assert_eq!(p.timestamp_field(), Some("_updated"));
        assert!(!p.delete_orphans);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_filter_equality() {
        let p = SyncProfile::default().with_filter("status", "active");
        assert!(p.matches(&user()));
        let p = SyncProfile::default().with_filter("status", "disabled");
        assert!(!p.matches(&user()));
        let p = SyncProfile::default().with_filter("missing", 1);
        assert!(!p.matches(&user()));
    }

    #[test]
    fn test_filter_sub_match() {
        let mut sub = BTreeMap::new();
        sub.insert("city".to_string(), Value::from("Leeds"));
        let p = SyncProfile::default().with_filter("address", Value::Object(sub));
        assert!(p.matches(&user()));
    }

    #[test]
    fn test_filter_numeric_cross_type() {
        let p = SyncProfile::default().with_filter("age", 30.0);
        assert!(p.matches(&user()));
    }

    #[test]
    fn test_prepare_excludes_then_maps() {
        let p = SyncProfile::default()
            .with_excluded("secret")
            .with_mapping("status", "state")
            .with_mapping("secret", "leaked");
        let r = p.prepare(user()).unwrap();
        assert_eq!(r.get("state"), Some(&Value::from("active")));
        assert!(r.get("status").is_none());
        assert!(r.get("secret").is_none());
        assert!(r.get("leaked").is_none());
        assert!(r.get("_raw").is_none(), "reserved fields are not synced");
    }

    #[test]
    fn test_prepare_mapped_value_wins_over_same_named_field() {
        let p = SyncProfile::default().with_mapping("amt", "amount");
        assert!(p.validate().is_ok());
        for _ in 0..50 {
            let r = p.prepare(Record::new("o1").with("amt", 1).with("amount", 2)).unwrap();
            assert_eq!(r.get("amount"), Some(&Value::Int(1)));
            assert!(r.get("amt").is_none());
        }
    }

    #[test]
    fn test_prepare_keeps_included_reserved() {
        let mut p = SyncProfile::default();
        p.include_reserved.push("_raw".to_string());
        let r = p.prepare(user()).unwrap();
        assert!(r.get("_raw").is_some());
    }

    #[test]
    fn test_prepare_filtered_out() {
        let p = SyncProfile::default().with_filter("status", "disabled");
        assert!(p.prepare(user()).is_none());
    }

    #[test]
    fn test_restore_source_names() {
        let p = SyncProfile::default().with_mapping("status", "state");
        let dest = Record::new("u1").with("state", "active").with("age", 30);
        let back = p.restore_source_names(dest);
        assert_eq!(back.get("status"), Some(&Value::from("active")));
        assert!(back.get("state").is_none());
        assert_eq!(back.get("age"), Some(&Value::Int(30)));
    }

    #[test]
    fn test_validate_rejects_zero_batch_and_mapping_collision() {
        assert!(SyncProfile::default().with_batch_size(0).validate().is_err());
        let p = SyncProfile::default().with_mapping("a", "x").with_mapping("b", "x");
        assert!(matches!(p.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_profile_serde() {
        let json = r#"{
            "name": "orders",
            "mode": "incremental",
            "conflict_policy": "newest_wins",
            "field_mappings": {"amt": "amount"},
            "filter_query": {"region": "eu"},
            "timestamp_field": null
        }"#;
        let p: SyncProfile = serde_json::from_str(json).unwrap();
        assert_eq!(p.mode, SyncMode::Incremental);
        assert_eq!(p.conflict_policy, ConflictPolicy::NewestWins);
        assert_eq!(p.field_mappings["amt"], "amount");
        assert_eq!(p.timestamp_field(), None);
        assert_eq!(p.batch_size, 1000);
    }

    #[test]
    fn test_mode_display() {
        let names: Vec<String> = SyncMode::ALL.iter().map(ToString::to_string).collect();
        assert_eq!(
            names,
            vec!["full_sync", "incremental", "append_only", "master_slave", "bidirectional"]
        );
    }
}
