//! Record data model.
//!
//! A [`Record`] is a unique key plus an unordered map of named [`Value`]s.
//! Field insertion order never matters: the codec sorts before hashing.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Field name that carries the record key in JSON payloads.
pub const DEFAULT_KEY_FIELD: &str = "_key";

/// A field value.
///
/// `Bytes` exists so adapters can surface binary blobs without lossy
/// conversion. The codec rejects it; profiles are expected to exclude or
/// map such fields before hashing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
            Self::Bytes(_) => "bytes",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Int(n as i64)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Float(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Integers must fit `i64`. A larger `u64` would only survive as a lossy
/// float, and two distinct values could then share a checksum.
impl TryFrom<serde_json::Value> for Value {
    type Error = String;

    fn try_from(v: serde_json::Value) -> std::result::Result<Self, Self::Error> {
        Ok(match v {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => match (n.as_i64(), n.as_u64(), n.as_f64()) {
                (Some(i), _, _) => Self::Int(i),
                (None, Some(u), _) => return Err(format!("integer {} out of range", u)),
                (None, None, Some(f)) => Self::Float(f),
                (None, None, None) => return Err(format!("unrepresentable number {}", n)),
            },
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(a) => {
                Self::Array(a.into_iter().map(Value::try_from).collect::<std::result::Result<_, _>>()?)
            }
            serde_json::Value::Object(o) => Self::Object(
                o.into_iter()
                    .map(|(k, v)| Value::try_from(v).map(|v| (k, v)))
                    .collect::<std::result::Result<_, _>>()?,
            ),
        })
    }
}

impl From<Value> for serde_json::Value {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Int(i) => serde_json::Value::from(i),
            Value::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s),
            Value::Array(a) => serde_json::Value::Array(a.into_iter().map(Into::into).collect()),
            Value::Object(o) => {
                serde_json::Value::Object(o.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
            Value::Bytes(b) => serde_json::Value::String(hex::encode(b)),
        }
    }
}

/// One keyed record from a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    pub fields: HashMap<String, Value>,
}

impl Record {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            fields: HashMap::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    /// Build a record from a JSON object, taking the key from `key_field`.
    ///
    /// The key field is removed from the field map. String and integer keys
    /// are accepted.
    pub fn from_json(value: serde_json::Value, key_field: &str) -> Result<Self> {
        let serde_json::Value::Object(mut obj) = value else {
            return Err(SyncError::encoding(key_field, "record payload is not a JSON object"));
        };
        let key = match obj.remove(key_field) {
            Some(serde_json::Value::String(s)) => s,
            Some(serde_json::Value::Number(n)) => n.to_string(),
            Some(other) => {
                return Err(SyncError::encoding(
                    key_field,
                    format!("unsupported key type: {}", other),
                ))
            }
            None => return Err(SyncError::encoding(key_field, "missing key field")),
        };
        let fields = obj
            .into_iter()
            .map(|(k, v)| match Value::try_from(v) {
                Ok(v) => Ok((k, v)),
                Err(reason) => Err(SyncError::encoding(&k, reason)),
            })
            .collect::<Result<_>>()?;
        Ok(Self { key, fields })
    }

    /// Render as a JSON object with the key under `key_field`.
    pub fn to_json(&self, key_field: &str) -> serde_json::Value {
        let mut obj: serde_json::Map<String, serde_json::Value> = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone().into()))
            .collect();
        obj.insert(key_field.to_string(), serde_json::Value::String(self.key.clone()));
        serde_json::Value::Object(obj)
    }
}

/// Where a snapshot comes from. Used for logging and reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceIdentity {
    pub store: String,
    pub collection: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

impl std::fmt::Display for SourceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.store, ns, self.collection),
            None => write!(f, "{}/{}", self.store, self.collection),
        }
    }
}
