//! Record codec: canonical encoding and content checksums.
//!
//! The canonical form is a type-tagged byte encoding, so the string `"1"`
//! and the integer `1` never collide:
//!
//! ```text
//! N                       null
//! T | F                   bool
//! I <i64 BE>              int
//! D <f64 bits BE>         float (-0.0 folded to 0.0)
//! S <u64 len> <utf-8>     string
//! A <u64 n> <item>*       array, order preserved
//! O <u64 n> (<u64 len> <name> <value>)*   object, names sorted
//! ```
//!
//! A record encodes as an object of its non-excluded fields. The record key
//! is not part of the checksum; the Merkle leaf binds key and checksum.

use crate::error::{Result, SyncError};
use crate::record::{Record, Value};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Reserved field names excluded from hashing and sync by default.
pub const RESERVED_FIELDS: [&str; 3] = ["_user", "_raw", "_batchID"];

/// 256-bit content digest of a record's canonical encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Checksum(pub [u8; 32]);

impl Checksum {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Checksum({})", &self.to_hex()[..12])
    }
}

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Field names left out of canonical encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionSet {
    excluded: BTreeSet<String>,
}

impl Default for ExclusionSet {
    fn default() -> Self {
        Self {
            excluded: RESERVED_FIELDS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ExclusionSet {
    /// No exclusions at all, reserved fields included.
    pub fn none() -> Self {
        Self {
            excluded: BTreeSet::new(),
        }
    }

    /// Reserved fields plus `extra`.
    pub fn with_fields<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = Self::default();
        for f in extra {
            set.excluded.insert(f.into());
        }
        set
    }

    pub fn exclude(mut self, field: impl Into<String>) -> Self {
        self.excluded.insert(field.into());
        self
    }

    /// Opt a (usually reserved) field back in.
    pub fn include(mut self, field: &str) -> Self {
        self.excluded.remove(field);
        self
    }

    pub fn contains(&self, field: &str) -> bool {
        self.excluded.contains(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.excluded.iter().map(String::as_str)
    }
}

/// Encode a record's non-excluded fields in canonical form.
pub fn canonicalize(record: &Record, excluded: &ExclusionSet) -> Result<Vec<u8>> {
    let mut names: Vec<&String> = record
        .fields
        .keys()
        .filter(|name| !excluded.contains(name))
        .collect();
    names.sort();

    let mut out = Vec::with_capacity(64);
    out.push(b'O');
    out.extend_from_slice(&(names.len() as u64).to_be_bytes());
    for name in names {
        write_str_body(&mut out, name);
        if let Some(value) = record.fields.get(name) {
            encode_value(&mut out, name, value)?;
        }
    }
    Ok(out)
}

/// SHA-256 over [`canonicalize`].
pub fn checksum(record: &Record, excluded: &ExclusionSet) -> Result<Checksum> {
    checksum_with_size(record, excluded).map(|(c, _)| c)
}

/// Checksum plus canonical byte length, for fingerprint size accounting.
pub fn checksum_with_size(record: &Record, excluded: &ExclusionSet) -> Result<(Checksum, usize)> {
    let bytes = canonicalize(record, excluded)?;
    let digest: [u8; 32] = Sha256::digest(&bytes).into();
    Ok((Checksum(digest), bytes.len()))
}

fn write_str_body(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u64).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn encode_value(out: &mut Vec<u8>, field: &str, value: &Value) -> Result<()> {
    match value {
        Value::Null => out.push(b'N'),
        Value::Bool(true) => out.push(b'T'),
        Value::Bool(false) => out.push(b'F'),
        Value::Int(i) => {
            out.push(b'I');
            out.extend_from_slice(&i.to_be_bytes());
        }
        Value::Float(f) => {
            if f.is_nan() {
                return Err(SyncError::encoding(field, "NaN has no canonical form"));
            }
            let normalized = if *f == 0.0 { 0.0f64 } else { *f };
            out.push(b'D');
            out.extend_from_slice(&normalized.to_bits().to_be_bytes());
        }
        Value::String(s) => {
            out.push(b'S');
            write_str_body(out, s);
        }
        Value::Array(items) => {
            out.push(b'A');
            out.extend_from_slice(&(items.len() as u64).to_be_bytes());
            for item in items {
                encode_value(out, field, item)?;
            }
        }
        Value::Object(map) => {
            // BTreeMap iterates sorted
            out.push(b'O');
            out.extend_from_slice(&(map.len() as u64).to_be_bytes());
            for (k, v) in map {
                write_str_body(out, k);
                encode_value(out, field, v)?;
            }
        }
        Value::Bytes(_) => {
            return Err(SyncError::encoding(
                field,
                "binary blob without explicit handling; exclude or map the field",
            ));
        }
    }
    Ok(())
}
