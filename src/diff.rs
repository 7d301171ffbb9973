//! Diff engine: finger probe and key-level Merkle diff.
//!
//! [`probe`] is the O(1) health check over two fingerprints (count + root).
//! [`diff`] walks two retained trees top-down in lock-step and only looks at
//! leaves beneath subtrees whose hashes differ.
//!
//! # Alignment
//!
//! With equal leaf counts both trees have the same shape, so node `(l, i)`
//! covers the same leaf positions on both sides. Positions are not keys,
//! though: one insert plus one delete shifts keys across subtree borders.
//! The walk only descends into a node's children when the first key of the
//! right child is the same on both sides. That keeps every descended node
//! bounded by the same key interval on both sides, so per-subtree results
//! add up to the global diff. Where boundaries disagree (or the counts
//! differ from the start) the engine falls back to a key-indexed merge over
//! the leaves beneath that node.

use crate::fingerprint::Fingerprint;
use crate::merkle::{Leaf, MerkleTree};
use crate::metrics;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Ok,
    Mismatch,
    Error,
}

impl std::fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Mismatch => write!(f, "mismatch"),
            Self::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub status: ProbeStatus,
    pub source_count: Option<u64>,
    pub dest_count: Option<u64>,
    pub source_root: Option<String>,
    pub dest_root: Option<String>,
    pub detail: Option<String>,
}

/// Compare count and root only. A missing fingerprint on either side is an
/// `Error`, not a mismatch.
pub fn probe(source: Option<&Fingerprint>, dest: Option<&Fingerprint>) -> ProbeResult {
    let mut result = ProbeResult {
        status: ProbeStatus::Error,
        source_count: source.map(|f| f.record_count),
        dest_count: dest.map(|f| f.record_count),
        source_root: source.map(Fingerprint::root_hex),
        dest_root: dest.map(Fingerprint::root_hex),
        detail: None,
    };
    match (source, dest) {
        (Some(s), Some(d)) => {
            if s.record_count == d.record_count && s.merkle_root == d.merkle_root {
                result.status = ProbeStatus::Ok;
            } else {
                result.status = ProbeStatus::Mismatch;
                result.detail = Some(if s.record_count != d.record_count {
                    format!("record count {} != {}", s.record_count, d.record_count)
                } else {
                    "merkle root differs".to_string()
                });
            }
        }
        (None, _) => result.detail = Some("source fingerprint unavailable".to_string()),
        (_, None) => result.detail = Some("destination fingerprint unavailable".to_string()),
    }
    metrics::record_probe(result.status);
    result
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub nodes_compared: usize,
    pub subtrees_skipped: usize,
    pub leaves_merged: usize,
}

/// Key-level differences between A (source) and B (destination).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDiff {
    /// Only in A.
    pub missing: Vec<String>,
    /// Only in B.
    pub extra: Vec<String>,
    /// In both, different checksum.
    pub mismatched: Vec<String>,
    pub stats: DiffStats,
}

impl KeyDiff {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty() && self.mismatched.is_empty()
    }

    pub fn total(&self) -> usize {
        self.missing.len() + self.extra.len() + self.mismatched.len()
    }
}

pub fn diff(a: &MerkleTree, b: &MerkleTree) -> KeyDiff {
    let mut out = KeyDiff::default();
    out.stats.nodes_compared = 1;
    if a.root() == b.root() {
        out.stats.subtrees_skipped = 1;
        return out;
    }
    if a.len() == b.len() && !a.is_empty() {
        let top = a.height() - 1;
        walk(a, b, top, 0, &mut out);
    } else {
        merge_into(a.leaves(), b.leaves(), &mut out);
    }
    metrics::record_diff(out.missing.len(), out.extra.len(), out.mismatched.len());
    out
}

/// Key-indexed merge comparison over two sorted leaf sets.
pub fn diff_leaves(a: &[Leaf], b: &[Leaf]) -> KeyDiff {
    let mut out = KeyDiff::default();
    merge_into(a, b, &mut out);
    out
}

fn walk(a: &MerkleTree, b: &MerkleTree, level: usize, index: usize, out: &mut KeyDiff) {
    out.stats.nodes_compared += 1;
    if a.node(level, index) == b.node(level, index) {
        out.stats.subtrees_skipped += 1;
        return;
    }
    let range = a.leaf_range(level, index);
    if level == 0 {
        merge_into(&a.leaves()[range.clone()], &b.leaves()[range], out);
        return;
    }

    let left = 2 * index;
    let right = left + 1;
    if right >= a.level_width(level - 1) {
        // carried node, same hash as its only child
        walk(a, b, level - 1, left, out);
        return;
    }

    let split = a.leaf_range(level - 1, right).start;
    if a.leaves()[split].key == b.leaves()[split].key {
        walk(a, b, level - 1, left, out);
        walk(a, b, level - 1, right, out);
    } else {
        merge_into(&a.leaves()[range.clone()], &b.leaves()[range], out);
    }
}

fn merge_into(a: &[Leaf], b: &[Leaf], out: &mut KeyDiff) {
    out.stats.leaves_merged += a.len() + b.len();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].key.cmp(&b[j].key) {
            Ordering::Less => {
                out.missing.push(a[i].key.clone());
                i += 1;
            }
            Ordering::Greater => {
                out.extra.push(b[j].key.clone());
                j += 1;
            }
            Ordering::Equal => {
                if a[i].checksum != b[j].checksum {
                    out.mismatched.push(a[i].key.clone());
                }
                i += 1;
                j += 1;
            }
        }
    }
    out.missing.extend(a[i..].iter().map(|l| l.key.clone()));
    out.extra.extend(b[j..].iter().map(|l| l.key.clone()));
}
