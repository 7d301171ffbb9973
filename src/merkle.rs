//! Key-ordered Merkle tree over `(key, checksum)` leaves.
//!
//! # Hashing
//!
//! ```text
//! leaf     = SHA256(0x00 || u64_be(len(key)) || key || checksum)
//! internal = SHA256(0x01 || left || right)
//! empty    = SHA256("")
//! ```
//!
//! Levels are built pairwise left to right. An odd trailing node is carried
//! up to the next level unchanged, never duplicated. Because of that, node
//! `i` at level `l` always covers leaves `[i * 2^l, (i + 1) * 2^l)` clipped
//! to the leaf count, which is what lets the diff engine align subtrees.
//!
//! [`RootAccumulator`] computes the same root in O(log N) memory for callers
//! that only need the root.

use crate::codec::Checksum;
use crate::error::{Result, SyncError};
use sha2::{Digest, Sha256};

pub type Hash = [u8; 32];

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

pub fn leaf_hash(key: &str, checksum: &Checksum) -> Hash {
    let mut h = Sha256::new();
    h.update([LEAF_PREFIX]);
    h.update((key.len() as u64).to_be_bytes());
    h.update(key.as_bytes());
    h.update(checksum.as_bytes());
    h.finalize().into()
}

pub fn node_hash(left: &Hash, right: &Hash) -> Hash {
    let mut h = Sha256::new();
    h.update([NODE_PREFIX]);
    h.update(left);
    h.update(right);
    h.finalize().into()
}

pub fn empty_root() -> Hash {
    Sha256::digest(b"").into()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leaf {
    pub key: String,
    pub checksum: Checksum,
}

impl Leaf {
    pub fn new(key: impl Into<String>, checksum: Checksum) -> Self {
        Self {
            key: key.into(),
            checksum,
        }
    }
}

/// Fully materialized tree, kept for drill-down diffs.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    leaves: Vec<Leaf>,
    /// `levels[0]` holds leaf hashes, the last level holds the root.
    levels: Vec<Vec<Hash>>,
}

impl MerkleTree {
    /// Build from leaves. Leaves are sorted by key; duplicate keys are rejected.
    pub fn from_leaves(mut leaves: Vec<Leaf>) -> Result<Self> {
        if !leaves.windows(2).all(|w| w[0].key < w[1].key) {
            leaves.sort_by(|a, b| a.key.cmp(&b.key));
            if let Some(w) = leaves.windows(2).find(|w| w[0].key == w[1].key) {
                return Err(SyncError::DuplicateKey(w[0].key.clone()));
            }
        }
        Ok(Self::from_sorted_unchecked(leaves))
    }

    /// Caller guarantees strictly ascending keys.
    pub(crate) fn from_sorted_unchecked(leaves: Vec<Leaf>) -> Self {
        let mut levels = Vec::new();
        if !leaves.is_empty() {
            let mut current: Vec<Hash> = leaves.iter().map(|l| leaf_hash(&l.key, &l.checksum)).collect();
            while current.len() > 1 {
                let next: Vec<Hash> = current
                    .chunks(2)
                    .map(|pair| match pair {
                        [l, r] => node_hash(l, r),
                        _ => pair[0],
                    })
                    .collect();
                levels.push(current);
                current = next;
            }
            levels.push(current);
        }
        Self { leaves, levels }
    }

    pub fn root(&self) -> Hash {
        self.levels
            .last()
            .and_then(|top| top.first().copied())
            .unwrap_or_else(empty_root)
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn leaves(&self) -> &[Leaf] {
        &self.leaves
    }

    /// Number of levels, 0 for an empty tree.
    pub fn height(&self) -> usize {
        self.levels.len()
    }

    pub fn node(&self, level: usize, index: usize) -> Option<&Hash> {
        self.levels.get(level)?.get(index)
    }

    pub fn level_width(&self, level: usize) -> usize {
        self.levels.get(level).map_or(0, Vec::len)
    }

    /// Leaf index range covered by a node.
    pub fn leaf_range(&self, level: usize, index: usize) -> std::ops::Range<usize> {
        let span = 1usize << level;
        let start = (index * span).min(self.leaves.len());
        let end = ((index + 1) * span).min(self.leaves.len());
        start..end
    }
}

/// Streaming root computation in O(log N) space.
///
/// Slot `h` holds the root of a complete subtree of `2^h` leaves. Merging
/// the slots from lowest to highest at the end reproduces the carry-up rule
/// of [`MerkleTree`].
#[derive(Debug, Default, Clone)]
pub struct RootAccumulator {
    slots: Vec<Option<Hash>>,
    count: u64,
}

impl RootAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, leaf: Hash) {
        self.count += 1;
        let mut carry = leaf;
        for slot in self.slots.iter_mut() {
            match slot.take() {
                Some(left) => carry = node_hash(&left, &carry),
                None => {
                    *slot = Some(carry);
                    return;
                }
            }
        }
        self.slots.push(Some(carry));
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn root(&self) -> Hash {
        let mut acc: Option<Hash> = None;
        for slot in self.slots.iter().flatten() {
            acc = Some(match acc {
                None => *slot,
                Some(right) => node_hash(slot, &right),
            });
        }
        acc.unwrap_or_else(empty_root)
    }
}
