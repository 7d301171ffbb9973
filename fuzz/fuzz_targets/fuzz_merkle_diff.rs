//! Fuzz target for the Merkle drill-down diff.
//!
//! Builds two trees from arbitrary (key, checksum-byte) lists and checks the
//! tree walk against a flat merge of the leaves.

#![no_main]

use collection_sync::codec::Checksum;
use collection_sync::diff::{diff, diff_leaves};
use collection_sync::merkle::{Leaf, MerkleTree};
use libfuzzer_sys::fuzz_target;
use std::collections::BTreeMap;

fn tree(entries: &[(u8, u8)]) -> MerkleTree {
    let unique: BTreeMap<u8, u8> = entries.iter().copied().collect();
    let leaves = unique
        .into_iter()
        .map(|(k, c)| Leaf::new(format!("k{:03}", k), Checksum([c; 32])))
        .collect();
    MerkleTree::from_leaves(leaves).expect("keys are unique")
}

fuzz_target!(|data: (Vec<(u8, u8)>, Vec<(u8, u8)>)| {
    let (a, b) = (tree(&data.0), tree(&data.1));

    let walked = diff(&a, &b);
    let merged = diff_leaves(a.leaves(), b.leaves());

    assert_eq!(walked.missing, merged.missing);
    assert_eq!(walked.extra, merged.extra);
    assert_eq!(walked.mismatched, merged.mismatched);
});
