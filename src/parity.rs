//! Parity blocks: cheap block-level corruption detection.
//!
//! The key-ordered stream is cut into fixed-size blocks and each block gets
//! the XOR of its members' checksums. XOR is order-independent within a
//! block, so two sides with the same records in the same block positions
//! agree block by block, independently of the Merkle structure.

use crate::codec::Checksum;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PARITY_BLOCK_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParityBlock {
    pub index: usize,
    pub first_key: String,
    pub last_key: String,
    pub record_count: usize,
    pub digest: [u8; 32],
}

impl ParityBlock {
    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest)
    }
}

/// Result of comparing two parity block lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ParityStatus {
    Ok,
    Mismatch { blocks: Vec<usize> },
    /// One side has no parity data (e.g. destination unreachable).
    Unavailable,
}

impl ParityStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Block indexes whose digest, bounds or size differ. Blocks present on
/// only one side count as differing.
pub fn compare(a: &[ParityBlock], b: &[ParityBlock]) -> ParityStatus {
    let len = a.len().max(b.len());
    let blocks: Vec<usize> = (0..len)
        .filter(|&i| match (a.get(i), b.get(i)) {
            (Some(x), Some(y)) => x != y,
            _ => true,
        })
        .collect();
    if blocks.is_empty() {
        ParityStatus::Ok
    } else {
        ParityStatus::Mismatch { blocks }
    }
}

/// Builds parity blocks from a key-ordered stream of checksums.
#[derive(Debug)]
pub struct ParityAccumulator {
    block_size: usize,
    current: Option<ParityBlock>,
    blocks: Vec<ParityBlock>,
}

impl ParityAccumulator {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
            current: None,
            blocks: Vec::new(),
        }
    }

    pub fn push(&mut self, key: &str, checksum: &Checksum) {
        let index = self.blocks.len();
        let block = self.current.get_or_insert_with(|| ParityBlock {
            index,
            first_key: key.to_string(),
            last_key: String::new(),
            record_count: 0,
            digest: [0u8; 32],
        });
        for (d, c) in block.digest.iter_mut().zip(checksum.as_bytes()) {
            *d ^= c;
        }
        block.last_key = key.to_string();
        block.record_count += 1;

        if block.record_count == self.block_size {
            if let Some(done) = self.current.take() {
                self.blocks.push(done);
            }
        }
    }

    pub fn finish(mut self) -> Vec<ParityBlock> {
        if let Some(partial) = self.current.take() {
            self.blocks.push(partial);
        }
        self.blocks
    }
}
