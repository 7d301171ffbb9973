//! Fingerprint builder.
//!
//! Turns a key-ordered record stream into a [`Fingerprint`] (count, Merkle
//! root, canonical size), an optional [`MerkleTree`] and the stream's
//! [`ParityBlock`]s, all in a single pass.
//!
//! # Ordering
//!
//! Adapters are expected to deliver records sorted by key. While that holds,
//! leaves stream straight into the root accumulator and parity blocks. The
//! first out-of-order key switches the builder to re-sort mode: leaves are
//! buffered and sorted at [`finish`](FingerprintBuilder::finish). The buffer
//! is bounded by `max_resort_records`; crossing it fails the build with
//! `ResourceExceeded`. Leaves seen so far are only kept while the stream is
//! within that bound (or the tree is retained), so a long in-order prefix
//! followed by a late out-of-order key also fails rather than growing.

use crate::codec::{checksum_with_size, Checksum, ExclusionSet};
use crate::config::FingerprintConfig;
use crate::error::{Result, SyncError};
use crate::merkle::{leaf_hash, Hash, Leaf, MerkleTree, RootAccumulator};
use crate::metrics;
use crate::parity::{ParityAccumulator, ParityBlock};
use crate::record::Record;
use chrono::{DateTime, Utc};
use futures::{Stream, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::debug;

/// Summary of one collection snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub record_count: u64,
    #[serde(with = "hex_hash")]
    pub merkle_root: Hash,
    pub total_bytes: u64,
    pub built_at: DateTime<Utc>,
}

impl Fingerprint {
    pub fn root_hex(&self) -> String {
        hex::encode(self.merkle_root)
    }
}

mod hex_hash {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(hash: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(hash))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("merkle root must be 32 bytes"))
    }
}

/// Everything a build produces.
#[derive(Debug, Clone)]
pub struct FingerprintOutput {
    pub fingerprint: Fingerprint,
    /// Present only when `retain_tree` was set.
    pub tree: Option<MerkleTree>,
    pub parity: Vec<ParityBlock>,
}

enum Mode {
    Streaming {
        last_key: Option<String>,
        root: RootAccumulator,
        parity: ParityAccumulator,
        /// Leaves seen so far, while re-sorting is still affordable.
        seen: Option<Vec<Leaf>>,
    },
    Resorting {
        buffer: Vec<Leaf>,
    },
}

/// Incremental builder. Feed records with [`push`](Self::push).
pub struct FingerprintBuilder {
    config: FingerprintConfig,
    excluded: ExclusionSet,
    mode: Mode,
    record_count: u64,
    total_bytes: u64,
}

impl FingerprintBuilder {
    pub fn new(config: FingerprintConfig, excluded: ExclusionSet) -> Self {
        let parity = ParityAccumulator::new(config.parity_block_size);
        Self {
            excluded,
            mode: Mode::Streaming {
                last_key: None,
                root: RootAccumulator::new(),
                parity,
                seen: Some(Vec::new()),
            },
            config,
            record_count: 0,
            total_bytes: 0,
        }
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    pub fn is_resorting(&self) -> bool {
        matches!(self.mode, Mode::Resorting { .. })
    }

    pub fn push(&mut self, record: &Record) -> Result<()> {
        let (checksum, size) = checksum_with_size(record, &self.excluded)?;
        self.push_checksum(&record.key, checksum)?;
        self.total_bytes += size as u64;
        Ok(())
    }

    /// Feed a precomputed checksum.
    pub fn push_checksum(&mut self, key: &str, checksum: Checksum) -> Result<()> {
        let limit = self.config.max_resort_records;
        let retain = self.config.retain_tree;

        match &mut self.mode {
            Mode::Streaming {
                last_key,
                root,
                parity,
                seen,
            } => {
                let in_order = last_key.as_deref().map_or(true, |last| key > last);
                if in_order {
                    root.push(leaf_hash(key, &checksum));
                    parity.push(key, &checksum);
                    *last_key = Some(key.to_string());
                    if let Some(buf) = seen.as_mut() {
                        buf.push(Leaf::new(key, checksum));
                        if !retain && buf.len() > limit {
                            *seen = None;
                        }
                    }
                } else if last_key.as_deref() == Some(key) {
                    return Err(SyncError::DuplicateKey(key.to_string()));
                } else {
                    let Some(mut buffer) = seen.take() else {
                        return Err(SyncError::ResourceExceeded {
                            resource: "fingerprint re-sort buffer".to_string(),
                            limit,
                        });
                    };
                    debug!(key, buffered = buffer.len(), "Out-of-order key, switching to re-sort");
                    buffer.push(Leaf::new(key, checksum));
                    if buffer.len() > limit {
                        return Err(SyncError::ResourceExceeded {
                            resource: "fingerprint re-sort buffer".to_string(),
                            limit,
                        });
                    }
                    self.mode = Mode::Resorting { buffer };
                }
            }
            Mode::Resorting { buffer } => {
                buffer.push(Leaf::new(key, checksum));
                if buffer.len() > limit {
                    return Err(SyncError::ResourceExceeded {
                        resource: "fingerprint re-sort buffer".to_string(),
                        limit,
                    });
                }
            }
        }
        self.record_count += 1;
        Ok(())
    }

    pub fn finish(self) -> Result<FingerprintOutput> {
        let (root, tree, parity) = match self.mode {
            Mode::Streaming {
                root, parity, seen, ..
            } => {
                let tree = match (self.config.retain_tree, seen) {
                    (true, Some(leaves)) => Some(MerkleTree::from_sorted_unchecked(leaves)),
                    _ => None,
                };
                (root.root(), tree, parity.finish())
            }
            Mode::Resorting { mut buffer } => {
                buffer.sort_by(|a, b| a.key.cmp(&b.key));
                if let Some(w) = buffer.windows(2).find(|w| w[0].key == w[1].key) {
                    return Err(SyncError::DuplicateKey(w[0].key.clone()));
                }
                let mut parity = ParityAccumulator::new(self.config.parity_block_size);
                let mut acc = RootAccumulator::new();
                for leaf in &buffer {
                    parity.push(&leaf.key, &leaf.checksum);
                    acc.push(leaf_hash(&leaf.key, &leaf.checksum));
                }
                let tree = self
                    .config
                    .retain_tree
                    .then(|| MerkleTree::from_sorted_unchecked(buffer));
                (acc.root(), tree, parity.finish())
            }
        };

        Ok(FingerprintOutput {
            fingerprint: Fingerprint {
                record_count: self.record_count,
                merkle_root: root,
                total_bytes: self.total_bytes,
                built_at: Utc::now(),
            },
            tree,
            parity,
        })
    }
}

/// Consume a record stream and fingerprint it.
pub async fn build<S>(
    stream: S,
    config: FingerprintConfig,
    excluded: ExclusionSet,
) -> Result<FingerprintOutput>
where
    S: Stream<Item = Result<Record>>,
{
    let start = Instant::now();
    let mut builder = FingerprintBuilder::new(config, excluded);
    futures::pin_mut!(stream);
    while let Some(record) = stream.try_next().await? {
        builder.push(&record)?;
    }
    let output = builder.finish()?;
    metrics::record_fingerprint_build(output.fingerprint.record_count, start.elapsed());
    debug!(
        records = output.fingerprint.record_count,
        root = %output.fingerprint.root_hex(),
        "Fingerprint built"
    );
    Ok(output)
}

/// Fingerprint an in-memory slice.
pub fn build_from_records(
    records: &[Record],
    config: FingerprintConfig,
    excluded: ExclusionSet,
) -> Result<FingerprintOutput> {
    let mut builder = FingerprintBuilder::new(config, excluded);
    for record in records {
        builder.push(record)?;
    }
    builder.finish()
}
