//! Sync planner: turns both sides of a collection into write plans.
//!
//! Planning is pure. Each [`SyncMode`] maps to one planning function through
//! [`PLANNERS`]; the executor never branches on mode.
//!
//! | mode | destination upserts | destination deletes |
//! |---|---|---|
//! | full_sync | checksum differs or key absent | dest-only keys if `delete_orphans` |
//! | incremental | timestamp newer than the watermark (checksum if no timestamp) | dest-only keys if `delete_orphans` |
//! | append_only | key absent | never |
//! | master_slave | as full_sync | dest-only keys, always |
//! | bidirectional | changes since the watermark, both directions | orphan policy on both sides |
//!
//! Both inputs are expected to be already transformed by the profile.

use crate::adapter::RecordFailure;
use crate::codec::{checksum, Checksum, ExclusionSet};
use crate::conflict::{resolve, DeferredConflict, Resolution, SyncTimestamp};
use crate::profile::{SyncMode, SyncProfile};
use crate::record::{Record, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WritePlan {
    /// Sorted by key.
    pub upserts: Vec<Record>,
    /// Sorted.
    pub deletes: Vec<String>,
}

impl WritePlan {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.upserts.len() + self.deletes.len()
    }

    fn sort(&mut self) {
        self.upserts.sort_by(|a, b| a.key.cmp(&b.key));
        self.deletes.sort();
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncPlan {
    pub mode: SyncMode,
    /// Writes against the destination.
    pub destination: WritePlan,
    /// Writes back to the source (bidirectional only).
    pub source: WritePlan,
    pub records_read: usize,
    pub skipped: usize,
    pub conflicts_detected: usize,
    /// Pairs left for the conflict queue.
    pub deferred: Vec<DeferredConflict>,
    /// Records that could not be hashed.
    pub failures: Vec<RecordFailure>,
    /// Highest timestamp seen, stored with the final checkpoint.
    pub high_watermark: Option<Value>,
}

/// Everything a planning function looks at.
pub struct PlanInput<'a> {
    pub source: &'a [Record],
    pub dest: &'a [Record],
    pub profile: &'a SyncProfile,
    pub excluded: &'a ExclusionSet,
    /// `last_timestamp` of the previous completed run.
    pub watermark: Option<&'a Value>,
}

pub type PlanFn = fn(&PlanInput<'_>) -> SyncPlan;

/// Indexed by `SyncMode as usize`.
pub const PLANNERS: [(SyncMode, PlanFn); 5] = [
    (SyncMode::FullSync, plan_full_sync),
    (SyncMode::Incremental, plan_incremental),
    (SyncMode::AppendOnly, plan_append_only),
    (SyncMode::MasterSlave, plan_master_slave),
    (SyncMode::Bidirectional, plan_bidirectional),
];

pub fn planner_for(mode: SyncMode) -> PlanFn {
    PLANNERS[mode as usize].1
}

pub fn plan(mode: SyncMode, input: &PlanInput<'_>) -> SyncPlan {
    let mut plan = planner_for(mode)(input);
    plan.mode = mode;
    plan.destination.sort();
    plan.source.sort();
    plan
}

// =============================================================================
// Shared helpers
// =============================================================================

struct Entry<'a> {
    record: &'a Record,
    checksum: Checksum,
}

type Index<'a> = BTreeMap<&'a str, Entry<'a>>;

fn index<'a>(records: &'a [Record], excluded: &ExclusionSet, failures: &mut Vec<RecordFailure>) -> Index<'a> {
    let mut out = BTreeMap::new();
    for record in records {
        match checksum(record, excluded) {
            Ok(checksum) => {
                out.insert(record.key.as_str(), Entry { record, checksum });
            }
            Err(e) => failures.push(RecordFailure::new(&record.key, e.to_string())),
        }
    }
    out
}

fn timestamp(record: &Record, input: &PlanInput<'_>) -> Option<SyncTimestamp> {
    input
        .profile
        .timestamp_field()
        .and_then(|f| SyncTimestamp::of(record, f))
}

/// `Some(true)` newer than the watermark, `Some(false)` not newer, `None`
/// when there is nothing to compare.
fn changed_since(record: &Record, input: &PlanInput<'_>) -> Option<bool> {
    let watermark = SyncTimestamp::from_value(input.watermark?)?;
    let ts = timestamp(record, input)?;
    Some(!matches!(
        ts.partial_cmp(&watermark),
        Some(Ordering::Less | Ordering::Equal)
    ))
}

fn high_watermark<'a>(records: impl Iterator<Item = &'a Record>, input: &PlanInput<'_>) -> Option<Value> {
    let field = input.profile.timestamp_field()?;
    let mut best: Option<(SyncTimestamp, Value)> = input
        .watermark
        .and_then(|v| SyncTimestamp::from_value(v).map(|t| (t, v.clone())));
    for record in records {
        let Some(value) = record.get(field) else { continue };
        let Some(ts) = SyncTimestamp::from_value(value) else { continue };
        let newer = match &best {
            None => true,
            Some((b, _)) => ts.partial_cmp(b) == Some(Ordering::Greater),
        };
        if newer {
            best = Some((ts, value.clone()));
        }
    }
    best.map(|(_, v)| v)
}

fn new_plan(input: &PlanInput<'_>) -> SyncPlan {
    SyncPlan {
        records_read: input.source.len(),
        ..Default::default()
    }
}

/// Resolve a pair and route the result to whichever sides differ from it.
fn apply_conflict(
    s: &Entry<'_>,
    d: &Entry<'_>,
    input: &PlanInput<'_>,
    plan: &mut SyncPlan,
    write_back: bool,
) {
    plan.conflicts_detected += 1;
    let ts_field = input.profile.timestamp_field().unwrap_or_default();
    match resolve(s.record, d.record, input.profile.conflict_policy, ts_field) {
        Resolution::Resolved(winner) => {
            let winner_sum = checksum(&winner, input.excluded).ok();
            let to_dest = winner_sum != Some(d.checksum);
            let to_source = write_back && winner_sum != Some(s.checksum);
            match (to_dest, to_source) {
                (true, true) => {
                    plan.source.upserts.push(winner.clone());
                    plan.destination.upserts.push(winner);
                }
                (true, false) => plan.destination.upserts.push(winner),
                (false, true) => plan.source.upserts.push(winner),
                (false, false) => plan.skipped += 1,
            }
        }
        Resolution::Deferred => plan.deferred.push(DeferredConflict {
            source: s.record.clone(),
            dest: d.record.clone(),
        }),
    }
}

fn raw_keys(records: &[Record]) -> BTreeSet<&str> {
    records.iter().map(|r| r.key.as_str()).collect()
}

/// Dest-only keys, judged against every source key. A source record that
/// failed to hash still owns its key.
fn dest_orphans(input: &PlanInput<'_>) -> Vec<String> {
    let src_keys = raw_keys(input.source);
    input
        .dest
        .iter()
        .filter(|r| !src_keys.contains(r.key.as_str()))
        .map(|r| r.key.clone())
        .collect()
}

// =============================================================================
// Per-mode planners
// =============================================================================

pub fn plan_full_sync(input: &PlanInput<'_>) -> SyncPlan {
    let mut plan = new_plan(input);
    let src = index(input.source, input.excluded, &mut plan.failures);
    let dst = index(input.dest, input.excluded, &mut plan.failures);

    for (key, s) in &src {
        match dst.get(key) {
            Some(d) if d.checksum == s.checksum => plan.skipped += 1,
            _ => plan.destination.upserts.push(s.record.clone()),
        }
    }
    if input.profile.delete_orphans {
        plan.destination.deletes = dest_orphans(input);
    }
    plan.high_watermark = high_watermark(input.source.iter(), input);
    plan
}

pub fn plan_incremental(input: &PlanInput<'_>) -> SyncPlan {
    let mut plan = new_plan(input);
    let src = index(input.source, input.excluded, &mut plan.failures);
    let dst = index(input.dest, input.excluded, &mut plan.failures);

    for (key, s) in &src {
        let d = dst.get(key);
        match changed_since(s.record, input) {
            Some(false) => plan.skipped += 1,
            Some(true) => match d {
                None => plan.destination.upserts.push(s.record.clone()),
                Some(d) if d.checksum == s.checksum => plan.skipped += 1,
                // destination also moved since the last run
                Some(d) if changed_since(d.record, input) == Some(true) => {
                    apply_conflict(s, d, input, &mut plan, false)
                }
                Some(_) => plan.destination.upserts.push(s.record.clone()),
            },
            None => match d {
                Some(d) if d.checksum == s.checksum => plan.skipped += 1,
                _ => plan.destination.upserts.push(s.record.clone()),
            },
        }
    }
    if input.profile.delete_orphans {
        plan.destination.deletes = dest_orphans(input);
    }
    plan.high_watermark = high_watermark(input.source.iter(), input);
    plan
}

pub fn plan_append_only(input: &PlanInput<'_>) -> SyncPlan {
    let mut plan = new_plan(input);
    let src = index(input.source, input.excluded, &mut plan.failures);
    let dest_keys: BTreeSet<&str> = input.dest.iter().map(|r| r.key.as_str()).collect();

    for (key, s) in &src {
        if dest_keys.contains(key) {
            plan.skipped += 1;
        } else {
            plan.destination.upserts.push(s.record.clone());
        }
    }
    plan.high_watermark = high_watermark(input.source.iter(), input);
    plan
}

pub fn plan_master_slave(input: &PlanInput<'_>) -> SyncPlan {
    let mut plan = new_plan(input);
    let src = index(input.source, input.excluded, &mut plan.failures);
    let dst = index(input.dest, input.excluded, &mut plan.failures);

    for (key, s) in &src {
        match dst.get(key) {
            Some(d) if d.checksum == s.checksum => plan.skipped += 1,
            _ => plan.destination.upserts.push(s.record.clone()),
        }
    }
    // every dest-only key goes, including records that failed to hash
    plan.destination.deletes = dest_orphans(input);
    plan.high_watermark = high_watermark(input.source.iter(), input);
    plan
}

pub fn plan_bidirectional(input: &PlanInput<'_>) -> SyncPlan {
    let mut plan = new_plan(input);
    let src = index(input.source, input.excluded, &mut plan.failures);
    let dst = index(input.dest, input.excluded, &mut plan.failures);
    let (src_keys, dst_keys) = (raw_keys(input.source), raw_keys(input.dest));
    let has_watermark = input.watermark.is_some();
    // unknown counts as changed
    let changed = |r: &Record| changed_since(r, input).unwrap_or(true);

    let keys: BTreeSet<&str> = src.keys().chain(dst.keys()).copied().collect();
    for key in keys {
        match (src.get(key), dst.get(key)) {
            (Some(s), Some(d)) => {
                if s.checksum == d.checksum {
                    plan.skipped += 1;
                    continue;
                }
                match (changed(s.record), changed(d.record)) {
                    (true, false) => plan.destination.upserts.push(s.record.clone()),
                    (false, true) => plan.source.upserts.push(d.record.clone()),
                    _ => apply_conflict(s, d, input, &mut plan, true),
                }
            }
            // the other side holds the key but failed to hash: leave both alone
            (Some(_), None) if dst_keys.contains(key) => {}
            (None, Some(_)) if src_keys.contains(key) => {}
            (Some(s), None) => {
                // untouched since the last run, so the destination deleted it
                if has_watermark && !changed(s.record) && input.profile.delete_orphans {
                    plan.source.deletes.push(key.to_string());
                } else {
                    plan.destination.upserts.push(s.record.clone());
                }
            }
            (None, Some(d)) => {
                if has_watermark && !changed(d.record) && input.profile.delete_orphans {
                    plan.destination.deletes.push(key.to_string());
                } else {
                    plan.source.upserts.push(d.record.clone());
                }
            }
            (None, None) => {}
        }
    }
    plan.high_watermark = high_watermark(input.source.iter().chain(input.dest.iter()), input);
    plan
}
