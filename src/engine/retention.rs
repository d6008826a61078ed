//! Retention Planner
//!
//! Partitions one backup group's snapshot timestamps into keep and prune.
//!
//! # Algorithm
//!
//! Each bucket divides time into fixed-length slots counted back from `now`
//! (slot `k` of the daily bucket covers ages `[k days, k+1 days)`). Buckets
//! are processed in order daily, weekly, monthly, yearly. For each bucket:
//!
//! 1. Mark the bucket's slots already covered by snapshots kept so far
//! 2. Walk the remaining snapshots newest-first and keep the first snapshot
//!    of every unmarked slot, until the bucket's count is reached
//!
//! A snapshot kept by a more specific bucket is never consumed again by a
//! coarser one, and the slot it sits in counts as covered.
//!
//! # Invariants
//!
//! - The newest snapshot is kept whenever some bucket has count >= 1
//! - Planning the kept set again prunes nothing
//! - Raising any bucket count never shrinks the keep set
//! - Each group is planned independently of every other group

use crate::retention::{RetentionPolicy, RetentionUnit};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

/// A retained snapshot and the bucket that justified keeping it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KeptSnapshot {
    pub time: DateTime<Utc>,
    pub bucket: RetentionUnit,
}

/// Keep/prune partition for one group. Both lists are newest-first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionDecision {
    pub keep: Vec<KeptSnapshot>,
    pub prune: Vec<DateTime<Utc>>,
}

impl RetentionDecision {
    pub fn keep_times(&self) -> Vec<DateTime<Utc>> {
        self.keep.iter().map(|k| k.time).collect()
    }

    pub fn is_noop(&self) -> bool {
        self.prune.is_empty()
    }
}

fn slot_of(unit: RetentionUnit, time: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - time).num_seconds().div_euclid(unit.period_secs())
}

/// Compute the retention decision for `timestamps` under `policy`.
///
/// Duplicate timestamps are collapsed; input order does not matter.
pub fn plan(
    policy: &RetentionPolicy,
    timestamps: &[DateTime<Utc>],
    now: DateTime<Utc>,
) -> RetentionDecision {
    let mut sorted: Vec<DateTime<Utc>> = timestamps.to_vec();
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    sorted.dedup();

    let mut kept: BTreeMap<DateTime<Utc>, RetentionUnit> = BTreeMap::new();

    for (unit, count) in policy.buckets() {
        let mut covered: HashSet<i64> = kept.keys().map(|t| slot_of(unit, *t, now)).collect();
        let mut taken = 0;

        for &time in &sorted {
            if taken >= count {
                break;
            }
            if kept.contains_key(&time) {
                continue;
            }
            if covered.insert(slot_of(unit, time, now)) {
                kept.insert(time, unit);
                taken += 1;
            }
        }
    }

    let keep = kept
        .iter()
        .rev()
        .map(|(time, bucket)| KeptSnapshot {
            time: *time,
            bucket: *bucket,
        })
        .collect();
    let prune = sorted
        .into_iter()
        .filter(|time| !kept.contains_key(time))
        .collect();

    RetentionDecision { keep, prune }
}
