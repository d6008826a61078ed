//! Property-based tests for zpbs-backup
//!
//! Uses proptest to check the planning invariants over generated volume
//! trees, snapshot sets and remote listings.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;

use zpbs::engine::audit::audit;
use zpbs::engine::retention::plan;
use zpbs::logic::priority::order_jobs;
use zpbs::logic::resolver::{DEFAULT_PRIORITY, resolve};
use zpbs::logic::schedule::{interval_for, is_due};
use zpbs::remote::BackupGroup;
use zpbs::retention::{DEFAULT_RETENTION, RetentionPolicy, RetentionUnit};
use zpbs::types::{PropertyKey, Schedule};
use zpbs::volume::{RawProperty, Volume, VolumeRecord, VolumeTree, auto_namespace};

const HOST: &str = "pve1";

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 3, 0, 0).unwrap()
}

// ============================================================================
// Strategies
// ============================================================================

fn name_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec(prop::sample::select(vec!["a", "b", "c"]), 0..=3).prop_map(|parts| {
        let mut name = "tank".to_string();
        for part in parts {
            name.push('/');
            name.push_str(part);
        }
        name
    })
}

fn record_strategy() -> impl Strategy<Value = VolumeRecord> {
    (
        name_strategy(),
        prop::option::of(prop::sample::select(vec!["true", "false", "yes"])),
        prop::option::of(prop::sample::select(vec!["daily", "weekly", "monthly", "hourly"])),
        prop::option::of(prop::sample::select(vec!["7d,4w", "1y", "3d,2m", "bogus"])),
        prop::option::of(prop::sample::select(vec!["custom/ns", "bad ns!"])),
        prop::option::of(0u8..=120),
    )
        .prop_map(|(name, backup, schedule, retention, namespace, priority)| {
            let mut record = VolumeRecord::new(Volume::new(name).with_mountpoint("/mnt"));
            let priority = priority.map(|p| p.to_string());
            let values = [
                (PropertyKey::Backup, backup),
                (PropertyKey::Schedule, schedule),
                (PropertyKey::Retention, retention),
                (PropertyKey::Namespace, namespace),
                (PropertyKey::Priority, priority.as_deref()),
            ];
            for (key, value) in values {
                if let Some(value) = value {
                    record.properties.insert(key, RawProperty::local(value));
                }
            }
            record
        })
}

fn tree_strategy() -> impl Strategy<Value = VolumeTree> {
    prop::collection::vec(record_strategy(), 1..12).prop_map(VolumeTree::from_records)
}

fn policy_strategy() -> impl Strategy<Value = RetentionPolicy> {
    (
        prop::option::of(0u32..10),
        prop::option::of(0u32..6),
        prop::option::of(0u32..6),
        prop::option::of(0u32..3),
    )
        .prop_map(|(daily, weekly, monthly, yearly)| RetentionPolicy {
            daily,
            weekly,
            monthly,
            yearly,
        })
}

fn timestamps_strategy() -> impl Strategy<Value = Vec<DateTime<Utc>>> {
    prop::collection::vec(0i64..3 * 365 * 86_400, 0..40)
        .prop_map(|ages| ages.into_iter().map(|age| now() - Duration::seconds(age)).collect())
}

fn schedule_strategy() -> impl Strategy<Value = Schedule> {
    prop::sample::select(vec![Schedule::Daily, Schedule::Weekly, Schedule::Monthly])
}

// ============================================================================
// Resolver
// ============================================================================

proptest! {
    #[test]
    fn resolution_is_deterministic(tree in tree_strategy()) {
        prop_assert_eq!(resolve(&tree, HOST), resolve(&tree, HOST));
    }

    #[test]
    fn resolution_preserves_tree_order(tree in tree_strategy()) {
        let resolution = resolve(&tree, HOST);
        let names: Vec<&str> = resolution.volumes.iter().map(|v| v.name()).collect();
        let expected: Vec<&str> = tree.nodes().iter().map(|n| n.record.volume.name.as_str()).collect();
        prop_assert_eq!(names, expected);
    }

    #[test]
    fn unset_keys_inherit_from_parent(tree in tree_strategy()) {
        let resolution = resolve(&tree, HOST);

        for (idx, node) in tree.nodes().iter().enumerate() {
            let volume = &resolution.volumes[idx];
            let parent = node.parent.map(|p| &resolution.volumes[p].properties);

            if !volume.explicit.contains(&PropertyKey::Backup) {
                prop_assert_eq!(volume.properties.backup_enabled, parent.is_some_and(|p| p.backup_enabled));
            }
            if !volume.explicit.contains(&PropertyKey::Schedule) {
                prop_assert_eq!(volume.properties.schedule, parent.map_or(Schedule::default(), |p| p.schedule));
            }
            if !volume.explicit.contains(&PropertyKey::Retention) {
                prop_assert_eq!(volume.properties.retention, parent.map_or(DEFAULT_RETENTION, |p| p.retention));
            }
            if !volume.explicit.contains(&PropertyKey::Priority) {
                prop_assert_eq!(volume.properties.priority, parent.map_or(DEFAULT_PRIORITY, |p| p.priority));
            }
        }
    }

    #[test]
    fn namespace_defaults_when_no_ancestor_sets_one(tree in tree_strategy()) {
        let resolution = resolve(&tree, HOST);

        for (idx, volume) in resolution.volumes.iter().enumerate() {
            let chain_sets_namespace = std::iter::successors(Some(idx), |&i| tree.nodes()[i].parent)
                .any(|i| resolution.volumes[i].explicit.contains(&PropertyKey::Namespace));
            if !chain_sets_namespace {
                prop_assert_eq!(&volume.properties.namespace, &auto_namespace(HOST, volume.name()));
            }
        }
    }

    #[test]
    fn invalid_values_are_never_explicit(tree in tree_strategy()) {
        let resolution = resolve(&tree, HOST);
        for warning in &resolution.warnings {
            let volume = resolution.get(&warning.volume).unwrap();
            prop_assert!(!volume.explicit.contains(&warning.key));
        }
    }
}

// ============================================================================
// Schedule
// ============================================================================

proptest! {
    #[test]
    fn due_matches_interval_definition(
        schedule in schedule_strategy(),
        age in prop::option::of(-1_000i64..40 * 86_400),
        force in any::<bool>(),
    ) {
        let last = age.map(|secs| now() - Duration::seconds(secs));
        let expected = force
            || last.is_none_or(|l| now() - l >= interval_for(schedule));
        prop_assert_eq!(is_due(schedule, last, now(), force), expected);
    }

    #[test]
    fn due_is_monotonic_in_time(
        schedule in schedule_strategy(),
        age in 0i64..40 * 86_400,
        later in 0i64..40 * 86_400,
    ) {
        let last = Some(now() - Duration::seconds(age));
        if is_due(schedule, last, now(), false) {
            prop_assert!(is_due(schedule, last, now() + Duration::seconds(later), false));
        }
    }
}

// ============================================================================
// Retention
// ============================================================================

proptest! {
    #[test]
    fn retention_partitions_the_input(policy in policy_strategy(), times in timestamps_strategy()) {
        let decision = plan(&policy, &times, now());

        let keep: BTreeSet<_> = decision.keep_times().into_iter().collect();
        let prune: BTreeSet<_> = decision.prune.iter().copied().collect();
        let input: BTreeSet<_> = times.iter().copied().collect();

        prop_assert!(keep.is_disjoint(&prune));
        prop_assert_eq!(keep.union(&prune).copied().collect::<BTreeSet<_>>(), input);
    }

    #[test]
    fn retention_is_idempotent(policy in policy_strategy(), times in timestamps_strategy()) {
        let first = plan(&policy, &times, now());
        let second = plan(&policy, &first.keep_times(), now());

        prop_assert!(second.prune.is_empty());
        prop_assert_eq!(second.keep_times(), first.keep_times());
    }

    #[test]
    fn retention_never_keeps_more_than_the_policy_allows(
        policy in policy_strategy(),
        times in timestamps_strategy(),
    ) {
        let decision = plan(&policy, &times, now());
        let allowed: u32 = policy.buckets().map(|(_, count)| count).sum();
        prop_assert!(decision.keep.len() as u32 <= allowed);
    }

    #[test]
    fn raising_any_bucket_count_never_keeps_less(
        policy in policy_strategy(),
        times in timestamps_strategy(),
        unit in prop::sample::select(RetentionUnit::ALL.to_vec()),
        extra in 1u32..4,
    ) {
        let larger = policy.with_count(unit, policy.count(unit).unwrap_or(0) + extra);
        let base = plan(&policy, &times, now()).keep.len();
        let more = plan(&larger, &times, now()).keep.len();
        prop_assert!(more >= base, "raising {:?} shrank the keep set: {} -> {}", unit, base, more);
    }
}

// ============================================================================
// Priority ordering
// ============================================================================

proptest! {
    #[test]
    fn jobs_are_sorted_by_priority_then_name(tree in tree_strategy()) {
        let jobs = order_jobs(resolve(&tree, HOST).volumes);
        for pair in jobs.windows(2) {
            let a = (pair[0].properties.priority, pair[0].name());
            let b = (pair[1].properties.priority, pair[1].name());
            prop_assert!(a <= b);
        }
    }

    #[test]
    fn job_order_ignores_input_order(tree in tree_strategy()) {
        let volumes = resolve(&tree, HOST).volumes;
        let mut reversed = volumes.clone();
        reversed.reverse();

        let forward: Vec<String> = order_jobs(volumes).iter().map(|v| v.name().to_string()).collect();
        let backward: Vec<String> = order_jobs(reversed).iter().map(|v| v.name().to_string()).collect();
        prop_assert_eq!(forward, backward);
    }
}

// ============================================================================
// Audit
// ============================================================================

fn groups_strategy() -> impl Strategy<Value = Vec<(String, String)>> {
    let id = prop::sample::select(vec![
        "pve1-tank",
        "pve1-tank-a",
        "pve1-tank-b-c",
        "pve1-old",
        "other-tank",
    ]);
    let ns = prop::sample::select(vec!["", "pve1/tank", "elsewhere"]);
    prop::collection::vec((ns, id), 0..8).prop_map(|pairs| {
        pairs
            .into_iter()
            .map(|(ns, id)| (ns.to_string(), id.to_string()))
            .collect()
    })
}

proptest! {
    #[test]
    fn audit_classifies_everything_once(tree in tree_strategy(), listed in groups_strategy()) {
        let volumes = resolve(&tree, HOST).volumes;
        let groups: Vec<BackupGroup> = listed
            .iter()
            .map(|(ns, id)| BackupGroup::new(ns.clone(), id.clone(), vec![now()]))
            .collect();
        let report = audit(&volumes, &groups);

        let enabled: BTreeSet<&str> = volumes
            .iter()
            .filter(|v| v.properties.backup_enabled)
            .map(|v| v.backup_id.as_str())
            .collect();
        let enabled_count = volumes.iter().filter(|v| v.properties.backup_enabled).count();

        prop_assert_eq!(report.matched_groups.len() + report.orphaned.len(), groups.len());
        for group in &report.matched_groups {
            prop_assert!(enabled.contains(group.backup_id.as_str()));
        }
        for group in &report.orphaned {
            prop_assert!(!enabled.contains(group.backup_id.as_str()));
        }

        prop_assert_eq!(report.matched_volumes.len() + report.never_backed_up.len(), enabled_count);
        for missing in &report.never_backed_up {
            prop_assert!(!report.matched_volumes.contains(&missing.volume));
        }
    }
}
