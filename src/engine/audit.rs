//! Audit Engine
//!
//! Compares what should be backed up (backup-enabled volumes) with what the
//! remote repository holds.
//!
//! # Classification
//!
//! | Side   | Matched when                                   | Otherwise         |
//! |--------|------------------------------------------------|-------------------|
//! | Volume | some remote group carries its derived backup-id | `never_backed_up` |
//! | Group  | its backup-id is derived by an enabled volume   | `orphaned`        |
//!
//! Matching is exact string equality on the backup-id across all
//! namespaces, using the same derivation as backup creation. Disabled
//! volumes never match, so their leftover groups show up as orphaned.

use crate::logic::resolver::ResolvedVolume;
use crate::remote::BackupGroup;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

/// A remote group as reported in the audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupSummary {
    pub namespace: String,
    pub backup_type: String,
    pub backup_id: String,
    pub snapshot_count: usize,
    pub last_backup: Option<DateTime<Utc>>,
}

impl From<&BackupGroup> for GroupSummary {
    fn from(group: &BackupGroup) -> Self {
        Self {
            namespace: group.namespace.clone(),
            backup_type: group.backup_type.clone(),
            backup_id: group.backup_id.clone(),
            snapshot_count: group.snapshot_count(),
            last_backup: group.last_backup(),
        }
    }
}

impl GroupSummary {
    /// `host/pve1-tank (ns: pve1/tank)` style label.
    pub fn label(&self) -> String {
        if self.namespace.is_empty() {
            format!("{}/{}", self.backup_type, self.backup_id)
        } else {
            format!("{}/{} (ns: {})", self.backup_type, self.backup_id, self.namespace)
        }
    }
}

/// An enabled volume with no group in the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingBackup {
    pub volume: String,
    pub backup_id: String,
    pub namespace: String,
}

/// Two or more enabled volumes deriving the same backup-id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdCollision {
    pub backup_id: String,
    pub volumes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    /// Enabled volumes with at least one matching group.
    pub matched_volumes: Vec<String>,
    pub never_backed_up: Vec<MissingBackup>,
    /// Groups owned by an enabled volume.
    pub matched_groups: Vec<GroupSummary>,
    pub orphaned: Vec<GroupSummary>,
    pub collisions: Vec<IdCollision>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.never_backed_up.is_empty() && self.orphaned.is_empty() && self.collisions.is_empty()
    }
}

/// Classify every enabled volume and every remote group.
pub fn audit(volumes: &[ResolvedVolume], groups: &[BackupGroup]) -> AuditReport {
    let mut report = AuditReport::default();

    let mut owners: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for volume in volumes.iter().filter(|v| v.properties.backup_enabled) {
        owners
            .entry(volume.backup_id.as_str())
            .or_default()
            .push(volume.name());
    }

    let remote_ids: HashSet<&str> = groups.iter().map(|g| g.backup_id.as_str()).collect();

    for volume in volumes.iter().filter(|v| v.properties.backup_enabled) {
        if remote_ids.contains(volume.backup_id.as_str()) {
            report.matched_volumes.push(volume.name().to_string());
        } else {
            report.never_backed_up.push(MissingBackup {
                volume: volume.name().to_string(),
                backup_id: volume.backup_id.clone(),
                namespace: volume.properties.namespace.clone(),
            });
        }
    }

    for group in groups {
        if owners.contains_key(group.backup_id.as_str()) {
            report.matched_groups.push(group.into());
        } else {
            report.orphaned.push(group.into());
        }
    }

    report.collisions = owners
        .into_iter()
        .filter(|(_, vols)| vols.len() > 1)
        .map(|(id, vols)| IdCollision {
            backup_id: id.to_string(),
            volumes: vols.into_iter().map(str::to_string).collect(),
        })
        .collect();

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::resolver::resolve;
    use crate::types::PropertyKey;
    use crate::volume::{RawProperty, Volume, VolumeRecord, VolumeTree};
    use chrono::TimeZone;

    fn resolved(enabled: &[&str], disabled: &[&str]) -> Vec<ResolvedVolume> {
        let mut records = Vec::new();
        for (names, value) in [(enabled, "true"), (disabled, "false")] {
            for name in names {
                let mut rec = VolumeRecord::new(Volume::new(*name));
                rec.properties
                    .insert(PropertyKey::Backup, RawProperty::local(value));
                records.push(rec);
            }
        }
        resolve(&VolumeTree::from_records(records), "host").volumes
    }

    fn group(ns: &str, id: &str) -> BackupGroup {
        let t = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();
        BackupGroup::new(ns, id, vec![t])
    }

    #[test]
    fn test_orphan_for_vanished_volume() {
        let volumes = resolved(&["tank", "tank/data"], &[]);
        let groups = vec![
            group("host/tank", "host-tank"),
            group("host/tank/old", "host-tank-old"),
        ];
        let report = audit(&volumes, &groups);

        assert_eq!(report.orphaned.len(), 1);
        assert_eq!(report.orphaned[0].backup_id, "host-tank-old");
        assert_eq!(report.orphaned[0].label(), "host/host-tank-old (ns: host/tank/old)");
        assert_eq!(report.matched_volumes, vec!["tank"]);
        assert_eq!(report.never_backed_up.len(), 1);
        assert_eq!(report.never_backed_up[0].volume, "tank/data");
        assert_eq!(report.never_backed_up[0].namespace, "host/tank/data");
    }

    #[test]
    fn test_disabled_volume_group_is_orphaned() {
        let volumes = resolved(&["tank"], &["tank/scratch"]);
        let groups = vec![group("", "host-tank-scratch")];
        let report = audit(&volumes, &groups);

        assert_eq!(report.orphaned.len(), 1);
        assert_eq!(report.never_backed_up.len(), 1);
        assert!(!report.is_clean());
    }

    #[test]
    fn test_match_ignores_namespace() {
        let volumes = resolved(&["tank"], &[]);
        let report = audit(&volumes, &[group("moved/elsewhere", "host-tank")]);
        assert!(report.orphaned.is_empty());
        assert_eq!(report.matched_groups.len(), 1);
        assert!(report.is_clean());
    }

    #[test]
    fn test_backup_id_collision_reported() {
        let volumes = resolved(&["tank", "tank/a-b", "tank/a", "tank/a/b"], &[]);
        let report = audit(&volumes, &[]);
        assert_eq!(report.collisions.len(), 1);
        assert_eq!(report.collisions[0].backup_id, "host-tank-a-b");
        assert_eq!(report.collisions[0].volumes.len(), 2);
    }
}
