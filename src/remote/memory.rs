//! In-memory remote repository with failure injection.

use crate::error::{Result, ZpbsError};
use crate::remote::{BackupGroup, RemoteRepository, namespace_levels};
use chrono::{DateTime, Utc};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

const TARGET: &str = "memory";

#[derive(Debug, Default)]
pub struct MemoryRepository {
    /// (namespace, backup-id) -> snapshot times
    groups: RefCell<BTreeMap<(String, String), Vec<DateTime<Utc>>>>,
    namespaces: RefCell<BTreeSet<String>>,
    unreachable: Cell<bool>,
    failing_backups: RefCell<HashSet<String>>,
    failing_listings: RefCell<HashSet<String>>,
    /// (namespace, backup-id, time) -> notes
    notes: RefCell<BTreeMap<(String, String, DateTime<Utc>), String>>,
    clock: Cell<Option<DateTime<Utc>>>,
    mutations: Cell<usize>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a group, creating its namespace levels.
    pub fn with_group(self, namespace: &str, backup_id: &str, snapshots: &[DateTime<Utc>]) -> Self {
        self.namespaces
            .borrow_mut()
            .extend(namespace_levels(namespace));
        self.groups
            .borrow_mut()
            .entry((namespace.to_string(), backup_id.to_string()))
            .or_default()
            .extend_from_slice(snapshots);
        self
    }

    /// Every call fails with a connectivity error.
    pub fn unreachable(self) -> Self {
        self.unreachable.set(true);
        self
    }

    /// Backups of `backup_id` fail.
    pub fn failing_backup(self, backup_id: &str) -> Self {
        self.failing_backups
            .borrow_mut()
            .insert(backup_id.to_string());
        self
    }

    /// Listing `namespace` fails.
    pub fn failing_listing(self, namespace: &str) -> Self {
        self.failing_listings
            .borrow_mut()
            .insert(namespace.to_string());
        self
    }

    /// Timestamp assigned to new backups instead of the wall clock.
    pub fn with_clock(self, now: DateTime<Utc>) -> Self {
        self.clock.set(Some(now));
        self
    }

    pub fn mutation_count(&self) -> usize {
        self.mutations.get()
    }

    pub fn snapshots(&self, namespace: &str, backup_id: &str) -> Vec<DateTime<Utc>> {
        let mut times = self
            .groups
            .borrow()
            .get(&(namespace.to_string(), backup_id.to_string()))
            .cloned()
            .unwrap_or_default();
        times.sort_unstable_by(|a, b| b.cmp(a));
        times
    }

    pub fn notes(&self, namespace: &str, backup_id: &str, time: DateTime<Utc>) -> Option<String> {
        self.notes
            .borrow()
            .get(&(namespace.to_string(), backup_id.to_string(), time))
            .cloned()
    }

    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.namespaces.borrow().contains(namespace)
    }

    fn reachable(&self) -> Result<()> {
        if self.unreachable.get() {
            Err(ZpbsError::connectivity(TARGET, "connection refused"))
        } else {
            Ok(())
        }
    }

    fn mutate(&self) {
        self.mutations.set(self.mutations.get() + 1);
    }
}

impl RemoteRepository for MemoryRepository {
    fn check_connection(&self) -> Result<()> {
        self.reachable()
    }

    fn list_groups(&self, namespace: Option<&str>) -> Result<Vec<BackupGroup>> {
        self.reachable()?;
        let ns = namespace.unwrap_or_default();
        if self.failing_listings.borrow().contains(ns) {
            return Err(ZpbsError::connectivity(
                TARGET,
                format!("listing namespace '{}' failed", ns),
            ));
        }
        Ok(self
            .groups
            .borrow()
            .iter()
            .filter(|((group_ns, _), _)| group_ns == ns)
            .map(|((group_ns, id), times)| BackupGroup::new(group_ns.clone(), id.clone(), times.clone()))
            .collect())
    }

    fn list_namespaces(&self) -> Result<Vec<String>> {
        self.reachable()?;
        Ok(self.namespaces.borrow().iter().cloned().collect())
    }

    fn create_namespace(&self, namespace: &str) -> Result<()> {
        self.reachable()?;
        self.mutate();
        self.namespaces
            .borrow_mut()
            .extend(namespace_levels(namespace));
        Ok(())
    }

    fn create_backup(
        &self,
        namespace: &str,
        backup_id: &str,
        _source: &Path,
    ) -> Result<DateTime<Utc>> {
        self.reachable()?;
        self.mutate();
        if self.failing_backups.borrow().contains(backup_id) {
            return Err(ZpbsError::connectivity(
                TARGET,
                format!("backup of {} interrupted", backup_id),
            ));
        }
        let time = self.clock.get().unwrap_or_else(Utc::now);
        self.groups
            .borrow_mut()
            .entry((namespace.to_string(), backup_id.to_string()))
            .or_default()
            .push(time);
        Ok(time)
    }

    fn set_snapshot_notes(
        &self,
        namespace: &str,
        backup_id: &str,
        time: DateTime<Utc>,
        notes: &str,
    ) -> Result<()> {
        self.reachable()?;
        self.mutate();
        let key = (namespace.to_string(), backup_id.to_string());
        if !self.groups.borrow().get(&key).is_some_and(|t| t.contains(&time)) {
            return Err(ZpbsError::general(format!(
                "snapshot {}/{} not found",
                backup_id,
                time.to_rfc3339()
            )));
        }
        self.notes
            .borrow_mut()
            .insert((key.0, key.1, time), notes.to_string());
        Ok(())
    }

    fn forget_snapshots(
        &self,
        namespace: &str,
        backup_id: &str,
        snapshots: &[DateTime<Utc>],
    ) -> Result<usize> {
        self.reachable()?;
        self.mutate();
        let mut groups = self.groups.borrow_mut();
        let Some(times) = groups.get_mut(&(namespace.to_string(), backup_id.to_string())) else {
            return Ok(0);
        };
        let before = times.len();
        times.retain(|t| !snapshots.contains(t));
        self.notes.borrow_mut().retain(|(ns, id, time), _| {
            !(ns == namespace && id == backup_id && snapshots.contains(time))
        });
        Ok(before - times.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_list_all_groups_spans_namespaces() {
        let repo = MemoryRepository::new()
            .with_group("", "root-group", &[t0()])
            .with_group("pve1/tank", "pve1-tank", &[t0()]);

        let all = repo.list_all_groups().unwrap();
        assert_eq!(all.len(), 2);
        assert!(repo.has_namespace("pve1"));
        assert!(repo.list_groups(Some("missing")).unwrap().is_empty());
    }

    #[test]
    fn test_backup_and_prune() {
        let repo = MemoryRepository::new().with_clock(t0());
        repo.create_namespace("pve1/tank").unwrap();
        let time = repo
            .create_backup("pve1/tank", "pve1-tank", Path::new("/tank"))
            .unwrap();
        assert_eq!(time, t0());

        let repo = repo.with_group("pve1/tank", "pve1-tank", &[t0() - Duration::days(1)]);
        let removed = repo
            .forget_snapshots("pve1/tank", "pve1-tank", &[t0() - Duration::days(1)])
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(repo.snapshots("pve1/tank", "pve1-tank"), vec![t0()]);
        assert_eq!(repo.mutation_count(), 3);

        // Unknown timestamps are ignored
        let removed = repo
            .forget_snapshots("pve1/tank", "pve1-tank", &[t0() - Duration::days(9)])
            .unwrap();
        assert_eq!(removed, 0);
        assert_eq!(repo.snapshots("pve1/tank", "pve1-tank"), vec![t0()]);
    }

    #[test]
    fn test_notes_need_an_existing_snapshot() {
        let repo = MemoryRepository::new().with_group("pve1/tank", "pve1-tank", &[t0()]);
        repo.set_snapshot_notes("pve1/tank", "pve1-tank", t0(), "hello")
            .unwrap();
        assert_eq!(repo.notes("pve1/tank", "pve1-tank", t0()).as_deref(), Some("hello"));

        let missing = t0() - Duration::days(1);
        assert!(repo.set_snapshot_notes("pve1/tank", "pve1-tank", missing, "x").is_err());
    }

    #[test]
    fn test_failure_injection() {
        let repo = MemoryRepository::new()
            .failing_backup("bad")
            .failing_listing("broken");
        assert!(repo.create_backup("", "bad", Path::new("/x")).unwrap_err().is_connectivity());
        assert!(repo.list_groups(Some("broken")).is_err());

        let down = MemoryRepository::new().unreachable();
        assert!(down.check_connection().unwrap_err().is_connectivity());
    }
}
