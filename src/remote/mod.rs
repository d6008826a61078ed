//! Remote backup repository: groups of snapshots addressed by namespace and
//! backup-id.
//!
//! The engine only talks to the [`RemoteRepository`] trait. `pbs` implements
//! it over `proxmox-backup-client`; `memory` is an in-process implementation
//! for embedding and tests.

pub mod memory;
pub mod pbs;

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;

pub use memory::MemoryRepository;
pub use pbs::PbsRepository;

/// Backup type used for every volume backup.
pub const HOST_BACKUP_TYPE: &str = "host";

/// All snapshots sharing one (namespace, type, id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupGroup {
    /// Empty for the root namespace.
    pub namespace: String,
    pub backup_type: String,
    pub backup_id: String,
    /// Snapshot times, newest first.
    pub snapshots: Vec<DateTime<Utc>>,
}

impl BackupGroup {
    pub fn new(
        namespace: impl Into<String>,
        backup_id: impl Into<String>,
        mut snapshots: Vec<DateTime<Utc>>,
    ) -> Self {
        snapshots.sort_unstable_by(|a, b| b.cmp(a));
        Self {
            namespace: namespace.into(),
            backup_type: HOST_BACKUP_TYPE.to_string(),
            backup_id: backup_id.into(),
            snapshots,
        }
    }

    pub fn last_backup(&self) -> Option<DateTime<Utc>> {
        self.snapshots.first().copied()
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }
}

/// Operations the engine needs from the remote repository.
///
/// Every call is blocking and bounded by a caller-configured timeout; an
/// expired deadline surfaces as `ZpbsError::Timeout` for that call only.
pub trait RemoteRepository {
    /// Cheap read used as a precondition by commands that need the remote.
    fn check_connection(&self) -> Result<()>;

    /// Groups in one namespace (`None` = root). A namespace that does not
    /// exist yet lists as empty.
    fn list_groups(&self, namespace: Option<&str>) -> Result<Vec<BackupGroup>>;

    /// Every namespace below the root.
    fn list_namespaces(&self) -> Result<Vec<String>>;

    /// Groups of the root plus every namespace.
    fn list_all_groups(&self) -> Result<Vec<BackupGroup>> {
        let mut groups = self.list_groups(None)?;
        for namespace in self.list_namespaces()? {
            groups.extend(self.list_groups(Some(&namespace))?);
        }
        Ok(groups)
    }

    /// Create `namespace` and each missing parent level.
    fn create_namespace(&self, namespace: &str) -> Result<()>;

    /// Back up `source` into `namespace` as `backup_id`; returns the snapshot
    /// time.
    fn create_backup(
        &self,
        namespace: &str,
        backup_id: &str,
        source: &Path,
    ) -> Result<DateTime<Utc>>;

    /// Attach free-form notes to one snapshot.
    fn set_snapshot_notes(
        &self,
        namespace: &str,
        backup_id: &str,
        time: DateTime<Utc>,
        notes: &str,
    ) -> Result<()>;

    /// Forget exactly the listed snapshots of the group. Snapshots that are
    /// not listed are left alone, including ones created after the caller
    /// last listed the group. Returns the number of snapshots removed.
    fn forget_snapshots(
        &self,
        namespace: &str,
        backup_id: &str,
        snapshots: &[DateTime<Utc>],
    ) -> Result<usize>;
}

/// Prefixes of a namespace path, shortest first: `a`, `a/b`, `a/b/c`.
pub fn namespace_levels(namespace: &str) -> Vec<String> {
    let parts: Vec<&str> = namespace.split('/').filter(|p| !p.is_empty()).collect();
    (1..=parts.len()).map(|n| parts[..n].join("/")).collect()
}
