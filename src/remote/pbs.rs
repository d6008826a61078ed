//! Proxmox Backup Server repository over `proxmox-backup-client`.

use crate::error::{Result, ZpbsError};
use crate::remote::{BackupGroup, HOST_BACKUP_TYPE, RemoteRepository, namespace_levels};
use crate::tool_args::ToolArgs;
use crate::tool_runner::{RunOptions, ToolOutput, run_tool_safe};
use crate::tools::pbs::{
    PBS_CLIENT, PbsBackupArgs, PbsCredentials, PbsForgetArgs, PbsNamespaceCreateArgs,
    PbsNamespaceListArgs, PbsNotesArgs, PbsSnapshotListArgs, PbsStatusArgs,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// One entry of `snapshot list --output-format json`.
#[derive(Debug, Deserialize)]
struct SnapshotEntry {
    #[serde(rename = "backup-type", default = "default_backup_type")]
    backup_type: String,
    #[serde(rename = "backup-id")]
    backup_id: String,
    #[serde(rename = "backup-time")]
    backup_time: i64,
}

fn default_backup_type() -> String {
    HOST_BACKUP_TYPE.to_string()
}

/// One entry of `namespace list --output-format json`.
#[derive(Debug, Deserialize)]
struct NamespaceEntry {
    #[serde(default)]
    ns: String,
}

/// Group snapshot-list JSON into backup groups of `namespace`.
pub fn parse_snapshot_list(json: &str, namespace: &str) -> Result<Vec<BackupGroup>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let entries: Vec<SnapshotEntry> = serde_json::from_str(json)?;

    let mut grouped: BTreeMap<(String, String), Vec<DateTime<Utc>>> = BTreeMap::new();
    for entry in entries {
        let Some(time) = DateTime::from_timestamp(entry.backup_time, 0) else {
            debug!(id = %entry.backup_id, time = entry.backup_time, "skipping snapshot with invalid time");
            continue;
        };
        grouped
            .entry((entry.backup_type, entry.backup_id))
            .or_default()
            .push(time);
    }

    Ok(grouped
        .into_iter()
        .map(|((backup_type, backup_id), snapshots)| {
            let mut group = BackupGroup::new(namespace, backup_id, snapshots);
            group.backup_type = backup_type;
            group
        })
        .collect())
}

pub fn parse_namespace_list(json: &str) -> Result<Vec<String>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let entries: Vec<NamespaceEntry> = serde_json::from_str(json)?;
    Ok(entries
        .into_iter()
        .map(|e| e.ns)
        .filter(|ns| !ns.is_empty())
        .collect())
}

fn stderr_says(output: &ToolOutput, needles: &[&str]) -> bool {
    let stderr = output.stderr.to_ascii_lowercase();
    needles.iter().any(|n| stderr.contains(n))
}

const CONNECTIVITY_HINTS: [&str; 6] = [
    "unable to connect",
    "error trying to connect",
    "connection refused",
    "connection reset",
    "timed out",
    "no route to host",
];

#[derive(Debug, Clone)]
pub struct PbsRepository {
    credentials: PbsCredentials,
    query_timeout: Duration,
    backup_timeout: Duration,
    dry_run: bool,
}

impl PbsRepository {
    pub fn new(credentials: PbsCredentials, query_timeout: Duration, backup_timeout: Duration) -> Self {
        Self {
            credentials,
            query_timeout,
            backup_timeout,
            dry_run: false,
        }
    }

    /// Refuse mutating client calls at the runner level.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    fn options(&self, timeout: Duration) -> RunOptions {
        RunOptions::with_timeout(timeout).dry_run(self.dry_run)
    }

    fn failure(&self, output: &ToolOutput) -> ZpbsError {
        if stderr_says(output, &CONNECTIVITY_HINTS) {
            ZpbsError::connectivity(self.credentials.repository.clone(), output.stderr.trim())
        } else {
            ZpbsError::Command {
                program: PBS_CLIENT.to_string(),
                code: output.exit_code.unwrap_or(-1),
                stderr: output.stderr.trim().to_string(),
            }
        }
    }

    fn query(&self, args: &dyn ToolArgs) -> Result<ToolOutput> {
        let output = run_tool_safe(args, &self.options(self.query_timeout))?;
        if output.success {
            Ok(output)
        } else {
            Err(self.failure(&output))
        }
    }
}

impl RemoteRepository for PbsRepository {
    fn check_connection(&self) -> Result<()> {
        let args = PbsStatusArgs {
            credentials: self.credentials.clone(),
        };
        let output = run_tool_safe(&args, &self.options(self.query_timeout))?;
        if output.success {
            Ok(())
        } else {
            Err(ZpbsError::connectivity(
                self.credentials.repository.clone(),
                output.stderr.trim(),
            ))
        }
    }

    fn list_groups(&self, namespace: Option<&str>) -> Result<Vec<BackupGroup>> {
        let args = PbsSnapshotListArgs {
            credentials: self.credentials.clone(),
            namespace: namespace.map(str::to_string),
        };
        let output = run_tool_safe(&args, &self.options(self.query_timeout))?;
        if !output.success {
            if stderr_says(&output, &["not found", "does not exist"]) {
                debug!(namespace = ?namespace, "namespace does not exist yet");
                return Ok(Vec::new());
            }
            return Err(self.failure(&output));
        }
        parse_snapshot_list(&output.stdout, namespace.unwrap_or_default())
    }

    fn list_namespaces(&self) -> Result<Vec<String>> {
        let output = self.query(&PbsNamespaceListArgs {
            credentials: self.credentials.clone(),
        })?;
        parse_namespace_list(&output.stdout)
    }

    fn create_namespace(&self, namespace: &str) -> Result<()> {
        let levels = namespace_levels(namespace);
        for (idx, level) in levels.iter().enumerate() {
            let args = PbsNamespaceCreateArgs {
                credentials: self.credentials.clone(),
                namespace: level.clone(),
            };
            let output = run_tool_safe(&args, &self.options(self.query_timeout))?;
            if output.success || stderr_says(&output, &["already exists"]) {
                continue;
            }
            if idx + 1 == levels.len() {
                return Err(self.failure(&output));
            }
            debug!(level = %level, stderr = %output.stderr.trim(), "intermediate namespace create failed");
        }
        Ok(())
    }

    fn create_backup(
        &self,
        namespace: &str,
        backup_id: &str,
        source: &Path,
    ) -> Result<DateTime<Utc>> {
        let started = Utc::now();
        let args = PbsBackupArgs {
            credentials: self.credentials.clone(),
            source: source.to_path_buf(),
            backup_id: backup_id.to_string(),
            namespace: Some(namespace.to_string()),
        };
        let output = run_tool_safe(&args, &self.options(self.backup_timeout))?;
        if output.skipped {
            return Ok(started);
        }
        if !output.success {
            return Err(self.failure(&output));
        }

        let newest = self
            .list_groups(Some(namespace))?
            .into_iter()
            .find(|g| g.backup_id == backup_id)
            .and_then(|g| g.last_backup());
        Ok(newest.unwrap_or(started))
    }

    fn set_snapshot_notes(
        &self,
        namespace: &str,
        backup_id: &str,
        time: DateTime<Utc>,
        notes: &str,
    ) -> Result<()> {
        let args = PbsNotesArgs {
            credentials: self.credentials.clone(),
            namespace: Some(namespace.to_string()),
            backup_type: HOST_BACKUP_TYPE.to_string(),
            backup_id: backup_id.to_string(),
            time,
            notes: notes.to_string(),
        };
        self.query(&args).map(|_| ())
    }

    fn forget_snapshots(
        &self,
        namespace: &str,
        backup_id: &str,
        snapshots: &[DateTime<Utc>],
    ) -> Result<usize> {
        let mut removed = 0;
        for time in snapshots {
            let args = PbsForgetArgs {
                credentials: self.credentials.clone(),
                namespace: Some(namespace.to_string()),
                backup_type: HOST_BACKUP_TYPE.to_string(),
                backup_id: backup_id.to_string(),
                time: *time,
            };
            let output = run_tool_safe(&args, &self.options(self.query_timeout))?;
            if !output.success {
                if stderr_says(&output, &["not found", "does not exist"]) {
                    debug!(backup_id, %time, "snapshot already gone");
                    continue;
                }
                return Err(self.failure(&output));
            }
            if !output.skipped {
                removed += 1;
            }
        }
        info!(backup_id, namespace, removed, "forgot snapshots");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_snapshot_list_groups_by_type_and_id() {
        let json = r#"[
            {"backup-type": "host", "backup-id": "pve1-tank", "backup-time": 1767225600, "size": 10},
            {"backup-type": "host", "backup-id": "pve1-tank", "backup-time": 1767312000},
            {"backup-type": "ct", "backup-id": "101", "backup-time": 1767225600},
            {"backup-id": "pve1-tank-data", "backup-time": 1767225600}
        ]"#;
        let groups = parse_snapshot_list(json, "pve1/tank").unwrap();

        assert_eq!(groups.len(), 3);
        let tank = groups
            .iter()
            .find(|g| g.backup_id == "pve1-tank")
            .unwrap();
        assert_eq!(tank.snapshot_count(), 2);
        assert_eq!(tank.last_backup(), DateTime::from_timestamp(1767312000, 0));
        assert_eq!(tank.namespace, "pve1/tank");
        assert!(groups.iter().any(|g| g.backup_type == "ct"));
        assert!(groups
            .iter()
            .any(|g| g.backup_id == "pve1-tank-data" && g.backup_type == "host"));
    }

    #[test]
    fn test_parse_empty_and_invalid_listing() {
        assert!(parse_snapshot_list("", "").unwrap().is_empty());
        assert!(parse_snapshot_list("[]", "").unwrap().is_empty());
        assert!(matches!(
            parse_snapshot_list("not json", ""),
            Err(ZpbsError::Json(_))
        ));
    }

    #[test]
    fn test_parse_namespace_list() {
        let json = r#"[{"ns": ""}, {"ns": "pve1"}, {"ns": "pve1/tank"}, {"comment": "x"}]"#;
        assert_eq!(parse_namespace_list(json).unwrap(), vec!["pve1", "pve1/tank"]);
    }

    #[test]
    fn test_connectivity_failures_are_classified() {
        let repo = PbsRepository::new(
            PbsCredentials {
                repository: "pbs.lan:store".into(),
                ..PbsCredentials::default()
            },
            Duration::from_secs(30),
            Duration::from_secs(60),
        );
        let refused = ToolOutput {
            stderr: "Error: error trying to connect: tcp connect error: Connection refused".into(),
            exit_code: Some(255),
            ..ToolOutput::default()
        };
        assert!(repo.failure(&refused).is_connectivity());

        let denied = ToolOutput {
            stderr: "Error: permission check failed".into(),
            exit_code: Some(255),
            ..ToolOutput::default()
        };
        assert!(matches!(repo.failure(&denied), ZpbsError::Command { .. }));
    }
}
