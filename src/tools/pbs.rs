//! Type-safe arguments for `proxmox-backup-client`.
//!
//! Every invocation carries the repository credentials in its environment
//! (`PBS_REPOSITORY`, `PBS_PASSWORD`, `PBS_FINGERPRINT`), never on the
//! command line.

use crate::tool_args::ToolArgs;
use chrono::{DateTime, SecondsFormat, Utc};
use std::path::PathBuf;

pub const PBS_CLIENT: &str = "proxmox-backup-client";

/// Archive name used for every volume backup.
pub const ARCHIVE_NAME: &str = "root.pxar";

/// Repository address and secrets handed to the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PbsCredentials {
    pub repository: String,
    pub password: Option<String>,
    pub fingerprint: Option<String>,
}

impl PbsCredentials {
    fn env(&self) -> Vec<(String, String)> {
        let mut env = vec![("PBS_REPOSITORY".to_string(), self.repository.clone())];
        if let Some(ref password) = self.password {
            env.push(("PBS_PASSWORD".to_string(), password.clone()));
        }
        if let Some(ref fingerprint) = self.fingerprint {
            env.push(("PBS_FINGERPRINT".to_string(), fingerprint.clone()));
        }
        env
    }
}

fn push_namespace(args: &mut Vec<String>, namespace: Option<&str>) {
    if let Some(ns) = namespace.filter(|ns| !ns.is_empty()) {
        args.push("--ns".to_string());
        args.push(ns.to_string());
    }
}

/// `type/id/RFC3339` snapshot path as the client expects it.
pub fn snapshot_path(backup_type: &str, backup_id: &str, time: DateTime<Utc>) -> String {
    format!(
        "{}/{}/{}",
        backup_type,
        backup_id,
        time.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

// ============================================================================
// Read-only calls
// ============================================================================

/// `status --output-format json`: cheap authenticated read used as a
/// connection check.
#[derive(Debug, Clone)]
pub struct PbsStatusArgs {
    pub credentials: PbsCredentials,
}

impl ToolArgs for PbsStatusArgs {
    fn program(&self) -> &str {
        PBS_CLIENT
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "status".to_string(),
            "--output-format".to_string(),
            "json".to_string(),
        ]
    }

    fn get_env_vars(&self) -> Vec<(String, String)> {
        self.credentials.env()
    }

    fn mutates(&self) -> bool {
        false
    }
}

/// `snapshot list --output-format json [--ns <ns>]`
#[derive(Debug, Clone)]
pub struct PbsSnapshotListArgs {
    pub credentials: PbsCredentials,
    pub namespace: Option<String>,
}

impl ToolArgs for PbsSnapshotListArgs {
    fn program(&self) -> &str {
        PBS_CLIENT
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec![
            "snapshot".to_string(),
            "list".to_string(),
            "--output-format".to_string(),
            "json".to_string(),
        ];
        push_namespace(&mut args, self.namespace.as_deref());
        args
    }

    fn get_env_vars(&self) -> Vec<(String, String)> {
        self.credentials.env()
    }

    fn mutates(&self) -> bool {
        false
    }
}

/// `namespace list --output-format json`
#[derive(Debug, Clone)]
pub struct PbsNamespaceListArgs {
    pub credentials: PbsCredentials,
}

impl ToolArgs for PbsNamespaceListArgs {
    fn program(&self) -> &str {
        PBS_CLIENT
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "namespace".to_string(),
            "list".to_string(),
            "--output-format".to_string(),
            "json".to_string(),
        ]
    }

    fn get_env_vars(&self) -> Vec<(String, String)> {
        self.credentials.env()
    }

    fn mutates(&self) -> bool {
        false
    }
}

// ============================================================================
// Mutating calls
// ============================================================================

/// `namespace create <ns>` for a single level.
#[derive(Debug, Clone)]
pub struct PbsNamespaceCreateArgs {
    pub credentials: PbsCredentials,
    pub namespace: String,
}

impl ToolArgs for PbsNamespaceCreateArgs {
    fn program(&self) -> &str {
        PBS_CLIENT
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "namespace".to_string(),
            "create".to_string(),
            self.namespace.clone(),
        ]
    }

    fn get_env_vars(&self) -> Vec<(String, String)> {
        self.credentials.env()
    }

    fn mutates(&self) -> bool {
        true
    }
}

/// `backup root.pxar:<source> --backup-id <id> [--ns <ns>]`
#[derive(Debug, Clone)]
pub struct PbsBackupArgs {
    pub credentials: PbsCredentials,
    pub source: PathBuf,
    pub backup_id: String,
    pub namespace: Option<String>,
}

impl ToolArgs for PbsBackupArgs {
    fn program(&self) -> &str {
        PBS_CLIENT
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec![
            "backup".to_string(),
            format!("{}:{}", ARCHIVE_NAME, self.source.display()),
            "--backup-id".to_string(),
            self.backup_id.clone(),
        ];
        push_namespace(&mut args, self.namespace.as_deref());
        args
    }

    fn get_env_vars(&self) -> Vec<(String, String)> {
        self.credentials.env()
    }

    fn mutates(&self) -> bool {
        true
    }
}

/// `snapshot forget <type>/<id>/<time> [--ns <ns>]`
#[derive(Debug, Clone)]
pub struct PbsForgetArgs {
    pub credentials: PbsCredentials,
    pub namespace: Option<String>,
    pub backup_type: String,
    pub backup_id: String,
    pub time: DateTime<Utc>,
}

impl ToolArgs for PbsForgetArgs {
    fn program(&self) -> &str {
        PBS_CLIENT
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec![
            "snapshot".to_string(),
            "forget".to_string(),
            snapshot_path(&self.backup_type, &self.backup_id, self.time),
        ];
        push_namespace(&mut args, self.namespace.as_deref());
        args
    }

    fn get_env_vars(&self) -> Vec<(String, String)> {
        self.credentials.env()
    }

    fn mutates(&self) -> bool {
        true
    }
}

/// `snapshot notes update <type>/<id>/<time> <notes> [--ns <ns>]`
#[derive(Debug, Clone)]
pub struct PbsNotesArgs {
    pub credentials: PbsCredentials,
    pub namespace: Option<String>,
    pub backup_type: String,
    pub backup_id: String,
    pub time: DateTime<Utc>,
    pub notes: String,
}

impl ToolArgs for PbsNotesArgs {
    fn program(&self) -> &str {
        PBS_CLIENT
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec![
            "snapshot".to_string(),
            "notes".to_string(),
            "update".to_string(),
            snapshot_path(&self.backup_type, &self.backup_id, self.time),
            self.notes.clone(),
        ];
        push_namespace(&mut args, self.namespace.as_deref());
        args
    }

    fn get_env_vars(&self) -> Vec<(String, String)> {
        self.credentials.env()
    }

    fn mutates(&self) -> bool {
        true
    }
}
