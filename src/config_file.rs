//! Connection and runtime configuration.
//!
//! Settings come from shell-style `KEY=VALUE` files and the process
//! environment. Sources are read lowest priority first so that later values
//! override earlier ones and can reference them through `${VAR}` / `$VAR`.

use crate::error::{Result, ZpbsError};
use crate::notify::NotificationConfig;
use crate::tools::pbs::PbsCredentials;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub const SYSTEM_CONFIG: &str = "/etc/zpbs-backup/pbs.conf";
pub const USER_CONFIG: &str = ".zpbs-backup.conf";
pub const LEGACY_SECRETS: &str = ".proxmox-backup-secrets";

pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_BACKUP_TIMEOUT_SECS: u64 = 43_200;

/// Variables taken from the process environment.
pub const RECOGNISED_VARIABLES: [&str; 14] = [
    "PBS_REPOSITORY",
    "REPOSITORY",
    "PBS_PASSWORD",
    "PASSWORD",
    "PBS_FINGERPRINT",
    "FINGERPRINT",
    "ZPBS_HOSTNAME",
    "ZPBS_QUERY_TIMEOUT",
    "ZPBS_BACKUP_TIMEOUT",
    "ZPBS_NOTIFY",
    "ZPBS_NOTIFY_EMAIL",
    "ZPBS_SYSLOG",
    "ZPBS_NOTIFY_SCRIPT",
    "ZPBS_PUSHGATEWAY",
];

const REPOSITORY_KEYS: [&str; 2] = ["PBS_REPOSITORY", "REPOSITORY"];
const PASSWORD_KEYS: [&str; 2] = ["PBS_PASSWORD", "PASSWORD"];
const FINGERPRINT_KEYS: [&str; 2] = ["PBS_FINGERPRINT", "FINGERPRINT"];

// ============================================================================
// Sources
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SourceStatus {
    /// Supplied the effective repository.
    Active,
    Loaded,
    NotFound,
    PermissionDenied,
    Unreadable,
    Environment,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigSource {
    pub name: String,
    pub path: Option<PathBuf>,
    pub status: SourceStatus,
    /// Variables this source defined, after interpolation.
    pub variables: BTreeMap<String, String>,
}

impl ConfigSource {
    /// First non-empty value among `keys`, in the order given.
    fn first_of(&self, keys: &[&str]) -> Option<&String> {
        keys.iter()
            .filter_map(|k| self.variables.get(*k))
            .find(|v| !v.is_empty())
    }

    fn defines_repository(&self) -> bool {
        self.first_of(&REPOSITORY_KEYS).is_some()
    }
}

/// Replace `${VAR}` and `$VAR` references; unknown names stay literal.
pub fn interpolate(value: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(braced) = after.strip_prefix('{') {
            if let Some(end) = braced.find('}') {
                let name = &braced[..end];
                match lookup(name) {
                    Some(v) => out.push_str(&v),
                    None => out.push_str(&rest[pos..pos + end + 3]),
                }
                rest = &braced[end + 1..];
                continue;
            }
        } else {
            let len = after
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                .count();
            let starts_ok = after
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
            if len > 0 && starts_ok {
                let name = &after[..len];
                match lookup(name) {
                    Some(v) => out.push_str(&v),
                    None => out.push_str(&rest[pos..pos + 1 + len]),
                }
                rest = &after[len..];
                continue;
            }
        }

        out.push('$');
        rest = after;
    }
    out.push_str(rest);
    out
}

/// Parse one config file's text. `inherited` holds the variables defined by
/// lower-priority sources and is consulted for interpolation only.
pub fn parse_config(content: &str, inherited: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut own: BTreeMap<String, String> = BTreeMap::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
        let value = interpolate(value, |name| {
            own.get(name).or_else(|| inherited.get(name)).cloned()
        });
        own.insert(key.to_string(), value);
    }
    own
}

// ============================================================================
// Loader
// ============================================================================

/// Reads configuration sources. Paths and environment are injectable.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// (display name, path), lowest priority first
    files: Vec<(String, PathBuf)>,
    env: BTreeMap<String, String>,
}

impl ConfigLoader {
    /// The standard locations and the current process environment.
    pub fn system() -> Self {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/root"));
        Self::new()
            .with_file(LEGACY_SECRETS, home.join(LEGACY_SECRETS))
            .with_file(SYSTEM_CONFIG, SYSTEM_CONFIG)
            .with_file(format!("~/{}", USER_CONFIG), home.join(USER_CONFIG))
            .with_env(std::env::vars())
    }

    pub fn new() -> Self {
        Self {
            files: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    /// Append a file source above those already added.
    pub fn with_file(mut self, name: impl Into<String>, path: impl AsRef<Path>) -> Self {
        self.files.push((name.into(), path.as_ref().to_path_buf()));
        self
    }

    /// Environment variables; only recognised names are kept.
    pub fn with_env<K, V>(mut self, vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.env = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, _)| RECOGNISED_VARIABLES.contains(&k.as_str()))
            .collect();
        self
    }

    /// Every source, lowest priority first.
    pub fn sources(&self) -> Vec<ConfigSource> {
        let mut merged: BTreeMap<String, String> = BTreeMap::new();
        let mut sources = Vec::with_capacity(self.files.len() + 1);

        for (name, path) in &self.files {
            let (status, variables) = match fs::read_to_string(path) {
                Ok(content) => (SourceStatus::Loaded, parse_config(&content, &merged)),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    (SourceStatus::NotFound, BTreeMap::new())
                }
                Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                    debug!(path = %path.display(), "config source not readable");
                    (SourceStatus::PermissionDenied, BTreeMap::new())
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read config source");
                    (SourceStatus::Unreadable, BTreeMap::new())
                }
            };
            merged.extend(variables.iter().map(|(k, v)| (k.clone(), v.clone())));
            sources.push(ConfigSource {
                name: name.clone(),
                path: Some(path.clone()),
                status,
                variables,
            });
        }

        sources.push(ConfigSource {
            name: "environment".to_string(),
            path: None,
            status: SourceStatus::Environment,
            variables: self.env.clone(),
        });

        if let Some(active) = sources.iter_mut().rev().find(|s| s.defines_repository()) {
            active.status = SourceStatus::Active;
        }
        sources
    }

    pub fn load(&self) -> Settings {
        let sources = self.sources();
        let merged: BTreeMap<String, String> = sources
            .iter()
            .flat_map(|s| s.variables.iter())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        // Aliases resolve per source, highest priority first, so a key set in
        // a higher source beats its alias set in a lower one.
        let lookup = |keys: &[&str]| {
            sources
                .iter()
                .rev()
                .find_map(|s| s.first_of(keys))
                .cloned()
        };

        let pbs = lookup(&REPOSITORY_KEYS).map(|repository| PbsConfig {
            repository,
            password: lookup(&PASSWORD_KEYS),
            fingerprint: lookup(&FINGERPRINT_KEYS),
            active_source: sources
                .iter()
                .find(|s| s.status == SourceStatus::Active)
                .map(|s| s.name.clone())
                .unwrap_or_default(),
        });

        let hostname = merged
            .get("ZPBS_HOSTNAME")
            .filter(|h| !h.is_empty())
            .cloned()
            .unwrap_or_else(system_hostname);

        Settings {
            pbs,
            hostname,
            query_timeout: seconds(&merged, "ZPBS_QUERY_TIMEOUT", DEFAULT_QUERY_TIMEOUT_SECS),
            backup_timeout: seconds(&merged, "ZPBS_BACKUP_TIMEOUT", DEFAULT_BACKUP_TIMEOUT_SECS),
            notification: NotificationConfig::from_variables(&merged),
            sources,
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn seconds(vars: &BTreeMap<String, String>, key: &str, default: u64) -> Duration {
    let secs = match vars.get(key) {
        None => default,
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(n) if n > 0 => n,
            _ => {
                warn!(key, value = %raw, default, "invalid timeout, using default");
                default
            }
        },
    };
    Duration::from_secs(secs)
}

/// Parse a boolean switch; anything unrecognised yields `default`.
pub fn parse_flag(raw: Option<&String>, default: bool) -> bool {
    match raw.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        Some("true" | "yes" | "1" | "on") => true,
        Some("false" | "no" | "0" | "off") => false,
        None | Some("") => default,
        Some(other) => {
            warn!(value = other, default, "invalid boolean setting, using default");
            default
        }
    }
}

/// Short system hostname.
pub fn system_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .and_then(|h| h.split('.').next().map(str::to_string))
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// `abcd****` for long secrets, `****` for short ones.
pub fn mask_secret(secret: Option<&str>) -> String {
    match secret {
        None | Some("") => "(not set)".to_string(),
        Some(s) if s.chars().count() <= 8 => "****".to_string(),
        Some(s) => format!("{}****", s.chars().take(4).collect::<String>()),
    }
}

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone)]
pub struct Settings {
    pub pbs: Option<PbsConfig>,
    pub hostname: String,
    pub query_timeout: Duration,
    pub backup_timeout: Duration,
    pub notification: NotificationConfig,
    pub sources: Vec<ConfigSource>,
}

impl Settings {
    /// Repository settings, required by every remote command.
    pub fn pbs(&self) -> Result<&PbsConfig> {
        self.pbs.as_ref().ok_or_else(|| {
            ZpbsError::configuration_absent(format!(
                "PBS_REPOSITORY not configured. Set it in the environment, {} or ~/{}. \
                 Files under /etc/zpbs-backup/ may require root access.",
                SYSTEM_CONFIG, USER_CONFIG
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PbsConfig {
    pub repository: String,
    pub password: Option<String>,
    pub fingerprint: Option<String>,
    pub active_source: String,
}

/// Display parts of `user@realm!token@host[:port]:datastore`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepositoryParts {
    pub user: Option<String>,
    pub token_name: Option<String>,
    pub server: Option<String>,
    pub datastore: Option<String>,
}

impl PbsConfig {
    pub fn credentials(&self) -> PbsCredentials {
        PbsCredentials {
            repository: self.repository.clone(),
            password: self.password.clone(),
            fingerprint: self.fingerprint.clone(),
        }
    }

    pub fn parts(&self) -> RepositoryParts {
        let (auth, location) = match self.repository.rsplit_once('@') {
            Some((auth, location)) => (Some(auth), location),
            None => (None, self.repository.as_str()),
        };
        let (user, token_name) = match auth.map(|a| a.split_once('!')) {
            Some(Some((user, token))) => (Some(user.to_string()), Some(token.to_string())),
            Some(None) => (auth.map(str::to_string), None),
            None => (None, None),
        };
        let (server, datastore) = match location.rsplit_once(':') {
            Some((server, store)) => (Some(server.to_string()), Some(store.to_string())),
            None => (Some("localhost".to_string()), Some(location.to_string())),
        };
        RepositoryParts {
            user,
            token_name,
            server: server.filter(|s| !s.is_empty()),
            datastore: datastore.filter(|s| !s.is_empty()),
        }
    }
}
