//! Property Resolver
//!
//! Computes the effective backup configuration of every volume from the
//! values set locally on each node of the tree.
//!
//! # Design
//!
//! - **Single pass**: the tree arena is ordered parent-before-child, so each
//!   node reads its parent's already-computed effective values by index
//! - **Per-key inheritance**: every key inherits independently of the others
//! - **Pure logic**: No I/O, no side effects; the same tree always resolves to
//!   the same output
//! - **Soft validation**: a malformed local value is ignored (the node inherits
//!   as if it were unset) and reported as a warning
//!
//! # Defaults
//!
//! | Key         | Default when no ancestor sets it |
//! |-------------|----------------------------------|
//! | `backup`    | `false`                          |
//! | `schedule`  | `daily`                          |
//! | `retention` | `7d,4w,6m,1y`                    |
//! | `namespace` | `{host}/{pool}/{path}` of the volume itself |
//! | `priority`  | `50`                             |

use crate::logic::schedule;
use crate::retention::{DEFAULT_RETENTION, RetentionPolicy};
use crate::types::{PropertyKey, Schedule, Setting};
use crate::volume::{Volume, VolumeRecord, VolumeTree, auto_namespace};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

pub const DEFAULT_PRIORITY: u8 = 50;
pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 100;

// ============================================================================
// Validation
// ============================================================================

/// A validated property value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Backup(bool),
    Schedule(Schedule),
    Retention(RetentionPolicy),
    Namespace(String),
    Priority(u8),
}

/// Validate a raw value for `key`.
///
/// Used both by resolution (failures become warnings) and by `set` (failures
/// reject the command before anything is written).
pub fn validate_property_value(key: PropertyKey, raw: &str) -> Result<PropertyValue, String> {
    match key {
        PropertyKey::Backup => match raw {
            "true" => Ok(PropertyValue::Backup(true)),
            "false" => Ok(PropertyValue::Backup(false)),
            _ => Err(format!("{} must be 'true' or 'false', got '{}'", key, raw)),
        },
        PropertyKey::Schedule => raw.parse().map(PropertyValue::Schedule).map_err(|_| {
            format!(
                "{} must be one of daily, weekly, monthly, got '{}'",
                key, raw
            )
        }),
        PropertyKey::Retention => raw
            .parse()
            .map(PropertyValue::Retention)
            .map_err(|e: crate::retention::RetentionParseError| e.to_string()),
        PropertyKey::Namespace => {
            if raw.is_empty() {
                Err(format!("{} cannot be empty", key))
            } else if !raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-'))
            {
                Err(format!(
                    "{} can only contain alphanumeric characters, dashes, underscores, and slashes",
                    key
                ))
            } else if raw.split('/').any(str::is_empty) {
                Err(format!("{} cannot have empty levels, got '{}'", key, raw))
            } else {
                Ok(PropertyValue::Namespace(raw.to_string()))
            }
        }
        PropertyKey::Priority => {
            let priority: i64 = raw
                .parse()
                .map_err(|_| format!("{} must be an integer, got '{}'", key, raw))?;
            if !(i64::from(MIN_PRIORITY)..=i64::from(MAX_PRIORITY)).contains(&priority) {
                return Err(format!(
                    "{} must be between {} and {}, got {}",
                    key, MIN_PRIORITY, MAX_PRIORITY, priority
                ));
            }
            Ok(PropertyValue::Priority(priority as u8))
        }
    }
}

/// A local value that failed validation and was treated as unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolutionWarning {
    pub volume: String,
    pub key: PropertyKey,
    pub value: String,
    pub reason: String,
}

impl fmt::Display for ResolutionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: ignoring {}='{}': {}",
            self.volume,
            self.key.qualified(),
            self.value,
            self.reason
        )
    }
}

// ============================================================================
// Local settings (tri-state per key)
// ============================================================================

/// The validated values set on one volume itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalSettings {
    pub backup: Setting<bool>,
    pub schedule: Setting<Schedule>,
    pub retention: Setting<RetentionPolicy>,
    pub namespace: Setting<String>,
    pub priority: Setting<u8>,
}

impl LocalSettings {
    /// Validate the local overrides of `record`, pushing a warning for each
    /// rejected value.
    pub fn from_record(record: &VolumeRecord, warnings: &mut Vec<ResolutionWarning>) -> Self {
        let mut settings = LocalSettings::default();
        for (key, raw) in record.local_overrides() {
            match validate_property_value(key, raw) {
                Ok(PropertyValue::Backup(v)) => settings.backup = Setting::Explicit(v),
                Ok(PropertyValue::Schedule(v)) => settings.schedule = Setting::Explicit(v),
                Ok(PropertyValue::Retention(v)) => settings.retention = Setting::Explicit(v),
                Ok(PropertyValue::Namespace(v)) => settings.namespace = Setting::Explicit(v),
                Ok(PropertyValue::Priority(v)) => settings.priority = Setting::Explicit(v),
                Err(reason) => warnings.push(ResolutionWarning {
                    volume: record.volume.name.clone(),
                    key,
                    value: raw.to_string(),
                    reason,
                }),
            }
        }
        settings
    }

    /// Keys with a valid explicit value on this node.
    pub fn explicit_keys(&self) -> BTreeSet<PropertyKey> {
        let mut keys = BTreeSet::new();
        if self.backup.explicit().is_some() {
            keys.insert(PropertyKey::Backup);
        }
        if self.schedule.explicit().is_some() {
            keys.insert(PropertyKey::Schedule);
        }
        if self.retention.explicit().is_some() {
            keys.insert(PropertyKey::Retention);
        }
        if self.namespace.explicit().is_some() {
            keys.insert(PropertyKey::Namespace);
        }
        if self.priority.explicit().is_some() {
            keys.insert(PropertyKey::Priority);
        }
        keys
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// Effective configuration of one volume after inheritance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropertySet {
    pub backup_enabled: bool,
    pub schedule: Schedule,
    #[serde(serialize_with = "serialize_display")]
    pub retention: RetentionPolicy,
    pub namespace: String,
    pub priority: u8,
}

fn serialize_display<S: serde::Serializer>(
    value: &RetentionPolicy,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

/// A volume together with its effective configuration for this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedVolume {
    pub volume: Volume,
    pub properties: PropertySet,
    pub backup_id: String,
    /// Keys explicitly (and validly) set on this volume.
    pub explicit: BTreeSet<PropertyKey>,
    /// True if this volume or any ancestor sets at least one key.
    pub configured: bool,
    pub last_backup: Option<DateTime<Utc>>,
    pub due: bool,
}

impl ResolvedVolume {
    pub fn name(&self) -> &str {
        &self.volume.name
    }

    /// Attach the observed last-backup time and recompute due-ness.
    pub fn observe_last_backup(
        &mut self,
        last_backup: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        force: bool,
    ) {
        self.last_backup = last_backup;
        self.due = schedule::is_due(self.properties.schedule, last_backup, now, force);
    }
}

/// Output of one resolution pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Resolved volumes in tree order (parents first).
    pub volumes: Vec<ResolvedVolume>,
    pub warnings: Vec<ResolutionWarning>,
}

impl Resolution {
    pub fn get(&self, name: &str) -> Option<&ResolvedVolume> {
        self.volumes.iter().find(|v| v.volume.name == name)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &ResolvedVolume> {
        self.volumes.iter().filter(|v| v.properties.backup_enabled)
    }
}

/// Inherited state carried from a parent to its children.
///
/// `namespace` stays `None` until some ancestor sets it; each volume then
/// synthesizes its own default.
#[derive(Debug, Clone)]
struct Inherited {
    backup: bool,
    schedule: Schedule,
    retention: RetentionPolicy,
    namespace: Option<String>,
    priority: u8,
    configured: bool,
}

impl Default for Inherited {
    fn default() -> Self {
        Self {
            backup: false,
            schedule: Schedule::default(),
            retention: DEFAULT_RETENTION,
            namespace: None,
            priority: DEFAULT_PRIORITY,
            configured: false,
        }
    }
}

/// Resolve every volume of `tree` for `host`.
///
/// # Invariants
///
/// - For a key with no valid explicit value, the effective value equals the
///   nearest ancestor's effective value, or the default at a root
/// - Output order equals tree order
pub fn resolve(tree: &VolumeTree, host: &str) -> Resolution {
    let mut warnings = Vec::new();
    let mut cache: Vec<Inherited> = Vec::with_capacity(tree.len());
    let mut volumes = Vec::with_capacity(tree.len());

    for node in tree.nodes() {
        let parent = node
            .parent
            .map(|idx| cache[idx].clone())
            .unwrap_or_default();
        let local = LocalSettings::from_record(&node.record, &mut warnings);
        let explicit = local.explicit_keys();

        let effective = Inherited {
            backup: local.backup.or_inherit(parent.backup),
            schedule: local.schedule.or_inherit(parent.schedule),
            retention: local.retention.or_inherit(parent.retention),
            namespace: match local.namespace {
                Setting::Explicit(ns) => Some(ns),
                Setting::Inherit => parent.namespace,
            },
            priority: local.priority.or_inherit(parent.priority),
            configured: parent.configured || !explicit.is_empty(),
        };

        let volume = node.record.volume.clone();
        let namespace = effective
            .namespace
            .clone()
            .unwrap_or_else(|| auto_namespace(host, &volume.name));

        volumes.push(ResolvedVolume {
            backup_id: volume.backup_id(host),
            properties: PropertySet {
                backup_enabled: effective.backup,
                schedule: effective.schedule,
                retention: effective.retention,
                namespace,
                priority: effective.priority,
            },
            explicit,
            configured: effective.configured,
            last_backup: None,
            due: false,
            volume,
        });
        cache.push(effective);
    }

    Resolution { volumes, warnings }
}
