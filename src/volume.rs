//! Volume model and the arena tree the resolver walks.
//!
//! Volumes are discovered, never created, by this crate. A volume's identity
//! is its slash-delimited path (`tank/data/db`); the first component is the
//! pool. The tree is stored as a flat arena with a parent index per node,
//! sorted so that every parent precedes all of its descendants.

use crate::types::PropertyKey;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// Separator substituted for `/` when deriving a backup-id.
pub const BACKUP_ID_SEPARATOR: char = '-';

/// Derive the remote backup-id for a volume.
///
/// `{host}-{volume path with '/' replaced by '-'}`. Backups already in the
/// remote repository are matched by this string, so it must never change.
pub fn backup_id(host: &str, volume_name: &str) -> String {
    format!(
        "{}{}{}",
        host,
        BACKUP_ID_SEPARATOR,
        volume_name.replace('/', &BACKUP_ID_SEPARATOR.to_string())
    )
}

/// Derive the default namespace for a volume: `{host}/{pool}/{path}`.
///
/// A pool root has no relative path and maps to `{host}/{pool}`.
pub fn auto_namespace(host: &str, volume_name: &str) -> String {
    match volume_name.split_once('/') {
        Some((pool, rel)) if !rel.is_empty() => format!("{}/{}/{}", host, pool, rel),
        Some((pool, _)) => format!("{}/{}", host, pool),
        None => format!("{}/{}", host, volume_name),
    }
}

/// A node of the storage hierarchy, plus the mount facts needed to back it up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    /// `None` when the mountpoint is `none`, `legacy` or `-`.
    pub mountpoint: Option<PathBuf>,
    pub mounted: bool,
    pub can_mount: bool,
}

impl Volume {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mountpoint: None,
            mounted: true,
            can_mount: true,
        }
    }

    /// Builder-style helper for tests and in-memory stores.
    pub fn with_mountpoint(mut self, mountpoint: impl Into<PathBuf>) -> Self {
        self.mountpoint = Some(mountpoint.into());
        self
    }

    pub fn pool(&self) -> &str {
        self.name.split('/').next().unwrap_or(&self.name)
    }

    /// Path below the pool, empty for the pool root.
    pub fn relative_path(&self) -> &str {
        self.name.split_once('/').map_or("", |(_, rel)| rel)
    }

    pub fn parent_name(&self) -> Option<&str> {
        self.name.rsplit_once('/').map(|(parent, _)| parent)
    }

    /// Number of path components below the pool root.
    pub fn depth(&self) -> usize {
        self.name.matches('/').count()
    }

    pub fn backup_id(&self, host: &str) -> String {
        backup_id(host, &self.name)
    }

    pub fn auto_namespace(&self, host: &str) -> String {
        auto_namespace(host, &self.name)
    }

    /// Why this volume cannot be read for a backup right now, if anything.
    pub fn unavailable_reason(&self) -> Option<&'static str> {
        if self.mountpoint.is_none() {
            Some("no mountpoint")
        } else if !self.mounted && !self.can_mount {
            Some("not mounted (canmount=off)")
        } else if !self.mounted {
            Some("not mounted")
        } else {
            None
        }
    }
}

/// Where a raw property value came from, as reported by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertySource {
    Local,
    Inherited(String),
    Default,
    /// Not set anywhere (`-`).
    None,
}

impl PropertySource {
    /// Parse the `source` column of `zfs get`.
    pub fn parse(source: &str) -> Self {
        match source {
            "local" => PropertySource::Local,
            "default" => PropertySource::Default,
            other => match other.strip_prefix("inherited from ") {
                Some(from) => PropertySource::Inherited(from.to_string()),
                None => PropertySource::None,
            },
        }
    }
}

impl std::fmt::Display for PropertySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropertySource::Local => f.write_str("local"),
            PropertySource::Inherited(from) => write!(f, "inherited from {}", from),
            PropertySource::Default => f.write_str("default"),
            PropertySource::None => f.write_str("-"),
        }
    }
}

/// A property value exactly as stored, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawProperty {
    pub value: String,
    pub source: PropertySource,
}

impl RawProperty {
    pub fn local(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            source: PropertySource::Local,
        }
    }

    pub fn unset() -> Self {
        Self {
            value: "-".to_string(),
            source: PropertySource::None,
        }
    }

    pub fn is_set(&self) -> bool {
        self.value != "-"
    }

    pub fn is_local(&self) -> bool {
        self.source == PropertySource::Local
    }
}

/// One discovered volume and the raw properties the store reported for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRecord {
    pub volume: Volume,
    pub properties: BTreeMap<PropertyKey, RawProperty>,
}

impl VolumeRecord {
    pub fn new(volume: Volume) -> Self {
        Self {
            volume,
            properties: BTreeMap::new(),
        }
    }

    /// Values set on this volume itself. Only these feed the resolver.
    pub fn local_overrides(&self) -> BTreeMap<PropertyKey, &str> {
        self.properties
            .iter()
            .filter(|(_, raw)| raw.is_local() && raw.is_set())
            .map(|(key, raw)| (*key, raw.value.as_str()))
            .collect()
    }

    pub fn get(&self, key: PropertyKey) -> Option<&RawProperty> {
        self.properties.get(&key)
    }
}

/// A tree node: record plus the arena index of its parent.
#[derive(Debug, Clone)]
pub struct TreeNode {
    pub record: VolumeRecord,
    pub parent: Option<usize>,
}

/// Arena of volumes in parent-before-child order.
///
/// A volume whose parent was not discovered hangs off its nearest discovered
/// ancestor, or becomes a root. Parents are strictly shorter paths, so the
/// hierarchy is acyclic by construction.
#[derive(Debug, Clone, Default)]
pub struct VolumeTree {
    nodes: Vec<TreeNode>,
    index: HashMap<String, usize>,
}

impl VolumeTree {
    pub fn from_records(mut records: Vec<VolumeRecord>) -> Self {
        records.sort_by(|a, b| {
            a.volume
                .depth()
                .cmp(&b.volume.depth())
                .then_with(|| a.volume.name.cmp(&b.volume.name))
        });
        records.dedup_by(|a, b| a.volume.name == b.volume.name);

        let mut tree = VolumeTree::default();
        for record in records {
            let parent = std::iter::successors(record.volume.parent_name(), |name| {
                name.rsplit_once('/').map(|(parent, _)| parent)
            })
            .find_map(|name| tree.index.get(name).copied());
            tree.index
                .insert(record.volume.name.clone(), tree.nodes.len());
            tree.nodes.push(TreeNode { record, parent });
        }
        tree
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in parent-before-child order.
    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }
}
