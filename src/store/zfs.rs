//! ZFS-backed property store.
//!
//! Properties live as `zpbs:*` user properties on filesystems. Reads use
//! `zfs get` in scripted mode (`-H`, tab-separated); writes use `zfs set` and
//! `zfs inherit`.

use crate::error::{Result, ZpbsError};
use crate::store::PropertyStore;
use crate::tool_args::ToolArgs;
use crate::tool_runner::{RunOptions, ToolOutput, run_tool_safe};
use crate::tools::zfs::{MOUNT_PROPERTIES, ZFS, ZfsGetArgs, ZfsInheritArgs, ZfsSetArgs};
use crate::types::PropertyKey;
use crate::volume::{PropertySource, RawProperty, Volume, VolumeRecord};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Parse `zfs get -H -o name,property,value,source` output.
///
/// Lines that do not have exactly four columns are ignored. Mountpoints of
/// `none`, `legacy` and `-` count as no usable mountpoint.
pub fn parse_get_output(stdout: &str) -> Vec<VolumeRecord> {
    let mut records: BTreeMap<String, VolumeRecord> = BTreeMap::new();

    for line in stdout.lines().filter(|l| !l.is_empty()) {
        let fields: Vec<&str> = line.split('\t').collect();
        let [name, property, value, source] = fields[..] else {
            debug!(line, "skipping malformed zfs output line");
            continue;
        };

        let record = records
            .entry(name.to_string())
            .or_insert_with(|| VolumeRecord::new(Volume::new(name)));

        match property {
            "mountpoint" => {
                record.volume.mountpoint =
                    (!matches!(value, "none" | "legacy" | "-")).then(|| PathBuf::from(value));
            }
            "mounted" => record.volume.mounted = value == "yes",
            "canmount" => record.volume.can_mount = value != "off",
            other => {
                if let Some(key) = PropertyKey::parse(other) {
                    record.properties.insert(
                        key,
                        RawProperty {
                            value: value.to_string(),
                            source: PropertySource::parse(source),
                        },
                    );
                }
            }
        }
    }

    records.into_values().collect()
}

/// Classify a failed zfs call.
fn zfs_error(output: &ToolOutput) -> ZpbsError {
    let stderr = output.stderr.trim();
    if stderr.to_ascii_lowercase().contains("permission denied") {
        ZpbsError::permission(stderr.to_string())
    } else {
        ZpbsError::Command {
            program: ZFS.to_string(),
            code: output.exit_code.unwrap_or(-1),
            stderr: stderr.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ZfsStore {
    timeout: Duration,
}

impl ZfsStore {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn all_properties() -> Vec<String> {
        PropertyKey::all()
            .iter()
            .map(PropertyKey::qualified)
            .chain(MOUNT_PROPERTIES.iter().map(|p| p.to_string()))
            .collect()
    }

    fn run(&self, args: &dyn ToolArgs) -> Result<ToolOutput> {
        let output = run_tool_safe(args, &RunOptions::with_timeout(self.timeout))?;
        if output.success {
            Ok(output)
        } else {
            Err(zfs_error(&output))
        }
    }
}

impl PropertyStore for ZfsStore {
    fn list_volumes(&self) -> Result<Vec<VolumeRecord>> {
        let output = self.run(&ZfsGetArgs {
            properties: Self::all_properties(),
            volume: None,
        })?;
        Ok(parse_get_output(&output.stdout))
    }

    fn get_volume(&self, volume: &str) -> Result<VolumeRecord> {
        let output = self.run(&ZfsGetArgs {
            properties: Self::all_properties(),
            volume: Some(volume.to_string()),
        })?;
        Ok(parse_get_output(&output.stdout)
            .into_iter()
            .find(|r| r.volume.name == volume)
            .unwrap_or_else(|| VolumeRecord::new(Volume::new(volume))))
    }

    fn set(&self, volume: &str, key: PropertyKey, value: &str) -> Result<()> {
        self.run(&ZfsSetArgs {
            volume: volume.to_string(),
            property: key.qualified(),
            value: value.to_string(),
        })
        .map(|_| ())
    }

    fn clear(&self, volume: &str, key: PropertyKey, recursive: bool) -> Result<()> {
        self.run(&ZfsInheritArgs {
            volume: volume.to_string(),
            property: key.qualified(),
            recursive,
        })
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
tank\tzpbs:backup\ttrue\tlocal
tank\tzpbs:priority\t-\t-
tank\tmountpoint\t/tank\tdefault
tank\tmounted\tyes\t-
tank\tcanmount\ton\tdefault
tank/data\tzpbs:backup\ttrue\tinherited from tank
tank/data\tzpbs:schedule\tweekly\tlocal
tank/data\tmountpoint\t/tank/data\tinherited from tank
tank/data\tmounted\tno\t-
tank/vm\tmountpoint\tlegacy\tlocal
garbage line without tabs
";

    #[test]
    fn test_parse_get_output() {
        let records = parse_get_output(SAMPLE);
        assert_eq!(records.len(), 3);

        let tank = &records[0];
        assert_eq!(tank.volume.name, "tank");
        assert_eq!(tank.volume.mountpoint, Some(PathBuf::from("/tank")));
        assert!(tank.volume.mounted);
        assert!(tank.volume.can_mount);
        assert_eq!(tank.local_overrides().get(&PropertyKey::Backup), Some(&"true"));
        assert!(!tank.get(PropertyKey::Priority).unwrap().is_set());

        let data = &records[1];
        assert!(!data.volume.mounted);
        assert_eq!(
            data.get(PropertyKey::Backup).unwrap().source,
            PropertySource::Inherited("tank".into())
        );
        let local = data.local_overrides();
        assert_eq!(local.len(), 1);
        assert_eq!(local.get(&PropertyKey::Schedule), Some(&"weekly"));

        let vm = &records[2];
        assert_eq!(vm.volume.mountpoint, None);
        assert_eq!(vm.volume.unavailable_reason(), Some("no mountpoint"));
    }

    #[test]
    fn test_parse_ignores_foreign_properties() {
        let records = parse_get_output("tank\tcompression\tlz4\tlocal\n");
        assert_eq!(records.len(), 1);
        assert!(records[0].properties.is_empty());
    }

    #[test]
    fn test_all_properties_requested() {
        let props = ZfsStore::all_properties();
        assert!(props.contains(&"zpbs:retention".to_string()));
        assert!(props.contains(&"canmount".to_string()));
        assert_eq!(props.len(), 8);
    }

    #[test]
    fn test_permission_failure_is_classified() {
        let output = ToolOutput {
            stderr: "cannot set property for 'tank': permission denied\n".into(),
            exit_code: Some(1),
            ..ToolOutput::default()
        };
        assert!(matches!(zfs_error(&output), ZpbsError::Permission(_)));
    }
}
