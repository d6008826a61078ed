//! Type-safe arguments for the `zfs` command.

use crate::tool_args::ToolArgs;

pub const ZFS: &str = "zfs";

/// Column layout requested from `zfs get`; the parser depends on it.
pub const GET_COLUMNS: &str = "name,property,value,source";

/// Native properties fetched alongside the `zpbs:` ones.
pub const MOUNT_PROPERTIES: [&str; 3] = ["mountpoint", "mounted", "canmount"];

// ============================================================================
// zfs get
// ============================================================================

/// `zfs get -H -o name,property,value,source <props> [volume]`
#[derive(Debug, Clone)]
pub struct ZfsGetArgs {
    pub properties: Vec<String>,
    /// Query a single volume instead of every filesystem.
    pub volume: Option<String>,
}

impl ToolArgs for ZfsGetArgs {
    fn program(&self) -> &str {
        ZFS
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec!["get".to_string()];
        if self.volume.is_none() {
            args.push("-t".to_string());
            args.push("filesystem".to_string());
        }
        args.extend([
            "-H".to_string(),
            "-o".to_string(),
            GET_COLUMNS.to_string(),
            self.properties.join(","),
        ]);
        if let Some(ref volume) = self.volume {
            args.push(volume.clone());
        }
        args
    }

    fn mutates(&self) -> bool {
        false
    }
}

// ============================================================================
// zfs set
// ============================================================================

/// `zfs set <property>=<value> <volume>`
#[derive(Debug, Clone)]
pub struct ZfsSetArgs {
    pub volume: String,
    pub property: String,
    pub value: String,
}

impl ToolArgs for ZfsSetArgs {
    fn program(&self) -> &str {
        ZFS
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "set".to_string(),
            format!("{}={}", self.property, self.value),
            self.volume.clone(),
        ]
    }

    fn mutates(&self) -> bool {
        true
    }
}

// ============================================================================
// zfs inherit
// ============================================================================

/// `zfs inherit [-r] <property> <volume>`
#[derive(Debug, Clone)]
pub struct ZfsInheritArgs {
    pub volume: String,
    pub property: String,
    pub recursive: bool,
}

impl ToolArgs for ZfsInheritArgs {
    fn program(&self) -> &str {
        ZFS
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec!["inherit".to_string()];
        if self.recursive {
            args.push("-r".to_string());
        }
        args.push(self.property.clone());
        args.push(self.volume.clone());
        args
    }

    fn mutates(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_all_filesystems() {
        let args = ZfsGetArgs {
            properties: vec!["zpbs:backup".into(), "mountpoint".into()],
            volume: None,
        };
        assert_eq!(
            args.to_cli_args(),
            vec![
                "get",
                "-t",
                "filesystem",
                "-H",
                "-o",
                "name,property,value,source",
                "zpbs:backup,mountpoint"
            ]
        );
        assert!(!args.mutates());
    }

    #[test]
    fn test_get_single_volume() {
        let args = ZfsGetArgs {
            properties: vec!["zpbs:backup".into()],
            volume: Some("tank/data".into()),
        };
        let cli = args.to_cli_args();
        assert_eq!(cli.first().map(String::as_str), Some("get"));
        assert_eq!(cli.last().map(String::as_str), Some("tank/data"));
        assert!(!cli.contains(&"-t".to_string()));
    }

    #[test]
    fn test_set_and_inherit() {
        let set = ZfsSetArgs {
            volume: "tank/data".into(),
            property: "zpbs:priority".into(),
            value: "10".into(),
        };
        assert_eq!(set.display(), "zfs set zpbs:priority=10 tank/data");
        assert!(set.mutates());

        let inherit = ZfsInheritArgs {
            volume: "tank".into(),
            property: "zpbs:backup".into(),
            recursive: true,
        };
        assert_eq!(inherit.display(), "zfs inherit -r zpbs:backup tank");
        assert!(inherit.mutates());
    }
}
