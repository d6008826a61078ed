//! Typed argument contracts for external tools.
//!
//! Every external command (`zfs`, `proxmox-backup-client`, `logger`,
//! `sendmail`, ...) is described by a struct implementing [`ToolArgs`]. The
//! struct is the single source of truth for the command line, so a wrong flag
//! name is a compile error in one place rather than a string typo at each
//! call site.

/// Trait for typed tool invocations.
///
/// # Contract
///
/// - `program()`: executable name, resolved through `PATH`
/// - `to_cli_args()`: arguments exactly as the tool expects them
/// - `get_env_vars()`: extra environment for the child; values may be
///   secrets and are never logged
/// - `mutates()`: true if the call changes state outside this process.
///   The runner refuses to spawn mutating tools in dry-run mode.
pub trait ToolArgs {
    fn program(&self) -> &str;

    fn to_cli_args(&self) -> Vec<String>;

    fn get_env_vars(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    fn mutates(&self) -> bool;

    /// Command line for log messages and dry-run output.
    fn display(&self) -> String {
        let mut parts = vec![self.program().to_string()];
        parts.extend(self.to_cli_args());
        parts.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo(&'static str);

    impl ToolArgs for Echo {
        fn program(&self) -> &str {
            "echo"
        }
        fn to_cli_args(&self) -> Vec<String> {
            vec!["-n".to_string(), self.0.to_string()]
        }
        fn mutates(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_display_joins_program_and_args() {
        let echo = Echo("hello");
        assert_eq!(echo.display(), "echo -n hello");
        assert!(echo.get_env_vars().is_empty());
    }
}
