//! Error handling module for zpbs-backup
//!
//! Provides centralized error handling with proper error types using thiserror.
//! Every error knows which process exit code it maps to, so the CLI layer can
//! tell "one volume failed" apart from "nothing could run at all".

use thiserror::Error;

/// Exit code when the whole command succeeded.
pub const EXIT_OK: i32 = 0;
/// Exit code when one or more volumes failed, or for general errors.
pub const EXIT_FAILURE: i32 = 1;
/// Exit code used by clap for usage errors.
pub const EXIT_USAGE: i32 = 2;
/// Exit code when no repository configuration could be found.
pub const EXIT_CONFIG_ABSENT: i32 = 3;
/// Exit code when the remote repository is unreachable.
pub const EXIT_CONNECTIVITY: i32 = 4;

/// Main error type for zpbs-backup
#[derive(Error, Debug)]
pub enum ZpbsError {
    /// IO errors (spawning tools, reading config files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Remote repository unreachable or refusing the request
    #[error("Connectivity failure ({target}): {reason}")]
    Connectivity { target: String, reason: String },

    /// An external call exceeded its deadline
    #[error("{command} timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },

    /// Caller lacks the rights to read or change something
    #[error("Permission denied: {0}")]
    Permission(String),

    /// Malformed property value, retention string or CLI argument
    #[error("Validation error: {0}")]
    Validation(String),

    /// No repository configuration found in any source
    #[error("Configuration absent: {0}")]
    ConfigurationAbsent(String),

    /// An external tool exited non-zero
    #[error("{program} failed (exit code {code}): {stderr}")]
    Command {
        program: String,
        code: i32,
        stderr: String,
    },

    /// Some volumes of a run failed
    #[error("{failed} of {total} volume(s) failed")]
    PartialRun { failed: usize, total: usize },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// General errors (catch-all for edge cases)
    #[error("{0}")]
    General(String),
}

/// Result type alias for zpbs operations
pub type Result<T> = std::result::Result<T, ZpbsError>;

// Convenient error constructors
impl ZpbsError {
    /// Create a connectivity error
    pub fn connectivity(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Connectivity {
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// Create a permission error
    pub fn permission(msg: impl Into<String>) -> Self {
        Self::Permission(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a configuration-absent error
    pub fn configuration_absent(msg: impl Into<String>) -> Self {
        Self::ConfigurationAbsent(msg.into())
    }

    /// Create a general error
    pub fn general(msg: impl Into<String>) -> Self {
        Self::General(msg.into())
    }

    /// True for failures that mean "the remote could not be reached in time".
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity { .. } | Self::Timeout { .. })
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConfigurationAbsent(_) => EXIT_CONFIG_ABSENT,
            Self::Connectivity { .. } | Self::Timeout { .. } => EXIT_CONNECTIVITY,
            Self::Validation(_) => EXIT_USAGE,
            _ => EXIT_FAILURE,
        }
    }
}
