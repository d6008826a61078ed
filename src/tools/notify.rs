//! Type-safe arguments for notification delivery commands.

use crate::tool_args::ToolArgs;
use std::path::PathBuf;

/// Syslog tag used for every line zpbs-backup logs.
pub const SYSLOG_TAG: &str = "zpbs-backup";

/// Syslog severity for a `logger` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyslogLevel {
    Info,
    Err,
}

impl SyslogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            SyslogLevel::Info => "info",
            SyslogLevel::Err => "err",
        }
    }
}

/// `logger -t zpbs-backup -p local0.<level> <message>`
#[derive(Debug, Clone)]
pub struct LoggerArgs {
    pub level: SyslogLevel,
    pub message: String,
}

impl ToolArgs for LoggerArgs {
    fn program(&self) -> &str {
        "logger"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "-t".to_string(),
            SYSLOG_TAG.to_string(),
            "-p".to_string(),
            format!("local0.{}", self.level.as_str()),
            self.message.clone(),
        ]
    }

    fn mutates(&self) -> bool {
        true
    }
}

/// `sendmail -t`; the full message including headers goes to stdin.
#[derive(Debug, Clone)]
pub struct SendmailArgs;

impl ToolArgs for SendmailArgs {
    fn program(&self) -> &str {
        "sendmail"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["-t".to_string()]
    }

    fn mutates(&self) -> bool {
        true
    }
}

/// `mail -s <subject> <recipient>`; the body goes to stdin.
#[derive(Debug, Clone)]
pub struct MailArgs {
    pub subject: String,
    pub recipient: String,
}

impl ToolArgs for MailArgs {
    fn program(&self) -> &str {
        "mail"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "-s".to_string(),
            self.subject.clone(),
            self.recipient.clone(),
        ]
    }

    fn mutates(&self) -> bool {
        true
    }
}

/// A site-provided notification script. The body goes to stdin; the run
/// figures are passed as `ZPBS_*` environment variables.
#[derive(Debug, Clone)]
pub struct NotifyScriptArgs {
    pub script: PathBuf,
    pub subject: String,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_secs: u64,
}

impl ToolArgs for NotifyScriptArgs {
    fn program(&self) -> &str {
        self.script.to_str().unwrap_or_default()
    }

    fn to_cli_args(&self) -> Vec<String> {
        Vec::new()
    }

    fn get_env_vars(&self) -> Vec<(String, String)> {
        vec![
            ("ZPBS_SUBJECT".to_string(), self.subject.clone()),
            ("ZPBS_SUCCESSFUL".to_string(), self.successful.to_string()),
            ("ZPBS_FAILED".to_string(), self.failed.to_string()),
            ("ZPBS_SKIPPED".to_string(), self.skipped.to_string()),
            ("ZPBS_DURATION".to_string(), self.duration_secs.to_string()),
        ]
    }

    fn mutates(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logger_args() {
        let args = LoggerArgs {
            level: SyslogLevel::Err,
            message: "backup_failed volume=tank".into(),
        };
        assert_eq!(
            args.to_cli_args(),
            vec!["-t", "zpbs-backup", "-p", "local0.err", "backup_failed volume=tank"]
        );
    }

    #[test]
    fn test_script_env_contract() {
        let args = NotifyScriptArgs {
            script: PathBuf::from("/usr/local/bin/zpbs-send-notification"),
            subject: "[zpbs-backup] pve1: SUCCESS".into(),
            successful: 2,
            failed: 0,
            skipped: 1,
            duration_secs: 95,
        };
        assert_eq!(args.program(), "/usr/local/bin/zpbs-send-notification");
        let env = args.get_env_vars();
        assert!(env.contains(&("ZPBS_SKIPPED".to_string(), "1".to_string())));
        assert!(env.contains(&("ZPBS_DURATION".to_string(), "95".to_string())));
    }

    #[test]
    fn test_mail_args() {
        let args = MailArgs {
            subject: "hello".into(),
            recipient: "root@localhost".into(),
        };
        assert_eq!(args.display(), "mail -s hello root@localhost");
        assert_eq!(SendmailArgs.display(), "sendmail -t");
    }
}
