//! Run notifications: syslog lines, a site script, or mail.
//!
//! Delivery is best effort. Callers log a failed notification and keep the
//! run's own exit status.

use crate::config_file::parse_flag;
use crate::error::{Result, ZpbsError};
use crate::metrics::{self, MetricsConfig};
use crate::orchestrator::{JobOutcome, RunSummary, VolumeResult};
use crate::tool_runner::{RunOptions, run_tool_safe};
use crate::tools::notify::{
    LoggerArgs, MailArgs, NotifyScriptArgs, SendmailArgs, SyslogLevel,
};
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Scripts used when `ZPBS_NOTIFY_SCRIPT` is unset, first executable wins.
pub const SCRIPT_CANDIDATES: [&str; 2] = [
    "/usr/local/bin/zpbs-send-notification",
    "/usr/local/bin/pbs-send-notification",
];

pub const NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub recipient: Option<String>,
    pub syslog: bool,
    pub script: Option<PathBuf>,
    pub metrics: MetricsConfig,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            recipient: None,
            syslog: true,
            script: None,
            metrics: MetricsConfig::default(),
        }
    }
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

impl NotificationConfig {
    pub fn from_variables(vars: &BTreeMap<String, String>) -> Self {
        let candidates: Vec<&Path> = SCRIPT_CANDIDATES.iter().map(|p| Path::new(*p)).collect();
        Self::from_variables_with(vars, &candidates)
    }

    pub fn from_variables_with(vars: &BTreeMap<String, String>, candidates: &[&Path]) -> Self {
        let script = vars
            .get("ZPBS_NOTIFY_SCRIPT")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .or_else(|| {
                candidates
                    .iter()
                    .find(|p| is_executable(p))
                    .map(|p| p.to_path_buf())
            });

        Self {
            enabled: parse_flag(vars.get("ZPBS_NOTIFY"), true),
            recipient: vars
                .get("ZPBS_NOTIFY_EMAIL")
                .filter(|r| !r.is_empty())
                .cloned(),
            syslog: parse_flag(vars.get("ZPBS_SYSLOG"), true),
            script,
            metrics: MetricsConfig::from_variables(vars),
        }
    }
}

// ============================================================================
// Formatting
// ============================================================================

fn status_word(summary: &RunSummary) -> &'static str {
    if summary.is_success() { "SUCCESS" } else { "FAILURE" }
}

fn local_time(time: DateTime<Utc>) -> String {
    time.with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

pub fn format_subject(summary: &RunSummary) -> String {
    format!("[zpbs-backup] {}: {}", summary.hostname, status_word(summary))
}

/// Plain-text body used for mail and scripts.
pub fn format_body(summary: &RunSummary) -> String {
    let mut lines = vec![
        format!("Backup Summary for {}", summary.hostname),
        "=".repeat(40),
        String::new(),
        format!("Start time: {}", local_time(summary.started)),
        format!("End time:   {}", local_time(summary.finished)),
        format!("Duration:   {:.1}s", summary.duration().as_secs_f64()),
        String::new(),
        "Results:".to_string(),
        format!("  Successful: {}", summary.successful()),
        format!("  Failed:     {}", summary.failed()),
        format!("  Skipped:    {}", summary.skipped()),
        String::new(),
    ];

    let mut section = |title: &str, filter: fn(&VolumeResult) -> Option<String>| {
        let entries: Vec<String> = summary.results.iter().filter_map(filter).collect();
        if !entries.is_empty() {
            lines.push(title.to_string());
            lines.extend(entries.into_iter().map(|e| format!("  - {}", e)));
            lines.push(String::new());
        }
    };

    section("Failed datasets:", |r| match &r.outcome {
        JobOutcome::Failed { error } => Some(format!("{}: {}", r.volume, error)),
        _ => None,
    });
    section("Successful datasets:", |r| {
        r.succeeded()
            .then(|| format!("{} ({:.1}s)", r.volume, r.duration.as_secs_f64()))
    });
    section("Skipped datasets:", |r| match &r.outcome {
        JobOutcome::Skipped { reason } => Some(format!("{}: {}", r.volume, reason)),
        _ => None,
    });

    lines.join("\n")
}

/// Lines sent to syslog: a summary, then one per failed and succeeded volume.
pub fn syslog_lines(summary: &RunSummary) -> Vec<(SyslogLevel, String)> {
    let level = if summary.is_success() {
        SyslogLevel::Info
    } else {
        SyslogLevel::Err
    };
    let mut lines = vec![(
        level,
        format!(
            "backup_complete host={} status={} successful={} failed={} skipped={} duration={:.1}s",
            summary.hostname,
            status_word(summary),
            summary.successful(),
            summary.failed(),
            summary.skipped(),
            summary.duration().as_secs_f64()
        ),
    )];

    for result in &summary.results {
        if let JobOutcome::Failed { error } = &result.outcome {
            lines.push((
                SyslogLevel::Err,
                format!("backup_failed volume={} error=\"{}\"", result.volume, error),
            ));
        }
    }
    for result in summary.results.iter().filter(|r| r.succeeded()) {
        lines.push((
            SyslogLevel::Info,
            format!(
                "backup_success volume={} duration={:.1}s",
                result.volume,
                result.duration.as_secs_f64()
            ),
        ));
    }
    lines
}

/// A representative summary for `send-test-notification`.
pub fn sample_summary(hostname: &str, now: DateTime<Utc>) -> RunSummary {
    let result = |volume: &str, outcome: JobOutcome, secs: u64| VolumeResult {
        volume: volume.to_string(),
        backup_id: crate::volume::backup_id(hostname, volume),
        namespace: crate::volume::auto_namespace(hostname, volume),
        outcome,
        duration: Duration::from_secs(secs),
    };

    RunSummary {
        hostname: hostname.to_string(),
        started: now - chrono::Duration::seconds(185),
        finished: now,
        dry_run: false,
        results: vec![
            result(
                "tank/data",
                JobOutcome::Succeeded {
                    snapshot: now - chrono::Duration::seconds(140),
                },
                45,
            ),
            result(
                "tank/vms",
                JobOutcome::Failed {
                    error: "connection refused".to_string(),
                },
                30,
            ),
            result(
                "tank/scratch",
                JobOutcome::Skipped {
                    reason: "not due".to_string(),
                },
                0,
            ),
        ],
    }
}

// ============================================================================
// Delivery
// ============================================================================

pub trait Notifier {
    fn notify(&self, summary: &RunSummary) -> Result<()>;
}

/// Delivers through `logger`, a notification script, `sendmail` or `mail`.
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    config: NotificationConfig,
}

impl CommandNotifier {
    pub fn new(config: NotificationConfig) -> Self {
        Self { config }
    }

    fn send_syslog(&self, summary: &RunSummary) {
        for (level, message) in syslog_lines(summary) {
            let outcome = run_tool_safe(
                &LoggerArgs { level, message },
                &RunOptions::with_timeout(NOTIFY_TIMEOUT),
            )
            .and_then(|out| out.ensure_success("logger"));
            if let Err(e) = outcome {
                warn!(error = %e, "failed to write syslog line");
                return;
            }
        }
    }

    fn send_script(&self, script: &Path, summary: &RunSummary, body: &str) -> Result<()> {
        let args = NotifyScriptArgs {
            script: script.to_path_buf(),
            subject: format_subject(summary),
            successful: summary.successful(),
            failed: summary.failed(),
            skipped: summary.skipped(),
            duration_secs: summary.duration().as_secs(),
        };
        run_tool_safe(&args, &RunOptions::with_timeout(NOTIFY_TIMEOUT).stdin(body))?
            .ensure_success(&script.display().to_string())
    }

    fn send_mail(&self, recipient: &str, subject: &str, body: &str) -> Result<()> {
        let message = format!("To: {}\nSubject: {}\n\n{}", recipient, subject, body);
        let sendmail = run_tool_safe(
            &SendmailArgs,
            &RunOptions::with_timeout(NOTIFY_TIMEOUT).stdin(message),
        )
        .and_then(|out| out.ensure_success("sendmail"));
        match sendmail {
            Ok(()) => return Ok(()),
            Err(e) => debug!(error = %e, "sendmail failed, trying mail"),
        }

        let args = MailArgs {
            subject: subject.to_string(),
            recipient: recipient.to_string(),
        };
        run_tool_safe(&args, &RunOptions::with_timeout(NOTIFY_TIMEOUT).stdin(body))?
            .ensure_success("mail")
    }
}

impl Notifier for CommandNotifier {
    fn notify(&self, summary: &RunSummary) -> Result<()> {
        if !self.config.enabled {
            debug!("notifications disabled");
            return Ok(());
        }
        if self.config.syslog {
            self.send_syslog(summary);
        }
        if let Err(e) = metrics::push(&self.config.metrics, summary) {
            warn!(error = %e, "failed to push metrics");
        }

        let subject = format_subject(summary);
        let body = format_body(summary);
        if let Some(script) = &self.config.script {
            self.send_script(script, summary, &body)?;
            info!(script = %script.display(), "notification sent");
        } else if let Some(recipient) = &self.config.recipient {
            self.send_mail(recipient, &subject, &body)
                .map_err(|e| ZpbsError::general(format!("mail delivery failed: {}", e)))?;
            info!(recipient = %recipient, "notification sent");
        } else {
            debug!("no notification script or recipient configured");
        }
        Ok(())
    }
}
