//! Prometheus Pushgateway reporting for backup runs.
//!
//! After a real run the notifier pushes a small set of gauges to
//! `{gateway}/metrics/job/zpbs_backup/instance/{host}`. The time of the last
//! fully successful run survives between runs in a JSON state file, so a
//! failing run still reports when things last worked.
//!
//! Reporting is best effort: a failed push or an unwritable state file is
//! logged and never changes the run's exit status.

use crate::error::{Result, ZpbsError};
use crate::orchestrator::RunSummary;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where the last-success timestamp is persisted.
pub const STATE_FILE: &str = "/var/lib/zpbs-backup/state.json";

/// Pushgateway job label.
pub const JOB_NAME: &str = "zpbs_backup";

pub const PUSH_TIMEOUT: Duration = Duration::from_secs(5);

const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsConfig {
    /// Base URL such as `http://10.0.16.16:9091`. Nothing is pushed when unset.
    pub pushgateway: Option<String>,
    pub state_file: PathBuf,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            pushgateway: None,
            state_file: PathBuf::from(STATE_FILE),
        }
    }
}

impl MetricsConfig {
    pub fn from_variables(vars: &BTreeMap<String, String>) -> Self {
        Self {
            pushgateway: vars
                .get("ZPBS_PUSHGATEWAY")
                .map(|url| url.trim())
                .filter(|url| !url.is_empty())
                .map(str::to_string),
            state_file: PathBuf::from(STATE_FILE),
        }
    }
}

// ============================================================================
// State file
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct RunState {
    last_success_timestamp_seconds: f64,
}

/// Persisted time of the last fully successful run.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// `None` when the file is missing or unreadable.
    pub fn last_success(&self) -> Option<f64> {
        let content = fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str::<RunState>(&content) {
            Ok(state) => Some(state.last_success_timestamp_seconds),
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "ignoring malformed state file");
                None
            }
        }
    }

    pub fn record_success(&self, timestamp: f64) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let state = RunState {
            last_success_timestamp_seconds: timestamp,
        };
        fs::write(&self.path, serde_json::to_string(&state)?)?;
        Ok(())
    }
}

/// Last-success time to report for this run.
///
/// A run with no failures and at least one completed backup records `run_end`.
/// Any other run reports the persisted value, or 0 when there is none.
pub fn last_success(summary: &RunSummary, state: &StateFile, run_end: f64) -> f64 {
    if summary.failed() == 0 && summary.successful() > 0 {
        if let Err(e) = state.record_success(run_end) {
            warn!(error = %e, "could not write metrics state file");
        }
        run_end
    } else {
        state.last_success().unwrap_or(0.0)
    }
}

// ============================================================================
// Exposition
// ============================================================================

/// Text exposition body for one run.
pub fn render(summary: &RunSummary, run_end: f64, last_success: f64) -> String {
    let gauges: [(&str, &str, String); 6] = [
        (
            "zpbs_backup_last_run_timestamp_seconds",
            "Unix timestamp of most recent backup run end",
            run_end.to_string(),
        ),
        (
            "zpbs_backup_last_success_timestamp_seconds",
            "Unix timestamp of last fully successful backup run",
            last_success.to_string(),
        ),
        (
            "zpbs_backup_duration_seconds",
            "Duration of the backup run in seconds",
            summary.duration().as_secs_f64().to_string(),
        ),
        (
            "zpbs_backup_datasets_successful",
            "Number of datasets backed up successfully",
            summary.successful().to_string(),
        ),
        (
            "zpbs_backup_datasets_failed",
            "Number of datasets that failed to back up",
            summary.failed().to_string(),
        ),
        (
            "zpbs_backup_datasets_skipped",
            "Number of datasets skipped",
            summary.skipped().to_string(),
        ),
    ];

    let mut out = String::new();
    for (name, help, value) in gauges {
        out.push_str(&format!("# HELP {} {}\n", name, help));
        out.push_str(&format!("# TYPE {} gauge\n", name));
        out.push_str(&format!("{} {}\n", name, value));
    }
    out
}

pub fn push_url(gateway: &str, hostname: &str) -> String {
    format!(
        "{}/metrics/job/{}/instance/{}",
        gateway.trim_end_matches('/'),
        JOB_NAME,
        hostname
    )
}

/// Push the run's gauges. A no-op when no gateway is configured.
pub fn push(config: &MetricsConfig, summary: &RunSummary) -> Result<()> {
    let Some(gateway) = config.pushgateway.as_deref() else {
        debug!("no pushgateway configured");
        return Ok(());
    };

    let run_end = summary.finished.timestamp_millis() as f64 / 1000.0;
    let reported = last_success(summary, &StateFile::new(&config.state_file), run_end);
    let body = render(summary, run_end, reported);
    let url = push_url(gateway, &summary.hostname);

    let client = reqwest::blocking::Client::builder()
        .timeout(PUSH_TIMEOUT)
        .build()
        .map_err(|e| ZpbsError::connectivity(gateway, e.to_string()))?;
    client
        .put(&url)
        .header(reqwest::header::CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)
        .body(body)
        .send()
        .and_then(|response| response.error_for_status())
        .map_err(|e| ZpbsError::connectivity(gateway, e.to_string()))?;

    info!(url = %url, "metrics pushed");
    Ok(())
}
