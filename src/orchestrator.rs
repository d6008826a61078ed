//! Backup, prune, status and audit runs.
//!
//! Orchestration is the only layer that talks to both the property store and
//! the remote repository. Jobs execute one at a time in priority order and a
//! failing volume never stops the rest of the run.

use crate::engine::audit::{AuditReport, audit};
use crate::engine::retention::{self, RetentionDecision};
use crate::error::{Result, ZpbsError};
use crate::logic::priority;
use crate::logic::resolver::{Resolution, ResolvedVolume, resolve};
use crate::logic::schedule::{format_last_backup, format_time_delta, time_until_due};
use crate::remote::RemoteRepository;
use crate::store::PropertyStore;
use crate::volume::VolumeTree;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

// ============================================================================
// Discovery
// ============================================================================

/// Volume filter for `--dataset`.
#[derive(Debug, Clone)]
pub struct VolumeFilter(Option<glob::Pattern>);

impl VolumeFilter {
    pub fn all() -> Self {
        Self(None)
    }

    pub fn parse(pattern: Option<&str>) -> Result<Self> {
        pattern
            .map(|p| {
                glob::Pattern::new(p).map_err(|e| {
                    ZpbsError::validation(format!("invalid dataset pattern '{}': {}", p, e))
                })
            })
            .transpose()
            .map(Self)
    }

    pub fn matches(&self, name: &str) -> bool {
        self.0.as_ref().is_none_or(|p| p.matches(name))
    }
}

/// List, build the tree and resolve. Warnings are logged here.
pub fn discover(store: &dyn PropertyStore, hostname: &str) -> Result<Resolution> {
    let records = store.list_volumes()?;
    let tree = VolumeTree::from_records(records);
    let resolution = resolve(&tree, hostname);
    for warning in &resolution.warnings {
        warn!(%warning, "ignoring invalid property");
    }
    debug!(
        volumes = resolution.volumes.len(),
        enabled = resolution.enabled().count(),
        "resolved volume tree"
    );
    Ok(resolution)
}

/// Attach last-backup times with one listing per namespace.
///
/// Returns the volumes whose namespace could not be listed, with the error.
fn observe_backups(
    remote: &dyn RemoteRepository,
    volumes: &mut [ResolvedVolume],
    now: DateTime<Utc>,
    force: bool,
) -> BTreeMap<String, String> {
    let mut listings: BTreeMap<String, std::result::Result<BTreeMap<String, DateTime<Utc>>, String>> =
        BTreeMap::new();
    let mut failures = BTreeMap::new();

    for volume in volumes.iter_mut() {
        let namespace = volume.properties.namespace.clone();
        let listing = listings.entry(namespace.clone()).or_insert_with(|| {
            remote
                .list_groups(Some(&namespace))
                .map(|groups| {
                    groups
                        .into_iter()
                        .filter_map(|g| g.last_backup().map(|t| (g.backup_id, t)))
                        .collect()
                })
                .map_err(|e| {
                    error!(namespace = %namespace, error = %e, "failed to list backup groups");
                    e.to_string()
                })
        });

        match listing {
            Ok(latest) => {
                let last = latest.get(&volume.backup_id).copied();
                volume.observe_last_backup(last, now, force);
            }
            Err(reason) => {
                failures.insert(volume.name().to_string(), reason.clone());
            }
        }
    }
    failures
}

// ============================================================================
// Backup runs
// ============================================================================

/// Longest notes text attached to a snapshot.
pub const MAX_NOTES_LEN: usize = 256;

/// Notes for a fresh snapshot: `{host}:{mountpoint} (zpbs-backup)`.
///
/// Control characters become spaces and the text is capped at
/// [`MAX_NOTES_LEN`] characters.
pub fn snapshot_notes(hostname: &str, source: &std::path::Path) -> String {
    let raw = format!("{}:{} (zpbs-backup)", hostname, source.display());
    raw.chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .take(MAX_NOTES_LEN)
        .collect::<String>()
        .trim()
        .to_string()
}

#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    pub dry_run: bool,
    pub force: bool,
    pub pattern: Option<String>,
    /// Evaluation time; the wall clock when unset.
    pub now: Option<DateTime<Utc>>,
}

/// Decisions of a backup run, computed before anything executes.
#[derive(Debug, Clone, Default)]
pub struct BackupPlan {
    /// Due volumes in execution order.
    pub jobs: Vec<ResolvedVolume>,
    pub not_due: Vec<ResolvedVolume>,
    /// Volumes whose namespace listing failed.
    pub unreachable: Vec<(ResolvedVolume, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded { snapshot: DateTime<Utc> },
    Failed { error: String },
    Skipped { reason: String },
    /// Would have run; dry-run only.
    Planned,
}

#[derive(Debug, Clone)]
pub struct VolumeResult {
    pub volume: String,
    pub backup_id: String,
    pub namespace: String,
    pub outcome: JobOutcome,
    pub duration: Duration,
}

impl VolumeResult {
    fn new(volume: &ResolvedVolume, outcome: JobOutcome, duration: Duration) -> Self {
        Self {
            volume: volume.name().to_string(),
            backup_id: volume.backup_id.clone(),
            namespace: volume.properties.namespace.clone(),
            outcome,
            duration,
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, JobOutcome::Succeeded { .. })
    }

    pub fn failed(&self) -> bool {
        matches!(self.outcome, JobOutcome::Failed { .. })
    }

    pub fn skipped(&self) -> bool {
        matches!(self.outcome, JobOutcome::Skipped { .. })
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub hostname: String,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub dry_run: bool,
    pub results: Vec<VolumeResult>,
}

impl RunSummary {
    pub fn successful(&self) -> usize {
        self.results.iter().filter(|r| r.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| r.failed()).count()
    }

    pub fn skipped(&self) -> usize {
        self.results.iter().filter(|r| r.skipped()).count()
    }

    pub fn planned(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.outcome == JobOutcome::Planned)
            .count()
    }

    pub fn duration(&self) -> Duration {
        (self.finished - self.started).to_std().unwrap_or_default()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    /// `PartialRun` when any volume failed.
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ZpbsError::PartialRun {
                failed: self.failed(),
                total: self.results.len(),
            })
        }
    }
}

pub struct BackupOrchestrator<'a> {
    store: &'a dyn PropertyStore,
    remote: &'a dyn RemoteRepository,
    hostname: String,
    options: BackupOptions,
}

impl<'a> BackupOrchestrator<'a> {
    pub fn new(
        store: &'a dyn PropertyStore,
        remote: &'a dyn RemoteRepository,
        hostname: impl Into<String>,
        options: BackupOptions,
    ) -> Self {
        Self {
            store,
            remote,
            hostname: hostname.into(),
            options,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.options.now.unwrap_or_else(Utc::now)
    }

    /// Resolve, filter, observe and order. Performs reads only.
    pub fn plan(&self) -> Result<BackupPlan> {
        let filter = VolumeFilter::parse(self.options.pattern.as_deref())?;
        let resolution = discover(self.store, &self.hostname)?;

        let mut enabled: Vec<ResolvedVolume> = resolution
            .volumes
            .into_iter()
            .filter(|v| v.properties.backup_enabled && filter.matches(v.name()))
            .collect();

        let mut failures = observe_backups(self.remote, &mut enabled, self.now(), self.options.force);

        let mut plan = BackupPlan::default();
        let mut candidates = Vec::new();
        for volume in enabled {
            if let Some(reason) = failures.remove(volume.name()) {
                plan.unreachable.push((volume, reason));
            } else if volume.due {
                candidates.push(volume);
            } else {
                plan.not_due.push(volume);
            }
        }
        plan.jobs = priority::order_due(candidates);

        info!(
            due = plan.jobs.len(),
            not_due = plan.not_due.len(),
            unreachable = plan.unreachable.len(),
            "backup plan ready"
        );
        Ok(plan)
    }

    fn execute(&self, volume: &ResolvedVolume) -> JobOutcome {
        if let Some(reason) = volume.volume.unavailable_reason() {
            info!(volume = volume.name(), reason, "skipping volume");
            return JobOutcome::Skipped {
                reason: reason.to_string(),
            };
        }
        let Some(source) = volume.volume.mountpoint.as_deref() else {
            return JobOutcome::Skipped {
                reason: "no mountpoint".to_string(),
            };
        };

        if self.options.dry_run {
            info!(
                volume = volume.name(),
                backup_id = %volume.backup_id,
                namespace = %volume.properties.namespace,
                priority = volume.properties.priority,
                "would back up"
            );
            return JobOutcome::Planned;
        }

        let namespace = &volume.properties.namespace;
        let result = self
            .remote
            .create_namespace(namespace)
            .and_then(|()| self.remote.create_backup(namespace, &volume.backup_id, source));

        match result {
            Ok(snapshot) => {
                info!(volume = volume.name(), %snapshot, "backup completed");
                let notes = snapshot_notes(&self.hostname, source);
                if let Err(e) =
                    self.remote
                        .set_snapshot_notes(namespace, &volume.backup_id, snapshot, &notes)
                {
                    warn!(volume = volume.name(), error = %e, "failed to set snapshot notes");
                }
                JobOutcome::Succeeded { snapshot }
            }
            Err(e) => {
                error!(volume = volume.name(), error = %e, "backup failed");
                JobOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    /// Run every due job in order and collect the results.
    pub fn run(&self) -> Result<RunSummary> {
        let started = Utc::now();
        let plan = self.plan()?;
        let mut results = Vec::new();

        for (volume, reason) in &plan.unreachable {
            results.push(VolumeResult::new(
                volume,
                JobOutcome::Failed {
                    error: reason.clone(),
                },
                Duration::ZERO,
            ));
        }

        for volume in &plan.jobs {
            let clock = Instant::now();
            let outcome = self.execute(volume);
            results.push(VolumeResult::new(volume, outcome, clock.elapsed()));
        }

        for volume in &plan.not_due {
            debug!(volume = volume.name(), "not due");
            results.push(VolumeResult::new(
                volume,
                JobOutcome::Skipped {
                    reason: "not due".to_string(),
                },
                Duration::ZERO,
            ));
        }

        let summary = RunSummary {
            hostname: self.hostname.clone(),
            started,
            finished: Utc::now(),
            dry_run: self.options.dry_run,
            results,
        };
        info!(
            successful = summary.successful(),
            failed = summary.failed(),
            skipped = summary.skipped(),
            planned = summary.planned(),
            "backup run finished"
        );
        Ok(summary)
    }
}

// ============================================================================
// Prune runs
// ============================================================================

#[derive(Debug, Clone)]
pub struct PruneResult {
    pub volume: String,
    pub backup_id: String,
    pub namespace: String,
    /// `None` when the volume has no backup group yet.
    pub decision: Option<RetentionDecision>,
    pub removed: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PruneSummary {
    pub dry_run: bool,
    pub results: Vec<PruneResult>,
}

impl PruneSummary {
    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| r.error.is_some()).count()
    }

    pub fn removed(&self) -> usize {
        self.results.iter().map(|r| r.removed).sum()
    }

    pub fn into_result(self) -> Result<Self> {
        match self.failed() {
            0 => Ok(self),
            failed => Err(ZpbsError::PartialRun {
                failed,
                total: self.results.len(),
            }),
        }
    }
}

pub struct PruneOrchestrator<'a> {
    store: &'a dyn PropertyStore,
    remote: &'a dyn RemoteRepository,
    hostname: String,
    dry_run: bool,
    pattern: Option<String>,
    now: Option<DateTime<Utc>>,
}

impl<'a> PruneOrchestrator<'a> {
    pub fn new(
        store: &'a dyn PropertyStore,
        remote: &'a dyn RemoteRepository,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            store,
            remote,
            hostname: hostname.into(),
            dry_run: false,
            pattern: None,
            now: None,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn pattern(mut self, pattern: Option<String>) -> Self {
        self.pattern = pattern;
        self
    }

    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    pub fn run(&self) -> Result<PruneSummary> {
        let filter = VolumeFilter::parse(self.pattern.as_deref())?;
        let resolution = discover(self.store, &self.hostname)?;
        let now = self.now.unwrap_or_else(Utc::now);

        let mut listings = BTreeMap::new();
        let mut summary = PruneSummary {
            dry_run: self.dry_run,
            results: Vec::new(),
        };

        for volume in resolution.enabled().filter(|v| filter.matches(v.name())) {
            let namespace = &volume.properties.namespace;
            let mut result = PruneResult {
                volume: volume.name().to_string(),
                backup_id: volume.backup_id.clone(),
                namespace: namespace.clone(),
                decision: None,
                removed: 0,
                error: None,
            };

            let listing = listings
                .entry(namespace.clone())
                .or_insert_with(|| self.remote.list_groups(Some(namespace)).map_err(|e| e.to_string()));
            let groups = match listing {
                Ok(groups) => groups,
                Err(reason) => {
                    result.error = Some(reason.clone());
                    summary.results.push(result);
                    continue;
                }
            };

            let Some(group) = groups.iter().find(|g| g.backup_id == volume.backup_id) else {
                debug!(volume = volume.name(), "no backups to prune");
                summary.results.push(result);
                continue;
            };

            let decision = retention::plan(&volume.properties.retention, &group.snapshots, now);
            info!(
                volume = volume.name(),
                policy = %volume.properties.retention,
                keep = decision.keep.len(),
                prune = decision.prune.len(),
                "retention planned"
            );

            if !self.dry_run && !decision.is_noop() {
                match self
                    .remote
                    .forget_snapshots(namespace, &volume.backup_id, &decision.prune)
                {
                    Ok(removed) => result.removed = removed,
                    Err(e) => {
                        error!(volume = volume.name(), error = %e, "prune failed");
                        result.error = Some(e.to_string());
                    }
                }
            }
            result.decision = Some(decision);
            summary.results.push(result);
        }

        Ok(summary)
    }
}

// ============================================================================
// Status and audit
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct StatusRow {
    pub volume: String,
    pub backup_enabled: bool,
    pub schedule: String,
    pub priority: u8,
    pub retention: String,
    pub namespace: Option<String>,
    pub last_backup: Option<DateTime<Utc>>,
    /// `2h ago`, `never`, `-` when disabled
    pub last_backup_display: String,
    pub backup_due: Option<bool>,
    /// `due`, `in 3d 4h`, `disabled`, `unknown`
    pub next_due: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One row per volume that is enabled or sits under an explicit override.
pub fn status_rows(
    store: &dyn PropertyStore,
    remote: &dyn RemoteRepository,
    hostname: &str,
    now: DateTime<Utc>,
) -> Result<Vec<StatusRow>> {
    let resolution = discover(store, hostname)?;
    let (mut enabled, disabled): (Vec<ResolvedVolume>, Vec<ResolvedVolume>) = resolution
        .volumes
        .into_iter()
        .filter(|v| v.properties.backup_enabled || v.configured)
        .partition(|v| v.properties.backup_enabled);
    let failures = observe_backups(remote, &mut enabled, now, false);

    let mut rows: Vec<StatusRow> = enabled
        .iter()
        .map(|v| {
            let error = failures.get(v.name()).cloned();
            let next_due = match (&error, v.due) {
                (Some(_), _) => "unknown".to_string(),
                (None, true) => "due".to_string(),
                (None, false) => format!(
                    "in {}",
                    format_time_delta(time_until_due(v.properties.schedule, v.last_backup, now))
                ),
            };
            StatusRow {
                volume: v.name().to_string(),
                backup_enabled: true,
                schedule: v.properties.schedule.to_string(),
                priority: v.properties.priority,
                retention: v.properties.retention.to_string(),
                namespace: Some(v.properties.namespace.clone()),
                last_backup: v.last_backup,
                last_backup_display: format_last_backup(v.last_backup, now),
                backup_due: error.is_none().then_some(v.due),
                next_due,
                error,
            }
        })
        .collect();

    rows.extend(disabled.iter().map(|v| StatusRow {
        volume: v.name().to_string(),
        backup_enabled: false,
        schedule: v.properties.schedule.to_string(),
        priority: v.properties.priority,
        retention: v.properties.retention.to_string(),
        namespace: None,
        last_backup: None,
        last_backup_display: "-".to_string(),
        backup_due: None,
        next_due: "disabled".to_string(),
        error: None,
    }));
    rows.sort_by(|a, b| a.volume.cmp(&b.volume));
    Ok(rows)
}

/// Compare enabled volumes against every remote group.
pub fn run_audit(
    store: &dyn PropertyStore,
    remote: &dyn RemoteRepository,
    hostname: &str,
) -> Result<AuditReport> {
    let resolution = discover(store, hostname)?;
    let groups = remote.list_all_groups()?;
    let report = audit(&resolution.volumes, &groups);
    for collision in &report.collisions {
        warn!(
            backup_id = %collision.backup_id,
            volumes = ?collision.volumes,
            "volumes share a backup id"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRepository;
    use crate::store::MemoryStore;
    use crate::types::PropertyKey;
    use crate::volume::Volume;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 15, 12, 0, 0).unwrap()
    }

    fn store() -> MemoryStore {
        MemoryStore::new()
            .with_volume("tank")
            .with_volume("tank/data")
            .with_volume("tank/scratch")
            .with(Volume::new("tank/vm"))
            .with_property("tank", PropertyKey::Backup, "true")
            .with_property("tank/scratch", PropertyKey::Backup, "false")
            .with_property("tank/data", PropertyKey::Priority, "10")
    }

    #[test]
    fn test_volume_filter() {
        let filter = VolumeFilter::parse(Some("tank/d*")).unwrap();
        assert!(filter.matches("tank/data"));
        assert!(!filter.matches("tank"));
        assert!(VolumeFilter::all().matches("anything"));
        assert!(VolumeFilter::parse(Some("[")).is_err());
    }

    #[test]
    fn test_plan_orders_due_jobs_and_skips_recent() {
        let store = store();
        let remote = MemoryRepository::new().with_group(
            "pve1/tank",
            "pve1-tank",
            &[now() - chrono::Duration::hours(2)],
        );
        let orchestrator = BackupOrchestrator::new(
            &store,
            &remote,
            "pve1",
            BackupOptions {
                now: Some(now()),
                ..BackupOptions::default()
            },
        );

        let plan = orchestrator.plan().unwrap();
        let jobs: Vec<&str> = plan.jobs.iter().map(|v| v.name()).collect();
        assert_eq!(jobs, vec!["tank/data", "tank/vm"]);
        assert_eq!(plan.not_due.len(), 1);
        assert_eq!(plan.not_due[0].name(), "tank");
    }

    #[test]
    fn test_run_records_skips_and_failures() {
        let store = store();
        let remote = MemoryRepository::new()
            .with_clock(now())
            .failing_backup("pve1-tank-data");
        let summary = BackupOrchestrator::new(
            &store,
            &remote,
            "pve1",
            BackupOptions {
                now: Some(now()),
                ..BackupOptions::default()
            },
        )
        .run()
        .unwrap();

        assert_eq!(summary.successful(), 1);
        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.skipped(), 1);
        let vm = summary.results.iter().find(|r| r.volume == "tank/vm").unwrap();
        assert_eq!(
            vm.outcome,
            JobOutcome::Skipped {
                reason: "no mountpoint".into()
            }
        );
        assert!(matches!(
            summary.into_result(),
            Err(ZpbsError::PartialRun { failed: 1, total: 3 })
        ));
    }

    #[test]
    fn test_failed_listing_only_fails_its_namespace() {
        let store = store().with_property("tank/data", PropertyKey::Namespace, "special");
        let remote = MemoryRepository::new()
            .with_clock(now())
            .failing_listing("special");
        let summary = BackupOrchestrator::new(
            &store,
            &remote,
            "pve1",
            BackupOptions {
                now: Some(now()),
                ..BackupOptions::default()
            },
        )
        .run()
        .unwrap();

        let data = summary.results.iter().find(|r| r.volume == "tank/data").unwrap();
        assert!(data.failed());
        let tank = summary.results.iter().find(|r| r.volume == "tank").unwrap();
        assert!(tank.succeeded());
    }

    #[test]
    fn test_snapshot_notes_text() {
        let path = std::path::Path::new("/tank/data");
        assert_eq!(snapshot_notes("pve1", path), "pve1:/tank/data (zpbs-backup)");

        let odd = std::path::Path::new("/tank/a\nb");
        assert_eq!(snapshot_notes("pve1", odd), "pve1:/tank/a b (zpbs-backup)");

        let long = "x".repeat(400);
        assert_eq!(
            snapshot_notes("pve1", std::path::Path::new(&long)).chars().count(),
            MAX_NOTES_LEN
        );
    }

    #[test]
    fn test_status_rows() {
        let store = store();
        let remote = MemoryRepository::new().with_group(
            "pve1/tank",
            "pve1-tank",
            &[now() - chrono::Duration::hours(2)],
        );
        let rows = status_rows(&store, &remote, "pve1", now()).unwrap();
        let names: Vec<&str> = rows.iter().map(|r| r.volume.as_str()).collect();
        assert_eq!(names, vec!["tank", "tank/data", "tank/scratch", "tank/vm"]);

        let tank = &rows[0];
        assert_eq!(tank.last_backup_display, "2h ago");
        assert_eq!(tank.next_due, "in 22h");
        assert_eq!(rows[1].next_due, "due");
        assert_eq!(rows[1].last_backup_display, "never");
        assert_eq!(rows[2].next_due, "disabled");
        assert_eq!(rows[2].namespace, None);
    }
}
