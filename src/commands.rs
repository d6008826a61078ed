//! Command handlers behind the CLI.
//!
//! Handlers wire configuration, the ZFS store and the PBS repository into the
//! orchestrators and print results. Rendering lives in plain functions that
//! return strings.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::cli::Commands;
use crate::config_file::{ConfigLoader, ConfigSource, Settings, SourceStatus, mask_secret};
use crate::engine::audit::AuditReport;
use crate::error::ZpbsError;
use crate::logic::resolver::validate_property_value;
use crate::notify::{CommandNotifier, Notifier, format_body, format_subject, sample_summary};
use crate::orchestrator::{
    BackupOptions, BackupOrchestrator, JobOutcome, PruneOrchestrator, PruneSummary, RunSummary,
    StatusRow, run_audit, status_rows,
};
use crate::remote::{PbsRepository, RemoteRepository};
use crate::store::{PropertyStore, ZfsStore};
use crate::types::PropertyKey;
use crate::volume::RawProperty;

/// Everything a handler needs.
pub struct App {
    settings: Settings,
    store: ZfsStore,
}

impl App {
    pub fn load(loader: &ConfigLoader) -> Self {
        let settings = loader.load();
        debug!(hostname = %settings.hostname, "configuration loaded");
        let store = ZfsStore::new(settings.query_timeout);
        Self { settings, store }
    }

    fn remote(&self, dry_run: bool) -> Result<PbsRepository> {
        let pbs = self.settings.pbs()?;
        Ok(PbsRepository::new(
            pbs.credentials(),
            self.settings.query_timeout,
            self.settings.backup_timeout,
        )
        .dry_run(dry_run))
    }

    /// Remote repository after a successful connection check.
    fn connected_remote(&self, dry_run: bool) -> Result<PbsRepository> {
        let remote = self.remote(dry_run)?;
        remote
            .check_connection()
            .context("cannot reach Proxmox Backup Server")?;
        Ok(remote)
    }
}

pub fn execute(command: Commands, loader: &ConfigLoader) -> Result<()> {
    let app = App::load(loader);

    match command {
        Commands::Status { orphans, json } => status(&app, orphans, json),
        Commands::Run {
            dry_run,
            force,
            dataset,
            no_notify,
        } => run(&app, dry_run, force, dataset, no_notify),
        Commands::Audit { json } => audit(&app, json),
        Commands::Prune { dry_run, dataset } => prune(&app, dry_run, dataset),
        Commands::Get { volume, key } => get(&app.store, &volume, &key),
        Commands::Set {
            assignment,
            volume,
            clear,
            recursive,
        } => set(&app.store, &assignment, &volume, clear, recursive),
        Commands::Inherit {
            recursive,
            key,
            volume,
        } => inherit(&app.store, &key, &volume, recursive),
        Commands::ShowConfig { verbose, json } => show_config(&app, verbose, json),
        Commands::SendTestNotification { show_only } => send_test_notification(&app, show_only),
    }
}

// ============================================================================
// Remote commands
// ============================================================================

fn status(app: &App, orphans: bool, json_output: bool) -> Result<()> {
    let remote = app.connected_remote(false)?;
    let rows = status_rows(&app.store, &remote, &app.settings.hostname, Utc::now())?;
    let report = if orphans {
        Some(run_audit(&app.store, &remote, &app.settings.hostname)?)
    } else {
        None
    };

    if json_output {
        let mut doc = json!({ "volumes": rows });
        if let Some(report) = &report {
            doc["orphans"] = serde_json::to_value(&report.orphaned)?;
        }
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    print!("{}", render_status_table(&rows));
    if let Some(report) = &report {
        println!();
        print!("{}", render_orphans(report));
    }
    Ok(())
}

fn run(
    app: &App,
    dry_run: bool,
    force: bool,
    dataset: Option<String>,
    no_notify: bool,
) -> Result<()> {
    let remote = if dry_run {
        app.remote(true)?
    } else {
        app.connected_remote(false)?
    };

    let orchestrator = BackupOrchestrator::new(
        &app.store,
        &remote,
        app.settings.hostname.clone(),
        BackupOptions {
            dry_run,
            force,
            pattern: dataset,
            now: None,
        },
    );
    let summary = orchestrator.run()?;
    print!("{}", render_run_summary(&summary));

    if !no_notify && !dry_run {
        let notifier = CommandNotifier::new(app.settings.notification.clone());
        if let Err(e) = notifier.notify(&summary) {
            warn!(error = %e, "notification failed");
        }
    }

    summary.into_result()?;
    Ok(())
}

fn audit(app: &App, json_output: bool) -> Result<()> {
    let remote = app.connected_remote(false)?;
    let report = run_audit(&app.store, &remote, &app.settings.hostname)?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", render_audit(&report));
    }
    Ok(())
}

fn prune(app: &App, dry_run: bool, dataset: Option<String>) -> Result<()> {
    let remote = app.remote(dry_run)?;
    let summary = PruneOrchestrator::new(&app.store, &remote, app.settings.hostname.clone())
        .dry_run(dry_run)
        .pattern(dataset)
        .run()?;

    print!("{}", render_prune_summary(&summary));
    summary.into_result()?;
    Ok(())
}

// ============================================================================
// Property commands
// ============================================================================

fn parse_key(key: &str) -> Result<PropertyKey> {
    PropertyKey::parse(key).ok_or_else(|| {
        ZpbsError::validation(format!(
            "unknown property '{}' (expected one of: backup, schedule, retention, namespace, priority)",
            key
        ))
        .into()
    })
}

fn get(store: &dyn PropertyStore, volume: &str, key: &str) -> Result<()> {
    if key == "all" {
        let props = store
            .get_all(volume)
            .with_context(|| format!("failed to read properties of {}", volume))?;
        print!("{}", render_properties(&props));
    } else {
        let key = parse_key(key)?;
        let raw = store.get(volume, key)?;
        println!("{}\t{}", raw.value, raw.source);
    }
    Ok(())
}

fn set(
    store: &dyn PropertyStore,
    assignment: &str,
    volume: &str,
    clear: bool,
    recursive: bool,
) -> Result<()> {
    let Some((key, value)) = assignment.split_once('=') else {
        bail!(ZpbsError::validation(
            "property must be given as key=value"
        ));
    };
    let key = parse_key(key.trim())?;
    let value = value.trim();
    validate_property_value(key, value)
        .map_err(|reason| ZpbsError::validation(format!("{}={}: {}", key, value, reason)))?;

    if clear && key == PropertyKey::Backup && value == "false" {
        store.clear_all(volume, recursive)?;
        info!(volume, recursive, "cleared all properties");
        println!("Cleared all zpbs properties on {}", volume);
    } else {
        store.set(volume, key, value)?;
        info!(volume, property = %key.qualified(), value, "property set");
        println!("Set {}={} on {}", key.qualified(), value, volume);
    }
    Ok(())
}

fn inherit(store: &dyn PropertyStore, key: &str, volume: &str, recursive: bool) -> Result<()> {
    if key == "all" {
        store.clear_all(volume, recursive)?;
        println!("Cleared all zpbs properties on {}", volume);
    } else {
        let key = parse_key(key)?;
        store.clear(volume, key, recursive)?;
        println!("Cleared {} on {}", key.qualified(), volume);
    }
    Ok(())
}

// ============================================================================
// Configuration and notifications
// ============================================================================

fn show_config(app: &App, verbose: bool, json_output: bool) -> Result<()> {
    let pbs = match app.settings.pbs() {
        Ok(pbs) => pbs,
        Err(e) => {
            if json_output {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "error": e.to_string(),
                        "connected": false,
                    }))?
                );
            }
            return Err(e.into());
        }
    };
    let parts = pbs.parts();
    let connection = app.remote(false)?.check_connection();

    if json_output {
        let mut doc = json!({
            "server": parts.server,
            "user": parts.user,
            "api_token_name": parts.token_name,
            "datastore": parts.datastore,
            "fingerprint": pbs.fingerprint,
            "repository": pbs.repository,
            "active_source": pbs.active_source,
            "connected": connection.is_ok(),
        });
        if let Err(e) = &connection {
            doc["error"] = json!(e.to_string());
        }
        println!("{}", serde_json::to_string_pretty(&doc)?);
    } else {
        let unknown = || "(unknown)".to_string();
        println!("PBS connection:");
        println!("  Source:           {}", pbs.active_source);
        println!("  Server:           {}", parts.server.unwrap_or_else(unknown));
        println!("  User:             {}", parts.user.unwrap_or_else(unknown));
        println!("  API token name:   {}", parts.token_name.unwrap_or_else(unknown));
        println!("  Datastore:        {}", parts.datastore.unwrap_or_else(unknown));
        println!("  Token secret:     {}", mask_secret(pbs.password.as_deref()));
        println!(
            "  Fingerprint:      {}",
            pbs.fingerprint.as_deref().unwrap_or("(not set)")
        );
        println!("  Hostname:         {}", app.settings.hostname);
        if verbose {
            println!();
            print!("{}", render_sources(&app.settings.sources));
        }
        println!();
        println!("Effective PBS_REPOSITORY: {}", pbs.repository);
        println!(
            "Connection:               {}",
            if connection.is_ok() { "OK" } else { "FAILED" }
        );
    }

    connection.context("connection check failed")?;
    Ok(())
}

fn send_test_notification(app: &App, show_only: bool) -> Result<()> {
    let summary = sample_summary(&app.settings.hostname, Utc::now());
    // Sample numbers must never reach the metrics gateway
    let mut config = app.settings.notification.clone();
    config.metrics.pushgateway = None;

    println!("Subject: {}", format_subject(&summary));
    println!();
    println!("{}", format_body(&summary));
    println!();
    println!("Notifications enabled: {}", config.enabled);
    println!("Syslog:                {}", config.syslog);
    match (&config.script, &config.recipient) {
        (Some(script), _) => println!("Delivery:              script {}", script.display()),
        (None, Some(recipient)) => println!("Delivery:              mail to {}", recipient),
        (None, None) => println!("Delivery:              none configured"),
    }
    if let Some(gateway) = &app.settings.notification.metrics.pushgateway {
        println!("Pushgateway:           {} (not pushed for test notifications)", gateway);
    }

    if show_only {
        return Ok(());
    }
    CommandNotifier::new(config)
        .notify(&summary)
        .context("failed to send test notification")?;
    println!("Test notification sent.");
    Ok(())
}

// ============================================================================
// Rendering
// ============================================================================

pub fn render_status_table(rows: &[StatusRow]) -> String {
    if rows.is_empty() {
        return "No datasets with zpbs properties found.\n\n\
                To enable backup for a dataset:\n  zpbs-backup set backup=true <dataset>\n"
            .to_string();
    }

    let width = rows.iter().map(|r| r.volume.len()).max().unwrap_or(0).max(7);
    let mut out = format!(
        "{:<width$}  BACKUP  SCHEDULE  PRIORITY  RETENTION      LAST BACKUP     STATUS\n",
        "DATASET",
        width = width
    );
    out.push_str(&"-".repeat(width + 75));
    out.push('\n');

    for row in rows {
        let (backup, schedule, priority, retention) = if row.backup_enabled {
            (
                "yes",
                row.schedule.as_str(),
                row.priority.to_string(),
                row.retention.as_str(),
            )
        } else {
            ("no", "-", "-".to_string(), "-")
        };
        out.push_str(&format!(
            "{:<width$}  {:<6}  {:<8}  {:<8}  {:<13}  {:<14}  {}\n",
            row.volume,
            backup,
            schedule,
            priority,
            retention,
            row.last_backup_display,
            row.next_due,
            width = width
        ));
    }
    out
}

pub fn render_orphans(report: &AuditReport) -> String {
    if report.orphaned.is_empty() {
        return "No orphaned backup groups found.\n".to_string();
    }
    let mut out = format!("Found {} orphaned backup group(s):\n", report.orphaned.len());
    for group in &report.orphaned {
        let last = group
            .last_backup
            .map(|t| t.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "unknown".to_string());
        out.push_str(&format!(
            "  - {} ({} snapshots, last: {})\n",
            group.label(),
            group.snapshot_count,
            last
        ));
    }
    out
}

pub fn render_audit(report: &AuditReport) -> String {
    let total = report.matched_volumes.len() + report.never_backed_up.len();
    let mut out = format!("Audited {} enabled dataset(s).\n\n", total);

    if report.never_backed_up.is_empty() {
        out.push_str("All enabled datasets have been backed up at least once.\n");
    } else {
        out.push_str("Datasets never backed up:\n");
        for missing in &report.never_backed_up {
            out.push_str(&format!(
                "  - {} (id {}, ns {})\n",
                missing.volume, missing.backup_id, missing.namespace
            ));
        }
    }
    out.push('\n');

    out.push_str(&render_orphans(report));
    if !report.orphaned.is_empty() {
        out.push_str("To remove orphaned groups, use proxmox-backup-client directly.\n");
    }

    if !report.collisions.is_empty() {
        out.push_str("\nDatasets sharing a backup id:\n");
        for collision in &report.collisions {
            out.push_str(&format!(
                "  - {}: {}\n",
                collision.backup_id,
                collision.volumes.join(", ")
            ));
        }
    }
    out
}

pub fn render_run_summary(summary: &RunSummary) -> String {
    let mut out = String::new();
    for result in &summary.results {
        let line = match &result.outcome {
            JobOutcome::Planned => format!(
                "would back up {} as {} (ns {})",
                result.volume, result.backup_id, result.namespace
            ),
            JobOutcome::Succeeded { snapshot } => format!(
                "backed up {} ({:.1}s, snapshot {})",
                result.volume,
                result.duration.as_secs_f64(),
                snapshot.format("%Y-%m-%dT%H:%M:%SZ")
            ),
            JobOutcome::Failed { error } => format!("FAILED {}: {}", result.volume, error),
            JobOutcome::Skipped { reason } => format!("skipped {}: {}", result.volume, reason),
        };
        out.push_str(&line);
        out.push('\n');
    }

    if summary.dry_run {
        out.push_str(&format!(
            "\nDry run: {} backup(s) planned, {} skipped, {} failed\n",
            summary.planned(),
            summary.skipped(),
            summary.failed()
        ));
    } else {
        out.push_str(&format!(
            "\n{} successful, {} failed, {} skipped in {:.1}s\n",
            summary.successful(),
            summary.failed(),
            summary.skipped(),
            summary.duration().as_secs_f64()
        ));
    }
    out
}

pub fn render_prune_summary(summary: &PruneSummary) -> String {
    let mut out = String::new();
    for result in &summary.results {
        if let Some(error) = &result.error {
            out.push_str(&format!("FAILED {}: {}\n", result.volume, error));
            continue;
        }
        let Some(decision) = &result.decision else {
            out.push_str(&format!("{}: no backups\n", result.volume));
            continue;
        };
        if summary.dry_run {
            out.push_str(&format!(
                "{}: would keep {}, would prune {}\n",
                result.volume,
                decision.keep.len(),
                decision.prune.len()
            ));
            for time in &decision.prune {
                out.push_str(&format!("  - {}\n", time.format("%Y-%m-%dT%H:%M:%SZ")));
            }
        } else {
            out.push_str(&format!(
                "{}: kept {}, pruned {}\n",
                result.volume,
                decision.keep.len(),
                result.removed
            ));
        }
    }
    out
}

pub fn render_properties(props: &std::collections::BTreeMap<PropertyKey, RawProperty>) -> String {
    let mut out = format!("{:<16}  {:<15}  SOURCE\n", "PROPERTY", "VALUE");
    out.push_str(&"-".repeat(60));
    out.push('\n');
    for (key, raw) in props {
        out.push_str(&format!(
            "{:<16}  {:<15}  {}\n",
            key.qualified(),
            raw.value,
            raw.source
        ));
    }
    out
}

pub fn render_sources(sources: &[ConfigSource]) -> String {
    let mut out = String::from("Configuration sources (highest priority first):\n");
    for (i, source) in sources.iter().rev().enumerate() {
        let marker = if source.status == SourceStatus::Active {
            "  [active]"
        } else {
            ""
        };
        out.push_str(&format!(
            "  {}. {}: {}{}\n",
            i + 1,
            source.name,
            source.status,
            marker
        ));
        for (key, value) in &source.variables {
            let shown = if key.contains("PASSWORD") || key.contains("SECRET") {
                mask_secret(Some(value))
            } else {
                value.clone()
            };
            out.push_str(&format!("     {}={}\n", key, shown));
        }
    }
    out
}
