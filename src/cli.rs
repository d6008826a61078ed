use clap::{Parser, Subcommand};

/// zpbs-backup - ZFS property-driven backups to Proxmox Backup Server
#[derive(Parser, Debug)]
#[command(name = "zpbs-backup")]
#[command(about = "Back up ZFS datasets to Proxmox Backup Server, configured by zpbs:* properties")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show backup status for every configured dataset
    Status {
        /// Also list backup groups that no enabled dataset owns
        #[arg(long)]
        orphans: bool,
        /// Machine-readable output
        #[arg(long)]
        json: bool,
    },
    /// Back up every due dataset in priority order
    Run {
        /// Compute and print the plan without running any backup
        #[arg(long)]
        dry_run: bool,
        /// Ignore schedules and back up every enabled dataset
        #[arg(long)]
        force: bool,
        /// Only datasets whose full name matches this glob
        #[arg(long, value_name = "GLOB")]
        dataset: Option<String>,
        /// Do not send a notification for this run
        #[arg(long)]
        no_notify: bool,
    },
    /// Compare enabled datasets with the backup groups on the server
    Audit {
        /// Machine-readable output
        #[arg(long)]
        json: bool,
    },
    /// Apply each dataset's retention policy to its snapshots
    Prune {
        /// Show what would be removed without removing it
        #[arg(long)]
        dry_run: bool,
        /// Only datasets whose full name matches this glob
        #[arg(long, value_name = "GLOB")]
        dataset: Option<String>,
    },
    /// Print a zpbs property of a dataset
    Get {
        /// Dataset name (e.g. tank/data)
        volume: String,
        /// Property key (with or without the zpbs: prefix) or `all`
        #[arg(default_value = "all")]
        key: String,
    },
    /// Set a zpbs property on a dataset
    Set {
        /// `key=value`, e.g. `schedule=weekly` or `zpbs:backup=true`
        assignment: String,
        /// Dataset name
        volume: String,
        /// With `backup=false`, clear every zpbs property instead
        #[arg(long)]
        clear: bool,
        /// Apply `--clear` to descendants as well
        #[arg(short, long)]
        recursive: bool,
    },
    /// Remove a local zpbs property so the dataset inherits it again
    Inherit {
        /// Apply to descendants as well
        #[arg(short, long)]
        recursive: bool,
        /// Property key or `all`
        key: String,
        /// Dataset name
        volume: String,
    },
    /// Show the repository configuration and check the connection
    ShowConfig {
        /// List every configuration source in priority order
        #[arg(short, long)]
        verbose: bool,
        /// Machine-readable output (no secrets)
        #[arg(long)]
        json: bool,
    },
    /// Send a sample notification to verify delivery
    SendTestNotification {
        /// Print the message without sending it
        #[arg(long)]
        show_only: bool,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
