//! zpbs-backup - Main entry point
//!
//! Parses the command line, installs logging and signal handling, runs the
//! command and maps its error to the documented exit code.

use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use zpbs::cli::Cli;
use zpbs::commands;
use zpbs::config_file::ConfigLoader;
use zpbs::error::{EXIT_FAILURE, EXIT_OK, ZpbsError};
use zpbs::process_guard::{self, ProcessGuard};

/// Log to stderr, `RUST_LOG` overrides the default `info` level.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn exit_code(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<ZpbsError>())
        .map_or(EXIT_FAILURE, ZpbsError::exit_code)
}

fn main() {
    init_logging();

    if let Err(e) = process_guard::init_signal_handlers() {
        warn!("failed to install signal handlers: {}", e);
    }
    let guard = ProcessGuard::new();

    let cli = Cli::parse_args();
    debug!(command = ?cli.command, "starting");

    let code = match commands::execute(cli.command, &ConfigLoader::system()) {
        Ok(()) => EXIT_OK,
        Err(e) => {
            debug!(error = ?e, "command failed");
            eprintln!("Error: {:#}", e);
            exit_code(&e)
        }
    };

    drop(guard);
    std::process::exit(code);
}
