//! zpbs-backup library
//!
//! Property-driven backup engine for ZFS volumes and Proxmox Backup Server:
//! property resolution over the volume tree, schedule evaluation, priority
//! ordering, retention planning and auditing, plus the adapters and
//! orchestration that drive them.

pub mod cli;
pub mod commands;
pub mod config_file;
pub mod engine;
pub mod error;
pub mod logic;
pub mod metrics;
pub mod notify;
pub mod orchestrator;
pub mod process_guard;
pub mod remote;
pub mod retention;
pub mod store;
pub mod tool_args;
pub mod tool_runner;
pub mod tools;
pub mod types;
pub mod volume;

// Re-export main types for convenience
pub use config_file::{ConfigLoader, PbsConfig, Settings};
pub use engine::audit::{AuditReport, audit};
pub use engine::retention::{RetentionDecision, plan as plan_retention};
pub use error::{Result, ZpbsError};
pub use logic::priority::order_due;
pub use logic::resolver::{PropertySet, Resolution, ResolvedVolume, resolve};
pub use logic::schedule::is_due;
pub use orchestrator::{BackupOrchestrator, PruneOrchestrator, RunSummary};
pub use process_guard::{ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use remote::{BackupGroup, MemoryRepository, PbsRepository, RemoteRepository};
pub use retention::RetentionPolicy;
pub use store::{MemoryStore, PropertyStore, ZfsStore};
pub use tool_args::ToolArgs;
pub use tool_runner::{ToolOutput, run_tool_safe};
pub use types::{PropertyKey, Schedule, Setting};
pub use volume::{Volume, VolumeRecord, VolumeTree};
