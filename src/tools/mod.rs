//! Typed argument structs for every external tool zpbs-backup invokes.
//!
//! - `zfs`: property queries and mutations
//! - `pbs`: `proxmox-backup-client` listings, backups and snapshot removal
//! - `notify`: `logger`, `sendmail`, `mail` and external notification scripts

pub mod notify;
pub mod pbs;
pub mod zfs;
