//! Pure policy logic: what each volume's effective settings are, whether it
//! is due, and in which order due volumes run.
//!
//! # Modules
//!
//! - `resolver`: property inheritance over the volume tree
//! - `schedule`: due-ness from schedule and last backup time
//! - `priority`: execution order of due volumes

pub mod priority;
pub mod resolver;
pub mod schedule;
