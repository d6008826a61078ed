//! Engine modules that compare local policy with remote state.
//!
//! Both are pure: they take resolved volumes and remote snapshot data and
//! return decisions. Executing those decisions is the orchestrator's job.

pub mod audit;
pub mod retention;
