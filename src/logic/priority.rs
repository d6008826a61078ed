//! Priority ordering of due volumes.
//!
//! Order is `priority` ascending, then volume path ascending. The path
//! tie-break makes the sequence total, so repeated runs over the same input
//! produce the same job list.

use crate::logic::resolver::ResolvedVolume;
use std::cmp::Ordering;

/// Comparison used for execution order.
pub fn execution_order(a: &ResolvedVolume, b: &ResolvedVolume) -> Ordering {
    a.properties
        .priority
        .cmp(&b.properties.priority)
        .then_with(|| a.volume.name.cmp(&b.volume.name))
}

/// Sort volumes into execution order.
pub fn order_jobs(mut volumes: Vec<ResolvedVolume>) -> Vec<ResolvedVolume> {
    volumes.sort_by(execution_order);
    volumes
}

/// Keep the due volumes and sort them into execution order.
pub fn order_due(volumes: impl IntoIterator<Item = ResolvedVolume>) -> Vec<ResolvedVolume> {
    order_jobs(volumes.into_iter().filter(|v| v.due).collect())
}
