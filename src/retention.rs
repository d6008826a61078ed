//! Retention policy grammar.
//!
//! A retention string is a comma-separated list of `<count><unit>` tokens,
//! e.g. `7d,4w,6m,1y`. Units are order-insensitive, each may appear at most
//! once, and every unit is optional as long as at least one is present.
//!
//! Parsing is the only place a policy can be rejected. The planner in
//! `engine::retention` assumes a policy that already went through here.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Largest count accepted for a single bucket.
pub const MAX_BUCKET_COUNT: u32 = 1000;

/// Seconds in one day, the base of every bucket period.
const DAY_SECS: i64 = 86_400;

/// A retention bucket.
///
/// Periods are fixed durations (a month is 30 days, a year 365 days),
/// matching the schedule evaluator's approximation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionUnit {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl RetentionUnit {
    /// Buckets in planning order, most specific first.
    pub const ALL: [RetentionUnit; 4] = [
        RetentionUnit::Daily,
        RetentionUnit::Weekly,
        RetentionUnit::Monthly,
        RetentionUnit::Yearly,
    ];

    /// Suffix used in the policy string.
    pub fn suffix(&self) -> char {
        match self {
            RetentionUnit::Daily => 'd',
            RetentionUnit::Weekly => 'w',
            RetentionUnit::Monthly => 'm',
            RetentionUnit::Yearly => 'y',
        }
    }

    /// Length of one slot of this bucket, in seconds.
    pub fn period_secs(&self) -> i64 {
        match self {
            RetentionUnit::Daily => DAY_SECS,
            RetentionUnit::Weekly => 7 * DAY_SECS,
            RetentionUnit::Monthly => 30 * DAY_SECS,
            RetentionUnit::Yearly => 365 * DAY_SECS,
        }
    }

    fn from_suffix(c: char) -> Option<Self> {
        match c.to_ascii_lowercase() {
            'd' => Some(RetentionUnit::Daily),
            'w' => Some(RetentionUnit::Weekly),
            'm' => Some(RetentionUnit::Monthly),
            'y' => Some(RetentionUnit::Yearly),
            _ => None,
        }
    }
}

impl fmt::Display for RetentionUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RetentionUnit::Daily => "daily",
            RetentionUnit::Weekly => "weekly",
            RetentionUnit::Monthly => "monthly",
            RetentionUnit::Yearly => "yearly",
        };
        f.write_str(name)
    }
}

/// Why a retention string was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetentionParseError {
    #[error("retention value cannot be empty")]
    Empty,

    #[error("invalid retention format '{0}', expected tokens like '7d', '4w', '6m' or '1y'")]
    InvalidToken(String),

    #[error("duplicate retention unit '{0}'")]
    DuplicateUnit(char),

    #[error("retention count seems too high: {0} (max {MAX_BUCKET_COUNT})")]
    CountTooHigh(String),
}

/// Parsed retention policy: an optional keep-count per bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub daily: Option<u32>,
    pub weekly: Option<u32>,
    pub monthly: Option<u32>,
    pub yearly: Option<u32>,
}

/// Policy applied when no volume in the ancestor chain sets one.
pub const DEFAULT_RETENTION: RetentionPolicy = RetentionPolicy {
    daily: Some(7),
    weekly: Some(4),
    monthly: Some(6),
    yearly: Some(1),
};

impl RetentionPolicy {
    /// Keep-count for a bucket, if the policy mentions it.
    pub fn count(&self, unit: RetentionUnit) -> Option<u32> {
        match unit {
            RetentionUnit::Daily => self.daily,
            RetentionUnit::Weekly => self.weekly,
            RetentionUnit::Monthly => self.monthly,
            RetentionUnit::Yearly => self.yearly,
        }
    }

    fn slot_mut(&mut self, unit: RetentionUnit) -> &mut Option<u32> {
        match unit {
            RetentionUnit::Daily => &mut self.daily,
            RetentionUnit::Weekly => &mut self.weekly,
            RetentionUnit::Monthly => &mut self.monthly,
            RetentionUnit::Yearly => &mut self.yearly,
        }
    }

    /// Return a copy with one bucket's count replaced.
    pub fn with_count(mut self, unit: RetentionUnit, count: u32) -> Self {
        *self.slot_mut(unit) = Some(count);
        self
    }

    /// Configured buckets in planning order.
    pub fn buckets(&self) -> impl Iterator<Item = (RetentionUnit, u32)> + '_ {
        RetentionUnit::ALL
            .into_iter()
            .filter_map(|unit| self.count(unit).map(|count| (unit, count)))
    }

    /// True if no bucket is configured.
    pub fn is_empty(&self) -> bool {
        self.buckets().next().is_none()
    }
}

impl FromStr for RetentionPolicy {
    type Err = RetentionParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.trim().is_empty() {
            return Err(RetentionParseError::Empty);
        }

        let mut policy = RetentionPolicy::default();

        for token in value.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let mut chars = token.chars();
            let unit = chars
                .next_back()
                .and_then(RetentionUnit::from_suffix)
                .ok_or_else(|| RetentionParseError::InvalidToken(token.to_string()))?;
            let digits = chars.as_str();
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(RetentionParseError::InvalidToken(token.to_string()));
            }

            let count: u32 = digits
                .parse()
                .map_err(|_| RetentionParseError::CountTooHigh(token.to_string()))?;
            if count > MAX_BUCKET_COUNT {
                return Err(RetentionParseError::CountTooHigh(token.to_string()));
            }

            let slot = policy.slot_mut(unit);
            if slot.is_some() {
                return Err(RetentionParseError::DuplicateUnit(unit.suffix()));
            }
            *slot = Some(count);
        }

        if policy.is_empty() {
            return Err(RetentionParseError::Empty);
        }
        Ok(policy)
    }
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .buckets()
            .map(|(unit, count)| format!("{}{}", count, unit.suffix()))
            .collect();
        f.write_str(&parts.join(","))
    }
}
