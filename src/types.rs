//! Type-safe property types for zpbs-backup
//!
//! ZFS user properties arrive as strings. This module gives them proper Rust
//! enums so that the rest of the engine matches exhaustively instead of
//! comparing strings.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

/// Namespace prefix for every property this tool owns.
pub const PROPERTY_PREFIX: &str = "zpbs:";

/// Backup schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Schedule {
    #[default]
    Daily,
    Weekly,
    Monthly,
}

/// The keys of the per-volume schema.
///
/// Ordering is the display order used by `get all` and `inherit all`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PropertyKey {
    Backup,
    Schedule,
    Retention,
    Namespace,
    Priority,
}

impl PropertyKey {
    /// Parse a key given with or without the `zpbs:` prefix.
    ///
    /// `zpbs:backup`, `backup` and `BACKUP` all name the same key.
    pub fn parse(name: &str) -> Option<Self> {
        let trimmed = name.trim();
        let bare = trimmed
            .get(..PROPERTY_PREFIX.len())
            .filter(|head| head.eq_ignore_ascii_case(PROPERTY_PREFIX))
            .map_or(trimmed, |_| &trimmed[PROPERTY_PREFIX.len()..]);
        bare.to_ascii_lowercase().parse().ok()
    }

    /// Fully qualified ZFS property name, e.g. `zpbs:backup`.
    pub fn qualified(&self) -> String {
        format!("{}{}", PROPERTY_PREFIX, self)
    }

    /// All keys in display order.
    pub fn all() -> Vec<PropertyKey> {
        PropertyKey::iter().collect()
    }
}

/// A locally configured value for one key on one volume.
///
/// Keeps "explicitly false" distinguishable from "not set here, inherit".
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Setting<T> {
    Explicit(T),
    #[default]
    Inherit,
}

impl<T> Setting<T> {
    /// The explicit value, if any.
    pub fn explicit(&self) -> Option<&T> {
        match self {
            Setting::Explicit(value) => Some(value),
            Setting::Inherit => None,
        }
    }

    /// Use the explicit value or fall back to the inherited one.
    pub fn or_inherit(self, inherited: T) -> T {
        match self {
            Setting::Explicit(value) => value,
            Setting::Inherit => inherited,
        }
    }
}

impl<T> From<Option<T>> for Setting<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Setting::Inherit, Setting::Explicit)
    }
}
