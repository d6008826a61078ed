//! Property store: key-value properties attached to volumes.
//!
//! The engine reads volume records through [`PropertyStore`] and feeds only
//! the locally set values to the resolver. Mutations (`set`, `clear`) are
//! used by the CLI, never by backup or prune runs.

pub mod memory;
pub mod zfs;

use crate::error::Result;
use crate::types::PropertyKey;
use crate::volume::{RawProperty, VolumeRecord};
use std::collections::BTreeMap;

pub use memory::MemoryStore;
pub use zfs::ZfsStore;

pub trait PropertyStore {
    /// Every volume with its mount facts and raw properties.
    fn list_volumes(&self) -> Result<Vec<VolumeRecord>>;

    /// One volume. Errors if it does not exist.
    fn get_volume(&self, volume: &str) -> Result<VolumeRecord>;

    /// Raw value of one key, `-` when unset.
    fn get(&self, volume: &str, key: PropertyKey) -> Result<RawProperty> {
        Ok(self
            .get_volume(volume)?
            .properties
            .remove(&key)
            .unwrap_or_else(RawProperty::unset))
    }

    /// Raw values of every key.
    fn get_all(&self, volume: &str) -> Result<BTreeMap<PropertyKey, RawProperty>> {
        let record = self.get_volume(volume)?;
        Ok(PropertyKey::all()
            .into_iter()
            .map(|key| {
                let raw = record.get(key).cloned().unwrap_or_else(RawProperty::unset);
                (key, raw)
            })
            .collect())
    }

    /// Set a value locally on `volume`. Callers validate first.
    fn set(&self, volume: &str, key: PropertyKey, value: &str) -> Result<()>;

    /// Remove the local value so the volume inherits again, optionally on
    /// every descendant too.
    fn clear(&self, volume: &str, key: PropertyKey, recursive: bool) -> Result<()>;

    fn clear_all(&self, volume: &str, recursive: bool) -> Result<()> {
        for key in PropertyKey::all() {
            self.clear(volume, key, recursive)?;
        }
        Ok(())
    }
}
