//! In-memory property store.
//!
//! Holds local values only and derives `inherited from X` sources on read,
//! the way ZFS reports them. Counts every mutation so callers can assert
//! that a dry run wrote nothing.

use crate::error::{Result, ZpbsError};
use crate::store::PropertyStore;
use crate::types::PropertyKey;
use crate::volume::{PropertySource, RawProperty, Volume, VolumeRecord};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct MemoryStore {
    volumes: RefCell<BTreeMap<String, Volume>>,
    local: RefCell<BTreeMap<String, BTreeMap<PropertyKey, String>>>,
    mutations: Cell<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a volume mounted at `/<name>`.
    pub fn with_volume(self, name: &str) -> Self {
        self.with(Volume::new(name).with_mountpoint(format!("/{}", name)))
    }

    pub fn with(self, volume: Volume) -> Self {
        self.volumes.borrow_mut().insert(volume.name.clone(), volume);
        self
    }

    /// Seed a local value without counting it as a mutation.
    pub fn with_property(self, volume: &str, key: PropertyKey, value: &str) -> Self {
        self.local
            .borrow_mut()
            .entry(volume.to_string())
            .or_default()
            .insert(key, value.to_string());
        self
    }

    pub fn mutation_count(&self) -> usize {
        self.mutations.get()
    }

    fn ensure_exists(&self, volume: &str) -> Result<()> {
        if self.volumes.borrow().contains_key(volume) {
            Ok(())
        } else {
            Err(ZpbsError::general(format!(
                "volume '{}' does not exist",
                volume
            )))
        }
    }

    fn record(&self, volume: &Volume) -> VolumeRecord {
        let local = self.local.borrow();
        let mut record = VolumeRecord::new(volume.clone());

        for key in PropertyKey::all() {
            let own = local.get(&volume.name).and_then(|m| m.get(&key));
            let raw = match own {
                Some(value) => RawProperty::local(value.clone()),
                None => {
                    let inherited = std::iter::successors(volume.parent_name(), |n| {
                        n.rsplit_once('/').map(|(p, _)| p)
                    })
                    .find_map(|ancestor| {
                        local
                            .get(ancestor)
                            .and_then(|m| m.get(&key))
                            .map(|v| (ancestor, v))
                    });
                    match inherited {
                        Some((ancestor, value)) => RawProperty {
                            value: value.clone(),
                            source: PropertySource::Inherited(ancestor.to_string()),
                        },
                        None => RawProperty::unset(),
                    }
                }
            };
            record.properties.insert(key, raw);
        }
        record
    }
}

fn in_subtree(name: &str, root: &str) -> bool {
    name == root
        || name
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/'))
}

impl PropertyStore for MemoryStore {
    fn list_volumes(&self) -> Result<Vec<VolumeRecord>> {
        Ok(self
            .volumes
            .borrow()
            .values()
            .map(|v| self.record(v))
            .collect())
    }

    fn get_volume(&self, volume: &str) -> Result<VolumeRecord> {
        self.ensure_exists(volume)?;
        let volumes = self.volumes.borrow();
        volumes
            .get(volume)
            .map(|v| self.record(v))
            .ok_or_else(|| ZpbsError::general(format!("volume '{}' does not exist", volume)))
    }

    fn set(&self, volume: &str, key: PropertyKey, value: &str) -> Result<()> {
        self.ensure_exists(volume)?;
        self.mutations.set(self.mutations.get() + 1);
        self.local
            .borrow_mut()
            .entry(volume.to_string())
            .or_default()
            .insert(key, value.to_string());
        Ok(())
    }

    fn clear(&self, volume: &str, key: PropertyKey, recursive: bool) -> Result<()> {
        self.ensure_exists(volume)?;
        self.mutations.set(self.mutations.get() + 1);
        for (name, values) in self.local.borrow_mut().iter_mut() {
            if name == volume || (recursive && in_subtree(name, volume)) {
                values.remove(&key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::new()
            .with_volume("tank")
            .with_volume("tank/data")
            .with_volume("tank/data/db")
            .with_volume("tank/database")
            .with_property("tank", PropertyKey::Backup, "true")
            .with_property("tank/data", PropertyKey::Priority, "10")
            .with_property("tank/data/db", PropertyKey::Priority, "5")
            .with_property("tank/database", PropertyKey::Priority, "7")
    }

    #[test]
    fn test_inherited_sources_are_derived() {
        let store = store();
        let raw = store.get("tank/data/db", PropertyKey::Backup).unwrap();
        assert_eq!(raw.value, "true");
        assert_eq!(raw.source, PropertySource::Inherited("tank".into()));

        let unset = store.get("tank", PropertyKey::Schedule).unwrap();
        assert!(!unset.is_set());
        assert_eq!(store.get_all("tank").unwrap().len(), 5);
    }

    #[test]
    fn test_set_and_clear_count_mutations() {
        let store = store();
        store.set("tank/data", PropertyKey::Schedule, "weekly").unwrap();
        assert_eq!(
            store.get("tank/data", PropertyKey::Schedule).unwrap(),
            RawProperty::local("weekly")
        );

        store.clear("tank/data", PropertyKey::Schedule, false).unwrap();
        assert!(!store.get("tank/data", PropertyKey::Schedule).unwrap().is_set());
        assert_eq!(store.mutation_count(), 2);
    }

    #[test]
    fn test_recursive_clear_stays_in_subtree() {
        let store = store();
        store.clear("tank/data", PropertyKey::Priority, true).unwrap();

        assert!(!store.get("tank/data/db", PropertyKey::Priority).unwrap().is_local());
        assert_eq!(
            store.get("tank/database", PropertyKey::Priority).unwrap(),
            RawProperty::local("7")
        );
    }

    #[test]
    fn test_unknown_volume_is_an_error() {
        let store = store();
        assert!(store.get_volume("rpool").is_err());
        assert!(store.set("rpool", PropertyKey::Backup, "true").is_err());
        assert_eq!(store.mutation_count(), 0);
    }
}
