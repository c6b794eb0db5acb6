//! In-memory table of known instances and their last-observed metrics.
//!
//! One entry per logical instance name; the [`Instance`] identity and its
//! [`RuntimeStatus`] are created and removed together. `update` is the only
//! write primitive: it runs the caller's mutator under the write lock, so a
//! read-modify-write can never interleave with a concurrent monitoring
//! write on the same key.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::Serialize;

use crate::types::{Instance, InstanceName, RuntimeStatus};

/// One registry entry: logical identity plus last-observed runtime metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceEntry {
    pub instance: Instance,
    pub status: RuntimeStatus,
}

/// Thread-safe map of the fleet, keyed by instance name.
#[derive(Default)]
pub struct InstanceRegistry {
    inner: RwLock<HashMap<InstanceName, InstanceEntry>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instance. Idempotent: re-registering an existing name
    /// refreshes the identity fields (directory, map, ports) without
    /// resetting the accumulated runtime stats.
    ///
    /// Returns `true` when the name was not previously registered.
    pub fn register(&self, instance: Instance) -> bool {
        let mut map = self.inner.write().expect("registry lock poisoned");
        match map.get_mut(&instance.name) {
            Some(entry) => {
                entry.instance = instance;
                false
            }
            None => {
                map.insert(
                    instance.name.clone(),
                    InstanceEntry {
                        instance,
                        status: RuntimeStatus::default(),
                    },
                );
                true
            }
        }
    }

    /// Remove an instance and its runtime status together.
    pub fn unregister(&self, name: &InstanceName) -> bool {
        self.inner
            .write()
            .expect("registry lock poisoned")
            .remove(name)
            .is_some()
    }

    /// Clone out a single entry.
    pub fn get(&self, name: &InstanceName) -> Option<InstanceEntry> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    /// Atomically mutate one entry. Returns `None` for unknown names,
    /// otherwise the mutator's return value.
    pub fn update<F, R>(&self, name: &InstanceName, mutator: F) -> Option<R>
    where
        F: FnOnce(&mut InstanceEntry) -> R,
    {
        let mut map = self.inner.write().expect("registry lock poisoned");
        map.get_mut(name).map(mutator)
    }

    /// Clone the whole fleet, sorted by name.
    pub fn snapshot_all(&self) -> Vec<InstanceEntry> {
        let map = self.inner.read().expect("registry lock poisoned");
        let mut entries: Vec<InstanceEntry> = map.values().cloned().collect();
        entries.sort_by(|a, b| a.instance.name.cmp(&b.instance.name));
        entries
    }

    /// All registered names, sorted.
    pub fn names(&self) -> Vec<InstanceName> {
        let map = self.inner.read().expect("registry lock poisoned");
        let mut names: Vec<InstanceName> = map.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
