//! Snapshot-based change tracking.
//!
//! A snapshot is the list of an entity's field values captured when it was
//! loaded, in metadata field order. Dirty detection compares the current
//! values against it position by position.

use crate::key::EntityKey;
use rowmap_core::Value;
use std::collections::HashMap;

/// Snapshots of every entity in a session.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    snapshots: HashMap<EntityKey, Vec<Value>>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self {
            snapshots: HashMap::new(),
        }
    }

    /// Record the values of `key`, replacing any earlier snapshot.
    #[tracing::instrument(level = "trace", skip(self, key, values), fields(key = %key))]
    pub fn snapshot(&mut self, key: EntityKey, values: Vec<Value>) {
        tracing::trace!(fields = values.len(), "Taking entity snapshot");
        self.snapshots.insert(key, values);
    }

    /// Positions whose current value differs from the snapshot.
    ///
    /// Without a snapshot every position is changed. A position missing from
    /// the snapshot is changed too.
    pub fn changed_positions(&self, key: &EntityKey, current: &[Value]) -> Vec<usize> {
        let Some(snapshot) = self.snapshots.get(key) else {
            tracing::trace!(key = %key, "No snapshot - all fields considered changed");
            return (0..current.len()).collect();
        };

        let changed: Vec<usize> = current
            .iter()
            .enumerate()
            .filter(|(i, value)| {
                snapshot
                    .get(*i)
                    .is_none_or(|original| !original.key_eq(value))
            })
            .map(|(i, _)| i)
            .collect();

        tracing::trace!(key = %key, changed = ?changed, "Dirty check result");
        changed
    }

    /// Has `key` changed since its snapshot?
    pub fn is_dirty(&self, key: &EntityKey, current: &[Value]) -> bool {
        !self.changed_positions(key, current).is_empty()
    }

    pub fn has_snapshot(&self, key: &EntityKey) -> bool {
        self.snapshots.contains_key(key)
    }

    /// Drop the snapshot for one entity.
    pub fn clear(&mut self, key: &EntityKey) -> bool {
        self.snapshots.remove(key).is_some()
    }

    pub fn clear_all(&mut self) {
        self.snapshots.clear();
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}
