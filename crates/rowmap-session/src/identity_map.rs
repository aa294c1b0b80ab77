//! Identity map: one live instance per entity key.
//!
//! Entities are stored as `Arc<RwLock<E>>` behind a type-erased entry, so
//! looking up the same key twice returns clones of the same `Arc`. Changes
//! made through one handle are visible through every other.
//!
//! # Example
//!
//! ```ignore
//! let mut map = IdentityMap::new();
//! let key = EntityKey::of::<Person>(1_i64);
//! map.insert(key.clone(), Arc::new(RwLock::new(person)), resolved);
//!
//! let a = map.get::<Person>(&key).unwrap();
//! let b = map.get::<Person>(&key).unwrap();
//! assert!(Arc::ptr_eq(&a, &b));
//! ```

use crate::key::EntityKey;
use rowmap_core::{Entity, Error, ResolvedEntity, Result, TableMetadata, Value};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, TryLockError};

/// A live handle to an entity held by a session.
pub type EntityRef<E> = Arc<RwLock<E>>;

/// A guard for reading an entity through its handle.
pub type EntityReadGuard<'a, E> = std::sync::RwLockReadGuard<'a, E>;

/// A guard for writing to an entity through its handle.
pub type EntityWriteGuard<'a, E> = std::sync::RwLockWriteGuard<'a, E>;

/// Type-erased view of a tracked entity.
///
/// Lets the session dirty-check entities of different types in one pass.
pub trait Tracked: Send + Sync {
    /// Current field values, in metadata field order.
    ///
    /// Fails instead of blocking when the entity is write-locked.
    fn current_values(&self) -> Result<Vec<Value>>;

    fn metadata(&self) -> &TableMetadata;

    /// The stored `EntityRef<E>`, for downcasting.
    fn as_any(&self) -> &dyn Any;
}

struct Entry<E: Entity> {
    handle: EntityRef<E>,
    resolved: Arc<ResolvedEntity<E>>,
}

impl<E: Entity> Tracked for Entry<E> {
    fn current_values(&self) -> Result<Vec<Value>> {
        // A writer that panicked leaves the entity as it was at that point;
        // the values are still the best description of what to persist.
        let guard = match self.handle.try_read() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                return Err(Error::Invariant(format!(
                    "{} is locked for writing; release the write guard before flushing",
                    self.resolved.entity_name()
                )));
            }
        };
        Ok(self.resolved.read_values(&guard))
    }

    fn metadata(&self) -> &TableMetadata {
        self.resolved.metadata()
    }

    fn as_any(&self) -> &dyn Any {
        &self.handle
    }
}

/// Map from entity key to live instance.
#[derive(Default)]
pub struct IdentityMap {
    entries: HashMap<EntityKey, Box<dyn Tracked>>,
}

impl IdentityMap {
    /// Create a new empty identity map.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Store `handle` under `key`.
    ///
    /// If the key is already present the existing handle is kept and returned;
    /// the new one is dropped.
    pub fn insert<E: Entity>(
        &mut self,
        key: EntityKey,
        handle: EntityRef<E>,
        resolved: Arc<ResolvedEntity<E>>,
    ) -> EntityRef<E> {
        if let Some(existing) = self.get::<E>(&key) {
            return existing;
        }
        self.entries.insert(
            key,
            Box::new(Entry {
                handle: Arc::clone(&handle),
                resolved,
            }),
        );
        handle
    }

    /// Get the live handle for `key`.
    ///
    /// Returns `None` when the key is absent or belongs to another type.
    pub fn get<E: Entity>(&self, key: &EntityKey) -> Option<EntityRef<E>> {
        let entry = self.entries.get(key)?;
        entry.as_any().downcast_ref::<EntityRef<E>>().map(Arc::clone)
    }

    /// Type-erased access to a tracked entity.
    pub fn tracked(&self, key: &EntityKey) -> Option<&dyn Tracked> {
        self.entries.get(key).map(|entry| &**entry)
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove an entity. Returns `true` if it was present.
    pub fn remove(&mut self, key: &EntityKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove all entries.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn keys(&self) -> impl Iterator<Item = &EntityKey> {
        self.entries.keys()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for IdentityMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityMap")
            .field("keys", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}
