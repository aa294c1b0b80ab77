//! Identity of a loaded entity.

use rowmap_core::{Entity, Value};
use std::any::TypeId;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// (entity type, primary-key value).
///
/// Two keys are equal when both components are equal. Primary-key values
/// compare by identity semantics (`Value::key_eq`), so `Int(1)` and
/// `BigInt(1)` name the same row.
#[derive(Debug, Clone)]
pub struct EntityKey {
    type_id: TypeId,
    entity_name: &'static str,
    id: Value,
}

impl EntityKey {
    /// Key for the row of `E` with primary key `id`.
    pub fn of<E: Entity>(id: impl Into<Value>) -> Self {
        let full = std::any::type_name::<E>();
        let base = full.split('<').next().unwrap_or(full);
        Self {
            type_id: TypeId::of::<E>(),
            entity_name: base.rsplit("::").next().unwrap_or(base),
            id: id.into(),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Simple type name of the entity, e.g. `Person`.
    pub fn entity_name(&self) -> &'static str {
        self.entity_name
    }

    /// The primary-key value.
    pub fn id(&self) -> &Value {
        &self.id
    }

    /// Does this key belong to entity type `E`?
    pub fn is<E: Entity>(&self) -> bool {
        self.type_id == TypeId::of::<E>()
    }
}

impl PartialEq for EntityKey {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id && self.id.key_eq(&other.id)
    }
}

impl Eq for EntityKey {}

impl Hash for EntityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
        self.id.hash_key(state);
    }
}

impl PartialOrd for EntityKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Orders by entity name, then by primary key (`Value::key_cmp`).
impl Ord for EntityKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.entity_name
            .cmp(other.entity_name)
            .then_with(|| self.type_id.cmp(&other.type_id))
            .then_with(|| self.id.key_cmp(&other.id))
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity_name, self.id)
    }
}
