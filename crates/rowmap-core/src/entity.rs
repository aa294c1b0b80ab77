//! Entity trait and mapping declaration.
//!
//! An entity declares its table and columns once through [`EntityMapping`].
//! Each persistable field carries a getter and a setter function pointer, so
//! the session can read and write fields without runtime reflection.
//!
//! # Example
//!
//! ```ignore
//! #[derive(Debug, Default)]
//! struct Person {
//!     id: i64,
//!     first_name: String,
//!     last_name: String,
//! }
//!
//! impl Entity for Person {
//!     fn mapping() -> EntityMapping<Self> {
//!         EntityMapping::<Self>::builder()
//!             .table("users")
//!             .id("id", "id", |p| Value::from(p.id), |p, v| {
//!                 p.id = i64::from_value(v)?;
//!                 Ok(())
//!             })
//!             .column("first_name", "first_name", |p| Value::from(&p.first_name), |p, v| {
//!                 p.first_name = String::from_value(v)?;
//!                 Ok(())
//!             })
//!     }
//! }
//! ```

use crate::Result;
use crate::value::Value;
use std::fmt;

/// Reads one field of an entity as a `Value`.
pub type FieldGetter<E> = fn(&E) -> Value;

/// Writes one field of an entity from a `Value`.
pub type FieldSetter<E> = fn(&mut E, &Value) -> Result<()>;

/// A type that maps to a single table.
///
/// `Default` provides the blank instance that rows are materialized into.
pub trait Entity: Default + Send + Sync + 'static {
    /// Declare how this type maps to its table.
    fn mapping() -> EntityMapping<Self>;
}

/// How the primary-key field is identified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrimaryKeyStrategy {
    /// Only fields explicitly marked as primary key count.
    #[default]
    Explicit,
    /// A field with this name is the primary key even without a marker.
    FieldNamed(&'static str),
}

impl PrimaryKeyStrategy {
    /// Does this strategy make `field` the primary key?
    pub fn is_primary_key(self, field: &FieldMapping<impl Sized>) -> bool {
        match self {
            PrimaryKeyStrategy::Explicit => field.primary_key,
            PrimaryKeyStrategy::FieldNamed(name) => field.primary_key || field.name == name,
        }
    }
}

/// One persistable field.
pub struct FieldMapping<E> {
    /// Rust field name
    pub name: &'static str,
    /// Database column name
    pub column: Option<&'static str>,
    /// Explicit primary-key marker
    pub primary_key: bool,
    pub get: FieldGetter<E>,
    pub set: FieldSetter<E>,
}

impl<E> FieldMapping<E> {
    /// A field without a column name. Resolution fails until one is set.
    pub fn new(name: &'static str, get: FieldGetter<E>, set: FieldSetter<E>) -> Self {
        Self {
            name,
            column: None,
            primary_key: false,
            get,
            set,
        }
    }

    #[must_use]
    pub fn column(mut self, column: &'static str) -> Self {
        self.column = Some(column);
        self
    }

    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }
}

impl<E> Clone for FieldMapping<E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            column: self.column,
            primary_key: self.primary_key,
            get: self.get,
            set: self.set,
        }
    }
}

impl<E> fmt::Debug for FieldMapping<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldMapping")
            .field("name", &self.name)
            .field("column", &self.column)
            .field("primary_key", &self.primary_key)
            .finish_non_exhaustive()
    }
}

/// Declared table mapping for an entity type.
///
/// This is raw input; nothing is validated until it is resolved into
/// `TableMetadata`.
pub struct EntityMapping<E> {
    entity_name: String,
    table: Option<String>,
    strategy: PrimaryKeyStrategy,
    fields: Vec<FieldMapping<E>>,
}

impl<E> EntityMapping<E> {
    /// Start a mapping named after the simple type name of `E`.
    ///
    /// Name the entity type at the call site (`EntityMapping::<Self>::builder()`)
    /// so the accessor closures passed to `id` and `column` can infer it.
    pub fn builder() -> Self {
        Self {
            entity_name: simple_type_name(std::any::type_name::<E>()).to_string(),
            table: None,
            strategy: PrimaryKeyStrategy::default(),
            fields: Vec::new(),
        }
    }

    /// Override the entity name used for the default table name and in
    /// error messages.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.entity_name = name.into();
        self
    }

    /// Set an explicit table name.
    #[must_use]
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    #[must_use]
    pub fn primary_key_strategy(mut self, strategy: PrimaryKeyStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Add the primary-key field.
    #[must_use]
    pub fn id(
        self,
        field: &'static str,
        column: &'static str,
        get: FieldGetter<E>,
        set: FieldSetter<E>,
    ) -> Self {
        self.field(FieldMapping::new(field, get, set).column(column).primary_key())
    }

    /// Add a regular persistable field.
    #[must_use]
    pub fn column(
        self,
        field: &'static str,
        column: &'static str,
        get: FieldGetter<E>,
        set: FieldSetter<E>,
    ) -> Self {
        self.field(FieldMapping::new(field, get, set).column(column))
    }

    /// Add a field built by hand.
    #[must_use]
    pub fn field(mut self, field: FieldMapping<E>) -> Self {
        self.fields.push(field);
        self
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    /// Table name: the explicit one if declared, else the lower-cased entity name.
    pub fn table_name(&self) -> String {
        self.table
            .clone()
            .unwrap_or_else(|| self.entity_name.to_lowercase())
    }

    pub fn strategy(&self) -> PrimaryKeyStrategy {
        self.strategy
    }

    /// Fields in declaration order.
    pub fn fields(&self) -> &[FieldMapping<E>] {
        &self.fields
    }

    pub(crate) fn into_fields(self) -> Vec<FieldMapping<E>> {
        self.fields
    }
}

impl<E> fmt::Debug for EntityMapping<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityMapping")
            .field("entity_name", &self.entity_name)
            .field("table", &self.table)
            .field("strategy", &self.strategy)
            .field("fields", &self.fields)
            .finish()
    }
}

/// `app::model::Person` -> `Person`, `a::Wrapper<b::X>` -> `Wrapper`.
pub(crate) fn simple_type_name(full: &str) -> &str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::FromValue;

    #[derive(Debug, Default)]
    struct Person {
        id: i64,
        first_name: String,
    }

    fn person_mapping() -> EntityMapping<Person> {
        EntityMapping::<Person>::builder()
            .id(
                "id",
                "id",
                |p| Value::from(p.id),
                |p, v| {
                    p.id = i64::from_value(v)?;
                    Ok(())
                },
            )
            .column(
                "first_name",
                "first_name",
                |p| Value::from(&p.first_name),
                |p, v| {
                    p.first_name = String::from_value(v)?;
                    Ok(())
                },
            )
    }

    #[test]
    fn test_entity_name_from_type() {
        let mapping = person_mapping();
        assert_eq!(mapping.entity_name(), "Person");
        assert_eq!(mapping.table_name(), "person");
    }

    #[test]
    fn test_explicit_table_wins() {
        let mapping = person_mapping().table("users");
        assert_eq!(mapping.table_name(), "users");
    }

    #[test]
    fn test_accessors_round_trip_through_fn_pointers() {
        let mapping = person_mapping();
        let mut person = Person::default();
        let first = &mapping.fields()[1];
        (first.set)(&mut person, &Value::Text("Ann".to_string())).unwrap();
        assert_eq!(person.first_name, "Ann");
        assert_eq!((first.get)(&person), Value::Text("Ann".to_string()));
    }

    #[test]
    fn test_primary_key_strategy() {
        let id: FieldMapping<Person> = FieldMapping::new(
            "id",
            |p: &Person| Value::from(p.id),
            |_: &mut Person, _: &Value| Ok(()),
        );
        assert!(!PrimaryKeyStrategy::Explicit.is_primary_key(&id));
        assert!(PrimaryKeyStrategy::FieldNamed("id").is_primary_key(&id));
        assert!(PrimaryKeyStrategy::Explicit.is_primary_key(&id.clone().primary_key()));
    }

    #[test]
    fn test_simple_type_name() {
        assert_eq!(simple_type_name("app::model::Person"), "Person");
        assert_eq!(simple_type_name("Person"), "Person");
        assert_eq!(simple_type_name("a::Wrapper<b::Inner>"), "Wrapper");
    }
}
