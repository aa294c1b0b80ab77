//! Entity metadata resolution.
//!
//! [`resolve`] turns an `EntityMapping` into validated [`TableMetadata`] plus
//! the matching accessor table. Resolution is pure and happens at most once
//! per type for the lifetime of the process; failed resolutions are not
//! cached, so every attempt reports the same `MappingError`.

use crate::Result;
use crate::entity::{Entity, EntityMapping, FieldGetter, FieldSetter};
use crate::error::{DataIntegrityError, Error, MappingError, MappingErrorKind};
use crate::row::Row;
use crate::value::Value;
use regex::Regex;
use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

/// Column metadata for one persistable field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMetadata {
    pub field_name: String,
    pub column_name: String,
    pub primary_key: bool,
}

impl ColumnMetadata {
    pub fn new(field_name: impl Into<String>, column_name: impl Into<String>) -> Self {
        Self {
            field_name: field_name.into(),
            column_name: column_name.into(),
            primary_key: false,
        }
    }

    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }
}

/// Table name and columns of an entity, fields ordered lexicographically by
/// field name.
///
/// Snapshots and dirty checks use the same order, so position `i` always
/// refers to `fields[i]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMetadata {
    pub table_name: String,
    pub fields: Vec<ColumnMetadata>,
}

impl TableMetadata {
    /// The primary-key column, if exactly one field is flagged.
    pub fn primary_key(&self) -> Option<&ColumnMetadata> {
        let mut keys = self.fields.iter().filter(|f| f.primary_key);
        match (keys.next(), keys.next()) {
            (Some(pk), None) => Some(pk),
            _ => None,
        }
    }

    pub fn primary_key_index(&self) -> Option<usize> {
        self.fields.iter().position(|f| f.primary_key)
    }
}

/// Metadata plus the accessor table aligned with `metadata.fields`.
pub struct ResolvedEntity<E> {
    entity_name: String,
    metadata: TableMetadata,
    primary_key: usize,
    getters: Vec<FieldGetter<E>>,
    setters: Vec<FieldSetter<E>>,
}

impl<E> ResolvedEntity<E> {
    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn metadata(&self) -> &TableMetadata {
        &self.metadata
    }

    pub fn table_name(&self) -> &str {
        &self.metadata.table_name
    }

    /// Position of the primary key in field order.
    pub fn primary_key_index(&self) -> usize {
        self.primary_key
    }

    pub fn primary_key_column(&self) -> &str {
        &self.metadata.fields[self.primary_key].column_name
    }

    /// Current field values of `entity`, in field order.
    pub fn read_values(&self, entity: &E) -> Vec<Value> {
        self.getters.iter().map(|get| get(entity)).collect()
    }

    pub fn primary_key_value(&self, entity: &E) -> Value {
        (self.getters[self.primary_key])(entity)
    }

    /// Build an entity from a result row by column name.
    ///
    /// Every mapped column must be present; a missing column or a value the
    /// setter rejects is a `DataIntegrity` error naming the table and column.
    pub fn materialize(&self, row: &Row) -> Result<E>
    where
        E: Default,
    {
        let mut entity = E::default();
        for (column, set) in self.metadata.fields.iter().zip(&self.setters) {
            let value = lookup_column(row, &column.column_name).ok_or_else(|| {
                Error::DataIntegrity(
                    DataIntegrityError::new("column missing from result row")
                        .table(&self.metadata.table_name)
                        .column(&column.column_name),
                )
            })?;
            set(&mut entity, value).map_err(|e| match e {
                Error::DataIntegrity(mut de) => {
                    de.table.get_or_insert_with(|| self.metadata.table_name.clone());
                    de.column.get_or_insert_with(|| column.column_name.clone());
                    Error::DataIntegrity(de)
                }
                other => other,
            })?;
        }
        Ok(entity)
    }
}

impl<E> fmt::Debug for ResolvedEntity<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedEntity")
            .field("entity_name", &self.entity_name)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

// Drivers differ in the case they report column names with.
fn lookup_column<'r>(row: &'r Row, column: &str) -> Option<&'r Value> {
    row.get_by_name(column).or_else(|| {
        row.iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .map(|(_, value)| value)
    })
}

fn identifier_pattern() -> Result<&'static Regex> {
    static PATTERN: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$"))
        .as_ref()
        .map_err(|e| Error::Invariant(format!("identifier pattern failed to compile: {e}")))
}

fn check_identifier(entity: &str, what: &str, name: &str) -> Result<()> {
    if identifier_pattern()?.is_match(name) {
        Ok(())
    } else {
        Err(Error::Mapping(MappingError::new(
            entity,
            MappingErrorKind::InvalidIdentifier,
            format!("{what} '{name}' is not a valid SQL identifier"),
        )))
    }
}

/// Validate a mapping and produce its resolved form.
///
/// Does not touch the process-wide cache; see [`resolve`].
pub fn resolve_mapping<E>(mapping: EntityMapping<E>) -> Result<ResolvedEntity<E>> {
    let entity_name = mapping.entity_name().to_string();
    let table_name = mapping.table_name();
    let strategy = mapping.strategy();
    let mapping_err =
        |kind, message: String| Error::Mapping(MappingError::new(&entity_name, kind, message));

    check_identifier(&entity_name, "table name", &table_name)?;

    let mut fields = mapping.into_fields();
    fields.sort_by(|a, b| a.name.cmp(b.name));

    let mut seen_fields = HashSet::new();
    let mut seen_columns = HashSet::new();
    let mut columns = Vec::with_capacity(fields.len());
    for field in &fields {
        if !seen_fields.insert(field.name) {
            return Err(mapping_err(
                MappingErrorKind::DuplicateField,
                format!("field '{}' is mapped more than once", field.name),
            ));
        }
        let Some(column) = field.column else {
            return Err(mapping_err(
                MappingErrorKind::MissingColumn,
                format!("field '{}' has no column mapping", field.name),
            ));
        };
        check_identifier(&entity_name, "column name", column)?;
        if !seen_columns.insert(column.to_ascii_lowercase()) {
            return Err(mapping_err(
                MappingErrorKind::DuplicateColumn,
                format!("column '{column}' is mapped by more than one field"),
            ));
        }
        columns.push(ColumnMetadata {
            field_name: field.name.to_string(),
            column_name: column.to_string(),
            primary_key: strategy.is_primary_key(field),
        });
    }

    let keys: Vec<usize> = columns
        .iter()
        .enumerate()
        .filter(|(_, c)| c.primary_key)
        .map(|(i, _)| i)
        .collect();
    let primary_key = match keys.as_slice() {
        [single] => *single,
        [] => {
            return Err(mapping_err(
                MappingErrorKind::MissingPrimaryKey,
                "no field is designated primary key".to_string(),
            ));
        }
        many => {
            let names: Vec<&str> = many.iter().map(|&i| columns[i].field_name.as_str()).collect();
            return Err(mapping_err(
                MappingErrorKind::MultiplePrimaryKeys,
                format!("multiple primary-key fields: {}", names.join(", ")),
            ));
        }
    };

    Ok(ResolvedEntity {
        entity_name: entity_name.clone(),
        metadata: TableMetadata {
            table_name,
            fields: columns,
        },
        primary_key,
        getters: fields.iter().map(|f| f.get).collect(),
        setters: fields.iter().map(|f| f.set).collect(),
    })
}

type MetadataCache = RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>;

fn metadata_cache() -> &'static MetadataCache {
    static CACHE: OnceLock<MetadataCache> = OnceLock::new();
    CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Resolve `E`'s metadata, computing it on first use.
#[tracing::instrument(level = "trace", fields(entity = std::any::type_name::<E>()))]
pub fn resolve<E: Entity>() -> Result<Arc<ResolvedEntity<E>>> {
    let type_id = TypeId::of::<E>();
    {
        let cache = metadata_cache()
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(cached) = cache.get(&type_id) {
            if let Ok(resolved) = Arc::clone(cached).downcast::<ResolvedEntity<E>>() {
                return Ok(resolved);
            }
        }
    }

    let resolved = match resolve_mapping(E::mapping()) {
        Ok(resolved) => Arc::new(resolved),
        Err(e) => {
            tracing::debug!(error = %e, "Entity mapping rejected");
            return Err(e);
        }
    };
    tracing::debug!(
        table = %resolved.table_name(),
        columns = resolved.metadata().fields.len(),
        "Resolved entity metadata"
    );

    let mut cache = metadata_cache()
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    // Another thread may have won the race; keep the first entry.
    let entry = cache
        .entry(type_id)
        .or_insert_with(|| Arc::clone(&resolved) as Arc<dyn Any + Send + Sync>);
    Ok(Arc::clone(entry)
        .downcast::<ResolvedEntity<E>>()
        .unwrap_or(resolved))
}
