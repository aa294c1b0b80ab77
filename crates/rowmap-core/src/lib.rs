//! Core types and traits for rowmap.
//!
//! This crate provides the foundational abstractions the session layer builds on:
//!
//! - `Entity` trait and `EntityMapping` for declaring how a struct maps to a table
//! - `TableMetadata` and the metadata resolver that validates and caches mappings
//! - `Connection` / `ConnectionProvider` traits for the external database transport
//! - `Value` and `Row` for dynamically-typed parameters and results
//! - `Error` taxonomy shared by every rowmap crate
//! - `Outcome` re-export from asupersync for cancel-correct operations

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod connection;
pub mod entity;
pub mod error;
pub mod metadata;
pub mod row;
pub mod value;

pub use connection::{Connection, ConnectionProvider, Dialect};
pub use entity::{Entity, EntityMapping, FieldGetter, FieldMapping, FieldSetter, PrimaryKeyStrategy};
pub use error::{
    DataAccessError, DataAccessErrorKind, DataIntegrityError, Error, FlushError, FlushFailure,
    MappingError, MappingErrorKind, NotFoundError, Result,
};
pub use metadata::{ColumnMetadata, ResolvedEntity, TableMetadata, resolve, resolve_mapping};
pub use row::{ColumnInfo, FromValue, Row};
pub use value::Value;
