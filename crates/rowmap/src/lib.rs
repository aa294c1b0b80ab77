//! rowmap - load entities by key, edit them in memory, write back what changed.
//!
//! rowmap provides:
//!
//! - Entity metadata resolved once per type from an explicit mapping
//! - `SELECT * ... WHERE pk = ?` and `UPDATE ... SET <changed> WHERE pk = ?`
//!   generation with dialect-aware placeholders
//! - A session with an identity map and snapshot-based dirty checking
//!
//! # Quick Start
//!
//! ```ignore
//! use rowmap::prelude::*;
//!
//! #[derive(Debug, Default)]
//! struct Person {
//!     id: i64,
//!     first_name: String,
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
//!
//! async fn rename(cx: &Cx, provider: MyProvider) {
//!     let factory = SessionFactory::new(provider);
//!     let mut session = factory.create_session();
//!
//!     let person = session.find::<Person>(cx, 1_i64).await.unwrap();
//!     person.write().unwrap().first_name = "Bea".to_string();
//!
//!     // UPDATE users SET first_name = ? WHERE id = ?
//!     session.close(cx).await.unwrap();
//! }
//! ```

// Re-export all public types from sub-crates
pub use rowmap_core::{
    // asupersync re-exports
    Cx,
    Outcome,
    // Core types
    ColumnInfo,
    ColumnMetadata,
    Connection,
    ConnectionProvider,
    Dialect,
    Entity,
    EntityMapping,
    FieldGetter,
    FieldMapping,
    FieldSetter,
    FromValue,
    PrimaryKeyStrategy,
    ResolvedEntity,
    Row,
    TableMetadata,
    Value,
    resolve,
    resolve_mapping,
    // Errors
    DataAccessError,
    DataAccessErrorKind,
    DataIntegrityError,
    Error,
    FlushError,
    FlushFailure,
    MappingError,
    MappingErrorKind,
    NotFoundError,
    Result,
};

pub use rowmap_query::{
    ChangedColumn, SelectByKey, Statement, UpdateByKey, build_select_by_key,
    build_update_by_key,
};

pub use rowmap_session::{
    ChangeTracker, EntityKey, EntityReadGuard, EntityRef, EntityWriteGuard, FlushReport,
    IdentityMap, Session, SessionConfig, SessionDebugInfo, SessionFactory, SessionState,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{
        // asupersync
        Cx,
        Outcome,
        // Mapping
        Connection,
        ConnectionProvider,
        Dialect,
        Entity,
        EntityMapping,
        FromValue,
        Result,
        Row,
        Value,
        // Session
        EntityKey,
        EntityRef,
        Error,
        FlushReport,
        Session,
        SessionConfig,
        SessionFactory,
    };
}
