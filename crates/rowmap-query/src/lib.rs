//! SQL statement builders for rowmap.
//!
//! `rowmap-query` turns resolved `TableMetadata` into parameterized SQL for the
//! two statements the session issues:
//!
//! - [`SelectByKey`]: `SELECT * FROM <table> WHERE <pk> = ?`
//! - [`UpdateByKey`]: `UPDATE <table> SET <c1> = ?, ... WHERE <pk> = ?`
//!
//! Values are always bound as positional parameters. Placeholder style follows
//! the connection's `Dialect`.

pub mod builder;

pub use builder::{
    ChangedColumn, SelectByKey, Statement, UpdateByKey, build_select_by_key, build_update_by_key,
};
