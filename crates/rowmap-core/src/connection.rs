//! Database connection traits.
//!
//! rowmap does not ship a driver. The session talks to the database through
//! two traits implemented by the application:
//!
//! - [`ConnectionProvider`] - hands out a connection for the duration of one
//!   operation
//! - [`Connection`] - executes a statement with positional parameters
//!
//! All operations integrate with asupersync's structured concurrency via `Cx`
//! for cancellation and timeout handling.

use crate::row::Row;
use crate::value::Value;
use asupersync::{Cx, Outcome};
use std::sync::Arc;

/// Placeholder style of the target database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    /// Anonymous `?` placeholders
    #[default]
    Generic,
    /// PostgreSQL (`$1`, `$2`, ...)
    Postgres,
    /// SQLite numbered placeholders (`?1`, `?2`, ...)
    Sqlite,
    /// MySQL (`?`)
    Mysql,
}

impl Dialect {
    /// Generate a placeholder for the given parameter index (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Generic | Dialect::Mysql => "?".to_string(),
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
        }
    }
}

/// A database connection borrowed for one operation.
///
/// Dropping the connection releases it back to its provider.
///
/// # Example
///
/// ```rust,ignore
/// let rows = conn.query(&cx, "SELECT * FROM users WHERE id = ?", &[Value::BigInt(1)]).await?;
/// let affected = conn
///     .execute(&cx, "UPDATE users SET first_name = ? WHERE id = ?", &params)
///     .await?;
/// ```
pub trait Connection: Send + Sync {
    /// Placeholder style used when building statements for this connection.
    fn dialect(&self) -> Dialect {
        Dialect::Generic
    }

    /// Execute a query and return all rows.
    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, crate::Error>> + Send;

    /// Execute a statement and return rows affected.
    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, crate::Error>> + Send;
}

/// Source of scoped connections.
///
/// Pooling, thread-safety and retry policy are the provider's concern; the
/// session only acquires, uses and drops.
pub trait ConnectionProvider: Send + Sync {
    /// The connection type handed out.
    type Connection: Connection;

    /// Acquire a connection for a single operation.
    fn acquire(&self, cx: &Cx)
    -> impl Future<Output = Outcome<Self::Connection, crate::Error>> + Send;
}

impl<P: ConnectionProvider> ConnectionProvider for Arc<P> {
    type Connection = P::Connection;

    fn acquire(
        &self,
        cx: &Cx,
    ) -> impl Future<Output = Outcome<Self::Connection, crate::Error>> + Send {
        (**self).acquire(cx)
    }
}
