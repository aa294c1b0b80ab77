//! Writing dirty entities back to the database.
//!
//! A flush plans one UPDATE per dirty entity, carrying only the changed
//! columns, then executes each on its own connection. Every planned update is
//! attempted; failures are collected rather than aborting the pass.

use crate::change_tracker::ChangeTracker;
use crate::identity_map::IdentityMap;
use crate::key::EntityKey;
use asupersync::{Cx, Outcome};
use rowmap_core::{
    Connection, ConnectionProvider, DataAccessError, DataAccessErrorKind, Error, FlushFailure,
    Result, TableMetadata, Value,
};
use rowmap_query::{ChangedColumn, UpdateByKey};

/// An UPDATE planned for one dirty entity.
#[derive(Debug, Clone)]
pub struct PendingUpdate {
    pub key: EntityKey,
    pub metadata: TableMetadata,
    /// Changed columns in field order, primary key excluded.
    pub changed: Vec<ChangedColumn>,
    /// Full current values; become the new snapshot once the update succeeds.
    pub current: Vec<Value>,
}

/// Outcome of a successful flush or close.
#[derive(Debug, Clone, Default)]
pub struct FlushReport {
    /// Entities whose UPDATE succeeded, in execution order.
    pub updated: Vec<EntityKey>,
    /// Tracked entities that needed no UPDATE.
    pub clean: usize,
    /// Sum of rows affected reported by the connection.
    pub rows_affected: u64,
}

impl FlushReport {
    /// Number of UPDATE statements executed.
    pub fn statements(&self) -> usize {
        self.updated.len()
    }

    /// Did the flush write nothing?
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty()
    }
}

/// Compare every tracked entity with its snapshot and plan the updates.
///
/// Entities are visited in key order (entity name, then primary key) so
/// repeated flushes of the same state issue statements in the same order.
/// An entity whose primary key was changed in memory cannot be addressed, and
/// one that is write-locked cannot be read; both are reported as failures.
pub fn plan_updates(
    identity_map: &IdentityMap,
    tracker: &ChangeTracker,
) -> (Vec<PendingUpdate>, Vec<FlushFailure>) {
    let mut keys: Vec<&EntityKey> = identity_map.keys().collect();
    keys.sort();

    let mut plan = Vec::new();
    let mut failures = Vec::new();
    for key in keys {
        let Some(tracked) = identity_map.tracked(key) else {
            continue;
        };
        let current = match tracked.current_values() {
            Ok(current) => current,
            Err(error) => {
                tracing::warn!(key = %key, error = %error, "Entity unreadable, skipping update");
                failures.push(FlushFailure {
                    key: key.to_string(),
                    error,
                });
                continue;
            }
        };
        let positions = tracker.changed_positions(key, &current);
        if positions.is_empty() {
            continue;
        }

        let metadata = tracked.metadata();
        let pk_index = metadata.primary_key_index();
        if pk_index.is_some_and(|pk| positions.contains(&pk)) {
            tracing::warn!(key = %key, "Primary key changed after load, skipping update");
            failures.push(FlushFailure {
                key: key.to_string(),
                error: Error::Invariant(format!(
                    "primary key of {key} was modified; the row can no longer be addressed"
                )),
            });
            continue;
        }

        let changed = positions
            .iter()
            .map(|&i| {
                ChangedColumn::new(metadata.fields[i].column_name.clone(), current[i].clone())
            })
            .collect();
        plan.push(PendingUpdate {
            key: key.clone(),
            metadata: metadata.clone(),
            changed,
            current,
        });
    }

    tracing::debug!(dirty = plan.len(), rejected = failures.len(), "Planned flush");
    (plan, failures)
}

/// Run one planned update on a freshly acquired connection.
///
/// The connection is released when this returns, on every path.
pub async fn execute_update<P: ConnectionProvider>(
    provider: &P,
    cx: &Cx,
    update: &PendingUpdate,
) -> Result<u64> {
    let conn = settle(
        provider.acquire(cx).await,
        DataAccessErrorKind::Connection,
        None,
    )?;
    let statement = UpdateByKey::new(&update.metadata)
        .dialect(conn.dialect())
        .changed(update.changed.clone())
        .bind(update.key.id().clone())?;

    tracing::debug!(sql = %statement.sql, key = %update.key, "Executing update");
    settle(
        conn.execute(cx, &statement.sql, &statement.params).await,
        DataAccessErrorKind::Query,
        Some(&statement.sql),
    )
}

/// Collapse an `Outcome` into a per-entity result.
///
/// Cancellation becomes a `Cancelled` data access error so the remaining
/// entities can still be attempted.
pub(crate) fn settle<T>(
    outcome: Outcome<T, Error>,
    kind: DataAccessErrorKind,
    sql: Option<&str>,
) -> Result<T> {
    match outcome {
        Outcome::Ok(value) => Ok(value),
        Outcome::Err(e) => Err(e.into_data_access(kind, sql)),
        Outcome::Cancelled(r) => {
            let mut err =
                DataAccessError::new(DataAccessErrorKind::Cancelled, format!("Cancelled: {r:?}"));
            if let Some(sql) = sql {
                err = err.sql(sql);
            }
            Err(Error::DataAccess(err))
        }
        Outcome::Panicked(p) => Err(Error::Invariant(format!("Panicked: {p:?}"))),
    }
}
