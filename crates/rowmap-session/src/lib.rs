//! Session and unit of work for rowmap.
//!
//! `rowmap-session` is the **unit-of-work layer**. A [`Session`] loads entities
//! by primary key through an identity map, remembers what each looked like when
//! it was loaded, and on [`Session::close`] writes back exactly the columns
//! that changed.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one live instance per (entity type, primary key).
//! - **Change tracking**: load-time snapshots compared field by field.
//! - **Scoped connections**: every load and every update acquires its own
//!   connection from the `ConnectionProvider` and releases it on return.
//!
//! # Example
//!
//! ```ignore
//! let factory = SessionFactory::new(provider);
//! let mut session = factory.create_session();
//!
//! let person = session.find::<Person>(&cx, 1_i64).await?;
//! person.write().unwrap().first_name = "Bea".to_string();
//!
//! // UPDATE users SET first_name = ? WHERE id = ?
//! session.close(&cx).await?;
//! ```

pub mod change_tracker;
pub mod flush;
pub mod identity_map;
pub mod key;

pub use change_tracker::ChangeTracker;
pub use flush::{FlushReport, PendingUpdate};
pub use identity_map::{EntityReadGuard, EntityRef, EntityWriteGuard, IdentityMap, Tracked};
pub use key::EntityKey;

use asupersync::{Cx, Outcome};
use rowmap_core::{
    Connection, ConnectionProvider, DataAccessErrorKind, DataIntegrityError, Entity, Error,
    FlushError, NotFoundError, Value, resolve,
};
use rowmap_query::SelectByKey;
use std::sync::{Arc, RwLock};

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Reject a lookup that returns more than one row. When false the first
    /// row wins.
    pub check_single_row: bool,
    /// Re-snapshot entities after a successful `flush`, so a second flush
    /// writes nothing.
    pub refresh_snapshots_on_flush: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            check_single_row: true,
            refresh_snapshots_on_flush: true,
        }
    }
}

impl SessionConfig {
    /// Create new default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the `check_single_row` option (builder pattern).
    #[must_use]
    pub fn check_single_row(mut self, value: bool) -> Self {
        self.check_single_row = value;
        self
    }

    /// Set the `refresh_snapshots_on_flush` option (builder pattern).
    #[must_use]
    pub fn refresh_snapshots_on_flush(mut self, value: bool) -> Self {
        self.refresh_snapshots_on_flush = value;
        self
    }
}

// ============================================================================
// Session Factory
// ============================================================================

/// Hands out independent sessions over one shared connection provider.
#[derive(Debug)]
pub struct SessionFactory<P> {
    provider: Arc<P>,
    config: SessionConfig,
}

impl<P> Clone for SessionFactory<P> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            config: self.config.clone(),
        }
    }
}

impl<P: ConnectionProvider> SessionFactory<P> {
    pub fn new(provider: P) -> Self {
        Self::from_arc(Arc::new(provider))
    }

    /// Build a factory over a provider that is already shared.
    pub fn from_arc(provider: Arc<P>) -> Self {
        Self {
            provider,
            config: SessionConfig::default(),
        }
    }

    /// Configuration given to every session created from now on.
    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Open a new, empty session.
    pub fn create_session(&self) -> Session<Arc<P>> {
        Session::with_config(Arc::clone(&self.provider), self.config.clone())
    }
}

// ============================================================================
// Session
// ============================================================================

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Can load and flush.
    Open,
    /// Terminal; every operation fails with `Error::SessionClosed`.
    Closed,
}

/// The unit of work.
///
/// Holds an identity map and a snapshot per loaded entity. A session is
/// single-owner: loads and flushes take `&mut self` and run one statement at
/// a time.
pub struct Session<P: ConnectionProvider> {
    provider: P,
    config: SessionConfig,
    identity_map: IdentityMap,
    change_tracker: ChangeTracker,
    state: SessionState,
}

impl<P: ConnectionProvider> Session<P> {
    /// Create a new session over `provider`.
    pub fn new(provider: P) -> Self {
        Self::with_config(provider, SessionConfig::default())
    }

    /// Create a new session with custom configuration.
    pub fn with_config(provider: P, config: SessionConfig) -> Self {
        Self {
            provider,
            config,
            identity_map: IdentityMap::new(),
            change_tracker: ChangeTracker::new(),
            state: SessionState::Open,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Load an entity by primary key.
    ///
    /// The first lookup of a key queries the database; every later lookup in
    /// this session returns the same handle without touching the connection.
    /// The handle is live: writes through it are what `flush` and `close`
    /// compare against the load-time snapshot.
    ///
    /// Drop any write guard taken on the handle before calling `flush` or
    /// `close`: an entity still write-locked at that point is not written and
    /// is reported as a failure.
    ///
    /// Nothing is cached when the load fails. A missing row is
    /// `Error::NotFound`; more than one row is `Error::DataIntegrity` unless
    /// `check_single_row` is off.
    #[tracing::instrument(
        level = "debug",
        skip(self, cx, id),
        fields(entity = std::any::type_name::<E>())
    )]
    pub async fn find<E: Entity>(
        &mut self,
        cx: &Cx,
        id: impl Into<Value>,
    ) -> Outcome<EntityRef<E>, Error> {
        if self.is_closed() {
            return Outcome::Err(Error::SessionClosed);
        }

        let id = id.into();
        let key = EntityKey::of::<E>(id.clone());
        if let Some(handle) = self.identity_map.get::<E>(&key) {
            tracing::trace!(key = %key, "Identity map hit");
            return Outcome::Ok(handle);
        }

        // Mapping problems surface before any connection is acquired.
        let resolved = match resolve::<E>() {
            Ok(resolved) => resolved,
            Err(e) => return Outcome::Err(e),
        };

        let conn = match self.provider.acquire(cx).await {
            Outcome::Ok(conn) => conn,
            Outcome::Err(e) => {
                return Outcome::Err(e.into_data_access(DataAccessErrorKind::Connection, None));
            }
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let statement = match SelectByKey::new(resolved.metadata())
            .dialect(conn.dialect())
            .bind(id)
        {
            Ok(statement) => statement,
            Err(e) => return Outcome::Err(e),
        };

        tracing::debug!(sql = %statement.sql, key = %key, "Executing select");
        let rows = match conn.query(cx, &statement.sql, &statement.params).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => {
                return Outcome::Err(
                    e.into_data_access(DataAccessErrorKind::Query, Some(&statement.sql)),
                );
            }
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        drop(conn);

        let row = match rows.as_slice() {
            [] => {
                return Outcome::Err(Error::NotFound(NotFoundError {
                    table: resolved.table_name().to_string(),
                    key: key.to_string(),
                }));
            }
            [row] => row,
            [first, ..] if !self.config.check_single_row => {
                tracing::warn!(key = %key, rows = rows.len(), "Multiple rows for key, using first");
                first
            }
            many => {
                return Outcome::Err(Error::DataIntegrity(
                    DataIntegrityError::new(format!(
                        "{} rows returned for key {}",
                        many.len(),
                        key
                    ))
                    .table(resolved.table_name()),
                ));
            }
        };

        let entity = match resolved.materialize(row) {
            Ok(entity) => entity,
            Err(e) => return Outcome::Err(e),
        };

        let snapshot = resolved.read_values(&entity);
        self.change_tracker.snapshot(key.clone(), snapshot);
        let handle = self
            .identity_map
            .insert(key, Arc::new(RwLock::new(entity)), resolved);
        Outcome::Ok(handle)
    }

    /// Write every dirty entity back without closing the session.
    ///
    /// All dirty entities are attempted even if some fail; successful updates
    /// stay applied. With `refresh_snapshots_on_flush` the updated entities
    /// are re-snapshotted, so flushing again writes nothing.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<FlushReport, Error> {
        if self.is_closed() {
            return Outcome::Err(Error::SessionClosed);
        }
        let refresh = self.config.refresh_snapshots_on_flush;
        self.write_changes(cx, refresh).await
    }

    /// Write every dirty entity back, then close the session.
    ///
    /// The session is closed and its state discarded whether or not the
    /// updates succeed. If any entity failed, the result is `Error::Flush`
    /// listing each failure.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn close(&mut self, cx: &Cx) -> Outcome<FlushReport, Error> {
        if self.is_closed() {
            return Outcome::Err(Error::SessionClosed);
        }
        let result = self.write_changes(cx, false).await;

        self.state = SessionState::Closed;
        self.identity_map.clear();
        self.change_tracker.clear_all();
        tracing::debug!("Session closed");
        result
    }

    async fn write_changes(&mut self, cx: &Cx, refresh: bool) -> Outcome<FlushReport, Error> {
        let (plan, mut failures) = flush::plan_updates(&self.identity_map, &self.change_tracker);
        let mut report = FlushReport {
            clean: self.identity_map.len() - plan.len() - failures.len(),
            ..FlushReport::default()
        };

        for update in plan {
            match flush::execute_update(&self.provider, cx, &update).await {
                Ok(rows) => {
                    if rows == 0 {
                        tracing::warn!(key = %update.key, "Update matched no rows");
                    }
                    report.rows_affected += rows;
                    if refresh {
                        self.change_tracker.snapshot(update.key.clone(), update.current);
                    }
                    report.updated.push(update.key);
                }
                Err(error) => {
                    tracing::warn!(key = %update.key, error = %error, "Entity update failed");
                    failures.push(rowmap_core::FlushFailure {
                        key: update.key.to_string(),
                        error,
                    });
                }
            }
        }

        tracing::debug!(
            updated = report.updated.len(),
            failed = failures.len(),
            clean = report.clean,
            "Flush complete"
        );
        if failures.is_empty() {
            Outcome::Ok(report)
        } else {
            Outcome::Err(Error::Flush(FlushError {
                failures,
                succeeded: report.updated.len(),
            }))
        }
    }

    /// Is this entity loaded in the session?
    pub fn contains(&self, key: &EntityKey) -> bool {
        self.identity_map.contains(key)
    }

    /// Has this entity changed since it was loaded (or last flushed)?
    ///
    /// `false` for keys the session does not hold.
    pub fn is_dirty(&self, key: &EntityKey) -> bool {
        !self.dirty_columns(key).is_empty()
    }

    /// Columns of this entity whose values differ from the snapshot, in
    /// field order.
    ///
    /// Empty while the entity is write-locked.
    pub fn dirty_columns(&self, key: &EntityKey) -> Vec<String> {
        let Some(tracked) = self.identity_map.tracked(key) else {
            return Vec::new();
        };
        let Ok(current) = tracked.current_values() else {
            return Vec::new();
        };
        let fields = &tracked.metadata().fields;
        self.change_tracker
            .changed_positions(key, &current)
            .into_iter()
            .filter_map(|i| fields.get(i).map(|f| f.column_name.clone()))
            .collect()
    }

    /// Forget an entity so the next `find` loads it again.
    ///
    /// Unflushed changes to it are discarded.
    pub fn evict(&mut self, key: &EntityKey) -> bool {
        let removed = self.identity_map.remove(key);
        self.change_tracker.clear(key);
        if removed {
            tracing::debug!(key = %key, "Evicted entity");
        }
        removed
    }

    /// Number of loaded entities.
    pub fn len(&self) -> usize {
        self.identity_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identity_map.is_empty()
    }

    fn dirty_count(&self) -> usize {
        self.identity_map.keys().filter(|key| self.is_dirty(key)).count()
    }

    /// Dump session state for debugging.
    pub fn debug_state(&self) -> SessionDebugInfo {
        SessionDebugInfo {
            tracked: self.identity_map.len(),
            snapshots: self.change_tracker.len(),
            dirty: self.dirty_count(),
            closed: self.is_closed(),
        }
    }
}

impl<P: ConnectionProvider> std::fmt::Debug for Session<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("config", &self.config)
            .field("identity_map", &self.identity_map)
            .finish_non_exhaustive()
    }
}

impl<P: ConnectionProvider> Drop for Session<P> {
    fn drop(&mut self) {
        if self.state == SessionState::Open {
            let unflushed = self.dirty_count();
            if unflushed > 0 {
                tracing::warn!(
                    unflushed,
                    "Session dropped without close; unflushed changes discarded"
                );
            }
        }
    }
}

/// Debug information about session state.
#[derive(Debug, Clone)]
pub struct SessionDebugInfo {
    /// Entities in the identity map.
    pub tracked: usize,
    /// Snapshots held.
    pub snapshots: usize,
    /// Entities that differ from their snapshot.
    pub dirty: usize,
    /// Whether the session has been closed.
    pub closed: bool,
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
#[allow(clippy::manual_async_fn)] // Mock trait impls must match trait signatures
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use rowmap_core::{DataAccessError, Dialect, EntityMapping, FromValue, MappingErrorKind, Row};
    use std::collections::HashSet;
    use std::sync::Mutex;

    fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
        }
    }

    fn unwrap_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
        match outcome {
            Outcome::Err(e) => e,
            other => std::panic::panic_any(format!("expected error, got: {other:?}")),
        }
    }

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Person {
        id: i64,
        first_name: String,
        last_name: String,
    }

    impl Entity for Person {
        fn mapping() -> EntityMapping<Self> {
            EntityMapping::<Self>::builder()
                .table("users")
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
                .column(
                    "last_name",
                    "last_name",
                    |p| Value::from(&p.last_name),
                    |p, v| {
                        p.last_name = String::from_value(v)?;
                        Ok(())
                    },
                )
        }
    }

    #[derive(Debug, Default)]
    struct Unmapped {
        id: i64,
    }

    impl Entity for Unmapped {
        fn mapping() -> EntityMapping<Self> {
            // No primary key declared
            EntityMapping::<Self>::builder().column(
                "id",
                "id",
                |u| Value::from(u.id),
                |u, v| {
                    u.id = i64::from_value(v)?;
                    Ok(())
                },
            )
        }
    }

    #[derive(Debug, Default)]
    struct MockState {
        rows: Vec<Row>,
        acquired: usize,
        released: usize,
        queries: Vec<(String, Vec<Value>)>,
        executed: Vec<(String, Vec<Value>)>,
        fail_updates_for: HashSet<i64>,
        fail_acquire: bool,
        fail_query: bool,
        duplicate_rows: bool,
    }

    #[derive(Debug, Clone)]
    struct MockProvider {
        state: Arc<Mutex<MockState>>,
        dialect: Dialect,
    }

    impl MockProvider {
        fn new(state: Arc<Mutex<MockState>>) -> Self {
            Self {
                state,
                dialect: Dialect::Generic,
            }
        }
    }

    #[derive(Debug)]
    struct MockConnection {
        state: Arc<Mutex<MockState>>,
        dialect: Dialect,
    }

    impl Drop for MockConnection {
        fn drop(&mut self) {
            self.state.lock().expect("lock poisoned").released += 1;
        }
    }

    impl ConnectionProvider for MockProvider {
        type Connection = MockConnection;

        fn acquire(
            &self,
            _cx: &Cx,
        ) -> impl Future<Output = Outcome<MockConnection, Error>> + Send {
            let state = Arc::clone(&self.state);
            let dialect = self.dialect;
            async move {
                {
                    let mut guard = state.lock().expect("lock poisoned");
                    if guard.fail_acquire {
                        return Outcome::Err(Error::DataAccess(DataAccessError::new(
                            DataAccessErrorKind::Connection,
                            "connection refused",
                        )));
                    }
                    guard.acquired += 1;
                }
                Outcome::Ok(MockConnection { state, dialect })
            }
        }
    }

    impl Connection for MockConnection {
        fn dialect(&self) -> Dialect {
            self.dialect
        }

        fn query(
            &self,
            _cx: &Cx,
            sql: &str,
            params: &[Value],
        ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
            let state = Arc::clone(&self.state);
            let sql = sql.to_string();
            let params = params.to_vec();
            async move {
                let mut guard = state.lock().expect("lock poisoned");
                guard.queries.push((sql, params.clone()));
                if guard.fail_query {
                    return Outcome::Err(Error::Invariant("driver exploded".to_string()));
                }
                let mut rows: Vec<Row> = guard
                    .rows
                    .iter()
                    .filter(|row| {
                        row.get_by_name("id")
                            .is_some_and(|id| params.first().is_some_and(|p| p.key_eq(id)))
                    })
                    .cloned()
                    .collect();
                if guard.duplicate_rows {
                    rows.extend(rows.clone());
                }
                Outcome::Ok(rows)
            }
        }

        fn execute(
            &self,
            _cx: &Cx,
            sql: &str,
            params: &[Value],
        ) -> impl Future<Output = Outcome<u64, Error>> + Send {
            let state = Arc::clone(&self.state);
            let sql = sql.to_string();
            let params = params.to_vec();
            async move {
                let mut guard = state.lock().expect("lock poisoned");
                guard.executed.push((sql, params.clone()));
                let id = params.last().and_then(Value::as_i64).unwrap_or_default();
                if guard.fail_updates_for.contains(&id) {
                    return Outcome::Err(Error::DataAccess(DataAccessError::new(
                        DataAccessErrorKind::Query,
                        "constraint violation",
                    )));
                }
                Outcome::Ok(1)
            }
        }
    }

    fn person_row(id: i64, first: &str, last: &str) -> Row {
        Row::new(
            vec![
                "id".to_string(),
                "first_name".to_string(),
                "last_name".to_string(),
            ],
            vec![
                Value::BigInt(id),
                Value::Text(first.to_string()),
                Value::Text(last.to_string()),
            ],
        )
    }

    fn seeded_state() -> Arc<Mutex<MockState>> {
        Arc::new(Mutex::new(MockState {
            rows: vec![person_row(1, "Ann", "Lee"), person_row(2, "Bob", "Ray")],
            ..MockState::default()
        }))
    }

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert!(config.check_single_row);
        assert!(config.refresh_snapshots_on_flush);

        let config = SessionConfig::new().check_single_row(false);
        assert!(!config.check_single_row);
    }

    #[test]
    fn test_find_loads_and_caches() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = seeded_state();
        let mut session = Session::new(MockProvider::new(Arc::clone(&state)));

        rt.block_on(async {
            let a = unwrap_outcome(session.find::<Person>(&cx, 1_i64).await);
            let b = unwrap_outcome(session.find::<Person>(&cx, 1_i64).await);
            assert!(Arc::ptr_eq(&a, &b));
            assert_eq!(a.read().unwrap().first_name, "Ann");
        });

        let guard = state.lock().unwrap();
        assert_eq!(guard.queries.len(), 1);
        assert_eq!(guard.queries[0].0, "SELECT * FROM users WHERE id = ?");
        assert_eq!(guard.queries[0].1, vec![Value::BigInt(1)]);
        assert_eq!(guard.acquired, guard.released);
    }

    #[test]
    fn test_find_uses_connection_dialect() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = seeded_state();
        let mut provider = MockProvider::new(Arc::clone(&state));
        provider.dialect = Dialect::Postgres;
        let mut session = Session::new(provider);

        rt.block_on(async {
            unwrap_outcome(session.find::<Person>(&cx, 1_i64).await);
        });

        assert_eq!(
            state.lock().unwrap().queries[0].0,
            "SELECT * FROM users WHERE id = $1"
        );
    }

    #[test]
    fn test_not_found_is_not_cached() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = seeded_state();
        let mut session = Session::new(MockProvider::new(Arc::clone(&state)));

        rt.block_on(async {
            let err = unwrap_err(session.find::<Person>(&cx, 42_i64).await);
            assert!(err.is_not_found());
            let err = unwrap_err(session.find::<Person>(&cx, 42_i64).await);
            assert!(err.is_not_found());
        });

        assert!(session.is_empty());
        let guard = state.lock().unwrap();
        assert_eq!(guard.queries.len(), 2);
        assert_eq!(guard.acquired, guard.released);
    }

    #[test]
    fn test_multiple_rows() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = seeded_state();
        state.lock().unwrap().duplicate_rows = true;

        let mut strict = Session::new(MockProvider::new(Arc::clone(&state)));
        let mut lenient = Session::with_config(
            MockProvider::new(Arc::clone(&state)),
            SessionConfig::new().check_single_row(false),
        );

        rt.block_on(async {
            let err = unwrap_err(strict.find::<Person>(&cx, 1_i64).await);
            assert!(matches!(err, Error::DataIntegrity(_)));
            assert!(strict.is_empty());

            let person = unwrap_outcome(lenient.find::<Person>(&cx, 1_i64).await);
            assert_eq!(person.read().unwrap().id, 1);
        });
    }

    #[test]
    fn test_connection_failure_is_data_access() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = seeded_state();
        state.lock().unwrap().fail_acquire = true;
        let mut session = Session::new(MockProvider::new(Arc::clone(&state)));

        rt.block_on(async {
            let err = unwrap_err(session.find::<Person>(&cx, 1_i64).await);
            match err {
                Error::DataAccess(e) => assert_eq!(e.kind, DataAccessErrorKind::Connection),
                other => panic!("expected data access error, got {other:?}"),
            }
        });
        assert!(session.is_empty());
    }

    #[test]
    fn test_query_failure_is_data_access_and_releases_connection() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = seeded_state();
        state.lock().unwrap().fail_query = true;
        let mut session = Session::new(MockProvider::new(Arc::clone(&state)));

        rt.block_on(async {
            match unwrap_err(session.find::<Person>(&cx, 1_i64).await) {
                Error::DataAccess(e) => {
                    assert_eq!(e.kind, DataAccessErrorKind::Query);
                    assert_eq!(e.sql.as_deref(), Some("SELECT * FROM users WHERE id = ?"));
                    assert!(e.source.is_some());
                }
                other => panic!("expected data access error, got {other:?}"),
            }
        });

        assert!(session.is_empty());
        assert!(!session.contains(&EntityKey::of::<Person>(1_i64)));
        let guard = state.lock().unwrap();
        assert_eq!(guard.acquired, 1);
        assert_eq!(guard.acquired, guard.released);
    }

    #[test]
    fn test_close_with_write_guard_held_reports_failure() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = seeded_state();
        let mut session = Session::new(MockProvider::new(Arc::clone(&state)));

        rt.block_on(async {
            let ann = unwrap_outcome(session.find::<Person>(&cx, 1_i64).await);
            let bob = unwrap_outcome(session.find::<Person>(&cx, 2_i64).await);
            bob.write().unwrap().first_name = "Rob".to_string();

            let mut held = ann.write().unwrap();
            held.first_name = "Anne".to_string();
            assert!(session.dirty_columns(&EntityKey::of::<Person>(1_i64)).is_empty());

            match unwrap_err(session.close(&cx).await) {
                Error::Flush(e) => {
                    assert_eq!(e.failed(), 1);
                    assert_eq!(e.succeeded, 1);
                    assert_eq!(e.failures[0].key, "Person#1");
                    assert!(matches!(e.failures[0].error, Error::Invariant(_)));
                }
                other => panic!("expected flush error, got {other:?}"),
            }
            drop(held);
        });

        let guard = state.lock().unwrap();
        assert_eq!(guard.executed.len(), 1);
        assert_eq!(
            guard.executed[0].1,
            vec![Value::Text("Rob".to_string()), Value::BigInt(2)]
        );
    }

    #[test]
    fn test_mapping_error_before_any_query() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = seeded_state();
        let mut session = Session::new(MockProvider::new(Arc::clone(&state)));

        rt.block_on(async {
            let err = unwrap_err(session.find::<Unmapped>(&cx, 1_i64).await);
            match err {
                Error::Mapping(e) => assert_eq!(e.kind, MappingErrorKind::MissingPrimaryKey),
                other => panic!("expected mapping error, got {other:?}"),
            }
        });

        let guard = state.lock().unwrap();
        assert_eq!(guard.acquired, 0);
        assert!(guard.queries.is_empty());
    }

    #[test]
    fn test_flush_updates_changed_column_once() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = seeded_state();
        let mut session = Session::new(MockProvider::new(Arc::clone(&state)));

        rt.block_on(async {
            let person = unwrap_outcome(session.find::<Person>(&cx, 1_i64).await);
            person.write().unwrap().first_name = "Bea".to_string();
            let key = EntityKey::of::<Person>(1_i64);
            assert!(session.is_dirty(&key));
            assert_eq!(session.dirty_columns(&key), vec!["first_name".to_string()]);

            let report = unwrap_outcome(session.flush(&cx).await);
            assert_eq!(report.statements(), 1);
            assert!(!session.is_dirty(&key));

            let report = unwrap_outcome(session.flush(&cx).await);
            assert!(report.is_empty());
            assert_eq!(report.clean, 1);
        });

        let guard = state.lock().unwrap();
        assert_eq!(guard.executed.len(), 1);
        assert_eq!(
            guard.executed[0].0,
            "UPDATE users SET first_name = ? WHERE id = ?"
        );
        assert_eq!(
            guard.executed[0].1,
            vec![Value::Text("Bea".to_string()), Value::BigInt(1)]
        );
    }

    #[test]
    fn test_flush_without_refresh_repeats_update() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = seeded_state();
        let mut session = Session::with_config(
            MockProvider::new(Arc::clone(&state)),
            SessionConfig::new().refresh_snapshots_on_flush(false),
        );

        rt.block_on(async {
            let person = unwrap_outcome(session.find::<Person>(&cx, 1_i64).await);
            person.write().unwrap().last_name = "Kim".to_string();
            unwrap_outcome(session.flush(&cx).await);
            unwrap_outcome(session.flush(&cx).await);
        });

        assert_eq!(state.lock().unwrap().executed.len(), 2);
    }

    #[test]
    fn test_close_then_operations_fail() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = seeded_state();
        let mut session = Session::new(MockProvider::new(Arc::clone(&state)));

        rt.block_on(async {
            unwrap_outcome(session.find::<Person>(&cx, 1_i64).await);
            let report = unwrap_outcome(session.close(&cx).await);
            assert!(report.is_empty());
            assert!(session.is_closed());
            assert_eq!(session.state(), SessionState::Closed);
            assert!(session.is_empty());

            assert!(matches!(
                unwrap_err(session.find::<Person>(&cx, 1_i64).await),
                Error::SessionClosed
            ));
            assert!(matches!(
                unwrap_err(session.flush(&cx).await),
                Error::SessionClosed
            ));
            assert!(matches!(
                unwrap_err(session.close(&cx).await),
                Error::SessionClosed
            ));
        });
    }

    #[test]
    fn test_close_collects_failures_and_still_closes() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = seeded_state();
        state.lock().unwrap().fail_updates_for.insert(1);
        let mut session = Session::new(MockProvider::new(Arc::clone(&state)));

        rt.block_on(async {
            let ann = unwrap_outcome(session.find::<Person>(&cx, 1_i64).await);
            let bob = unwrap_outcome(session.find::<Person>(&cx, 2_i64).await);
            ann.write().unwrap().first_name = "Anne".to_string();
            bob.write().unwrap().first_name = "Rob".to_string();

            match unwrap_err(session.close(&cx).await) {
                Error::Flush(e) => {
                    assert_eq!(e.failed(), 1);
                    assert_eq!(e.succeeded, 1);
                    assert_eq!(e.failures[0].key, "Person#1");
                }
                other => panic!("expected flush error, got {other:?}"),
            }
            assert!(session.is_closed());
        });

        let guard = state.lock().unwrap();
        assert_eq!(guard.executed.len(), 2);
        assert_eq!(guard.acquired, guard.released);
    }

    #[test]
    fn test_evict_forces_reload() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = seeded_state();
        let mut session = Session::new(MockProvider::new(Arc::clone(&state)));
        let key = EntityKey::of::<Person>(1_i64);

        rt.block_on(async {
            let first = unwrap_outcome(session.find::<Person>(&cx, 1_i64).await);
            first.write().unwrap().first_name = "Changed".to_string();
            assert!(session.evict(&key));
            assert!(!session.contains(&key));

            let second = unwrap_outcome(session.find::<Person>(&cx, 1_i64).await);
            assert!(!Arc::ptr_eq(&first, &second));
            assert_eq!(second.read().unwrap().first_name, "Ann");
        });

        assert_eq!(state.lock().unwrap().queries.len(), 2);
        let info = session.debug_state();
        assert_eq!(info.tracked, 1);
        assert_eq!(info.snapshots, 1);
        assert_eq!(info.dirty, 0);
        assert!(!info.closed);
    }

    #[test]
    fn test_factory_sessions_are_independent() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = seeded_state();
        let factory = SessionFactory::new(MockProvider::new(Arc::clone(&state)));

        let mut one = factory.create_session();
        let mut two = factory.create_session();

        rt.block_on(async {
            let a = unwrap_outcome(one.find::<Person>(&cx, 1_i64).await);
            let b = unwrap_outcome(two.find::<Person>(&cx, 1_i64).await);
            assert!(!Arc::ptr_eq(&a, &b));
        });

        assert_eq!(state.lock().unwrap().queries.len(), 2);
        assert!(factory.config().check_single_row);
        assert!(one.config().check_single_row);
        assert_eq!(one.state(), SessionState::Open);
    }
}
