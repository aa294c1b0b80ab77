//! Error types for rowmap operations.

use std::fmt;

/// The primary error type for all rowmap operations.
#[derive(Debug)]
pub enum Error {
    /// Entity mapping is misconfigured (missing column, bad primary key, bad identifier)
    Mapping(MappingError),
    /// No row exists for the requested key
    NotFound(NotFoundError),
    /// The database returned data that contradicts the mapping
    DataIntegrity(DataIntegrityError),
    /// Connection or query failure reported by the connection provider
    DataAccess(DataAccessError),
    /// Internal contract violation inside rowmap itself
    Invariant(String),
    /// Operation attempted on a closed session
    SessionClosed,
    /// One or more entities failed to flush
    Flush(FlushError),
}

#[derive(Debug)]
pub struct MappingError {
    pub entity: String,
    pub kind: MappingErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingErrorKind {
    /// A persistable field has no column name
    MissingColumn,
    /// No field is designated primary key
    MissingPrimaryKey,
    /// More than one field is designated primary key
    MultiplePrimaryKeys,
    /// Table or column name is empty or not a plain SQL identifier
    InvalidIdentifier,
    /// Two fields share a name
    DuplicateField,
    /// Two fields map to the same column
    DuplicateColumn,
}

#[derive(Debug)]
pub struct NotFoundError {
    pub table: String,
    pub key: String,
}

#[derive(Debug)]
pub struct DataIntegrityError {
    pub table: Option<String>,
    pub column: Option<String>,
    pub message: String,
}

#[derive(Debug)]
pub struct DataAccessError {
    pub kind: DataAccessErrorKind,
    pub sql: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataAccessErrorKind {
    /// Failed to acquire a connection from the provider
    Connection,
    /// Statement execution failed
    Query,
    /// Provider-level timeout
    Timeout,
    /// Operation was cancelled via asupersync
    Cancelled,
}

/// Aggregate of per-entity failures collected during a flush.
///
/// Every dirty entity is attempted; successful updates stay applied even
/// when this error is returned.
#[derive(Debug, Default)]
pub struct FlushError {
    pub failures: Vec<FlushFailure>,
    /// Number of UPDATE statements that succeeded
    pub succeeded: usize,
}

/// A single entity that failed to flush.
#[derive(Debug)]
pub struct FlushFailure {
    /// Rendered entity key, e.g. `Person#1`
    pub key: String,
    pub error: Error,
}

impl MappingError {
    pub fn new(
        entity: impl Into<String>,
        kind: MappingErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            entity: entity.into(),
            kind,
            message: message.into(),
        }
    }
}

impl DataIntegrityError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            table: None,
            column: None,
            message: message.into(),
        }
    }

    /// A value could not be converted to the field's Rust type.
    pub fn conversion(expected: &'static str, actual: &str) -> Self {
        Self::new(format!("expected {expected}, found {actual}"))
    }

    #[must_use]
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    #[must_use]
    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }
}

impl DataAccessError {
    pub fn new(kind: DataAccessErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            sql: None,
            message: message.into(),
            source: None,
        }
    }

    #[must_use]
    pub fn sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }

    #[must_use]
    pub fn source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl FlushError {
    /// Number of entities that failed.
    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

impl Error {
    /// Wrap any error raised while talking to the database as a `DataAccess` error.
    ///
    /// Errors that already are `DataAccess` keep their kind and gain the SQL text
    /// if they had none; anything else becomes the `source` of a new `Query` error.
    #[must_use]
    pub fn into_data_access(self, kind: DataAccessErrorKind, sql: Option<&str>) -> Self {
        match self {
            Error::DataAccess(mut e) => {
                if e.sql.is_none() {
                    e.sql = sql.map(str::to_string);
                }
                Error::DataAccess(e)
            }
            other => {
                let mut err = DataAccessError::new(kind, other.to_string()).source(other);
                err.sql = sql.map(str::to_string);
                Error::DataAccess(err)
            }
        }
    }

    /// Is this a missing-row error?
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Is this a retryable error (provider timeout or connection failure)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::DataAccess(e) => matches!(
                e.kind,
                DataAccessErrorKind::Timeout | DataAccessErrorKind::Connection
            ),
            _ => false,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::DataAccess(e) => e.sql.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Mapping(e) => write!(f, "Mapping error: {}", e),
            Error::NotFound(e) => write!(f, "Not found: {}", e),
            Error::DataIntegrity(e) => write!(f, "Data integrity error: {}", e),
            Error::DataAccess(e) => write!(f, "Data access error: {}", e),
            Error::Invariant(msg) => write!(f, "Invariant violated: {}", msg),
            Error::SessionClosed => write!(f, "Session is closed"),
            Error::Flush(e) => write!(f, "Flush failed: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::DataAccess(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Flush(e) => e
                .failures
                .first()
                .map(|failure| &failure.error as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.entity, self.message)
    }
}

impl fmt::Display for NotFoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no row in '{}' for key {}", self.table, self.key)
    }
}

impl fmt::Display for DataIntegrityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.table, &self.column) {
            (Some(table), Some(column)) => write!(f, "{}.{}: {}", table, column, self.message),
            (Some(table), None) => write!(f, "{}: {}", table, self.message),
            (None, Some(column)) => write!(f, "column '{}': {}", column, self.message),
            (None, None) => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for DataAccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sql) = &self.sql {
            write!(f, "{} (SQL: {})", self.message, sql)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for FlushError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.failures.len() == 1 {
            let failure = &self.failures[0];
            write!(f, "update of {} failed: {}", failure.key, failure.error)
        } else {
            writeln!(
                f,
                "{} entities failed to update ({} succeeded):",
                self.failures.len(),
                self.succeeded
            )?;
            for failure in &self.failures {
                writeln!(f, "  - {}: {}", failure.key, failure.error)?;
            }
            Ok(())
        }
    }
}

impl std::error::Error for FlushError {}

impl From<MappingError> for Error {
    fn from(err: MappingError) -> Self {
        Error::Mapping(err)
    }
}

impl From<NotFoundError> for Error {
    fn from(err: NotFoundError) -> Self {
        Error::NotFound(err)
    }
}

impl From<DataIntegrityError> for Error {
    fn from(err: DataIntegrityError) -> Self {
        Error::DataIntegrity(err)
    }
}

impl From<DataAccessError> for Error {
    fn from(err: DataAccessError) -> Self {
        Error::DataAccess(err)
    }
}

impl From<FlushError> for Error {
    fn from(err: FlushError) -> Self {
        Error::Flush(err)
    }
}

/// Result type alias for rowmap operations.
pub type Result<T> = std::result::Result<T, Error>;
