//! SELECT and UPDATE by primary key.

use rowmap_core::{ColumnMetadata, Dialect, Error, Result, TableMetadata, Value};

/// SQL text plus its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// A column whose value differs from its snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangedColumn {
    pub column: String,
    pub value: Value,
}

impl ChangedColumn {
    pub fn new(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }
}

fn table_name(metadata: &TableMetadata) -> Result<&str> {
    if metadata.table_name.is_empty() {
        return Err(Error::Invariant("table name is empty".to_string()));
    }
    Ok(&metadata.table_name)
}

fn primary_key(metadata: &TableMetadata) -> Result<&ColumnMetadata> {
    let pk = metadata.primary_key().ok_or_else(|| {
        Error::Invariant(format!(
            "table '{}' does not have exactly one primary-key column",
            metadata.table_name
        ))
    })?;
    if pk.column_name.is_empty() {
        return Err(Error::Invariant(format!(
            "primary-key column of '{}' has an empty name",
            metadata.table_name
        )));
    }
    Ok(pk)
}

/// SELECT * by primary key.
#[derive(Debug, Clone)]
pub struct SelectByKey<'a> {
    metadata: &'a TableMetadata,
    dialect: Dialect,
}

impl<'a> SelectByKey<'a> {
    pub fn new(metadata: &'a TableMetadata) -> Self {
        Self {
            metadata,
            dialect: Dialect::default(),
        }
    }

    /// Set the placeholder dialect.
    pub fn dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    /// Build the SQL text.
    pub fn build(&self) -> Result<String> {
        let table = table_name(self.metadata)?;
        let pk = primary_key(self.metadata)?;
        Ok(format!(
            "SELECT * FROM {} WHERE {} = {}",
            table,
            pk.column_name,
            self.dialect.placeholder(1)
        ))
    }

    /// Build the SQL and bind the primary-key value.
    pub fn bind(&self, key: Value) -> Result<Statement> {
        Ok(Statement {
            sql: self.build()?,
            params: vec![key],
        })
    }
}

/// UPDATE of the changed columns of one row, by primary key.
#[derive(Debug, Clone)]
pub struct UpdateByKey<'a> {
    metadata: &'a TableMetadata,
    changed: Vec<ChangedColumn>,
    dialect: Dialect,
}

impl<'a> UpdateByKey<'a> {
    pub fn new(metadata: &'a TableMetadata) -> Self {
        Self {
            metadata,
            changed: Vec::new(),
            dialect: Dialect::default(),
        }
    }

    /// Set the placeholder dialect.
    pub fn dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    /// Add a changed column. Order of calls is the order of the SET list.
    pub fn set(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.changed.push(ChangedColumn::new(column, value));
        self
    }

    /// Replace the changed-column list.
    pub fn changed(mut self, changed: Vec<ChangedColumn>) -> Self {
        self.changed = changed;
        self
    }

    /// Build the SQL text.
    pub fn build(&self) -> Result<String> {
        let table = table_name(self.metadata)?;
        let pk = primary_key(self.metadata)?;
        if self.changed.is_empty() {
            return Err(Error::Invariant(format!(
                "update of '{table}' requested with no changed columns"
            )));
        }

        let mut set_clauses = Vec::with_capacity(self.changed.len());
        for (i, change) in self.changed.iter().enumerate() {
            if change.column.is_empty() {
                return Err(Error::Invariant(format!(
                    "update of '{table}' names an empty column"
                )));
            }
            set_clauses.push(format!(
                "{} = {}",
                change.column,
                self.dialect.placeholder(i + 1)
            ));
        }

        Ok(format!(
            "UPDATE {} SET {} WHERE {} = {}",
            table,
            set_clauses.join(", "),
            pk.column_name,
            self.dialect.placeholder(self.changed.len() + 1)
        ))
    }

    /// Build the SQL and bind the changed values followed by the primary key.
    pub fn bind(self, key: Value) -> Result<Statement> {
        let sql = self.build()?;
        let mut params: Vec<Value> = self.changed.into_iter().map(|c| c.value).collect();
        params.push(key);
        tracing::trace!(sql = %sql, params = params.len(), "Built update statement");
        Ok(Statement { sql, params })
    }
}

/// `SELECT * FROM <table> WHERE <pk> = ?` in the given dialect.
pub fn build_select_by_key(metadata: &TableMetadata, dialect: Dialect) -> Result<String> {
    SelectByKey::new(metadata).dialect(dialect).build()
}

/// `UPDATE <table> SET <c1> = ?, ... WHERE <pk> = ?` in the given dialect.
pub fn build_update_by_key(
    metadata: &TableMetadata,
    changed: &[ChangedColumn],
    dialect: Dialect,
) -> Result<String> {
    UpdateByKey::new(metadata)
        .changed(changed.to_vec())
        .dialect(dialect)
        .build()
}
