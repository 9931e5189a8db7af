//! SQLite storage gateway
//!
//! Each submitted batch runs inside one transaction. The first operation
//! that matches no row or violates a constraint stops the batch and the
//! transaction is rolled back, so storage never sees part of a flush.

use std::path::Path;

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode, Transaction};

use keel_core::gateway::{
    Batch, BatchResult, Operation, OperationKind, OperationOutcome, StorageGateway, VersionCheck,
};
use keel_core::{KeelError, Key, Row, Value};

use crate::db;
use crate::errors::{from_rusqlite, Result};

/// `StorageGateway` over a rusqlite connection
pub struct SqliteGateway {
    conn: Connection,
}

impl SqliteGateway {
    /// Wrap an already configured connection
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Open (or create) a database file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        db::open(path).map(Self::new)
    }

    pub fn open_in_memory() -> Result<Self> {
        db::open_in_memory().map(Self::new)
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Mutable access, e.g. for running migrations
    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn into_inner(self) -> Connection {
        self.conn
    }

    /// Count rows of `table`
    pub fn count(&self, table: &str) -> Result<usize> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote(table));
        let count: i64 = self
            .conn
            .query_row(&sql, [], |row| row.get(0))
            .map_err(|e| from_rusqlite("count", e))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Largest integer key of `table`, for seeding key generators
    pub fn max_key(&self, table: &str, key_column: &str) -> Result<Option<i64>> {
        let sql = format!("SELECT MAX({}) FROM {}", quote(key_column), quote(table));
        self.conn
            .query_row(&sql, [], |row| row.get(0))
            .map_err(|e| from_rusqlite("max_key", e))
    }

    fn select(&self, op: &str, sql: &str, key: &Key) -> Result<Vec<Row>> {
        let mut stmt = self.conn.prepare(sql).map_err(|e| from_rusqlite(op, e))?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
        let mut rows = stmt
            .query([to_sql(&key.to_value())])
            .map_err(|e| from_rusqlite(op, e))?;

        let mut loaded = Vec::new();
        while let Some(row) = rows.next().map_err(|e| from_rusqlite(op, e))? {
            let mut values = Row::new();
            for (index, column) in columns.iter().enumerate() {
                let value = row.get_ref(index).map_err(|e| from_rusqlite(op, e))?;
                values.insert(column.clone(), from_sql(value)?);
            }
            loaded.push(values);
        }
        Ok(loaded)
    }
}

impl StorageGateway for SqliteGateway {
    fn submit(&mut self, batch: &Batch) -> Result<BatchResult> {
        let tx = self
            .conn
            .transaction()
            .map_err(|e| from_rusqlite("submit", e))?;
        for (index, operation) in batch.operations().iter().enumerate() {
            let outcome = execute(&tx, operation)?;
            if outcome != OperationOutcome::Success {
                tracing::debug!(
                    index,
                    identity = %operation.identity,
                    outcome = ?outcome,
                    "sqlite batch rolled back"
                );
                tx.rollback().map_err(|e| from_rusqlite("submit", e))?;
                return Ok(BatchResult::aborted_at(batch.len(), index, outcome));
            }
        }
        tx.commit().map_err(|e| from_rusqlite("submit", e))?;
        Ok(BatchResult::all_succeeded(batch.len()))
    }

    fn load(&self, table: &str, key_column: &str, key: &Key) -> Result<Option<Row>> {
        let sql = format!(
            "SELECT * FROM {} WHERE {} = ?1",
            quote(table),
            quote(key_column)
        );
        Ok(self.select("load", &sql, key)?.into_iter().next())
    }

    // Ordered by rowid, which is the key for INTEGER PRIMARY KEY tables.
    fn load_referencing(&self, table: &str, column: &str, key: &Key) -> Result<Vec<Row>> {
        let sql = format!(
            "SELECT * FROM {} WHERE {} = ?1 ORDER BY rowid",
            quote(table),
            quote(column)
        );
        self.select("load_referencing", &sql, key)
    }
}

impl std::fmt::Debug for SqliteGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteGateway")
            .field("path", &self.conn.path())
            .finish()
    }
}

/// Run one operation; zero affected rows and constraint failures become
/// outcomes, anything else is a storage error
fn execute(tx: &Transaction<'_>, operation: &Operation) -> Result<OperationOutcome> {
    let key = to_sql(&operation.key().to_value());
    let (sql, params) = match &operation.kind {
        OperationKind::Insert { values } => {
            let mut row = values.clone();
            row.insert(operation.key_column.to_string(), operation.key().to_value());
            let columns: Vec<String> = row.keys().map(|column| quote(column)).collect();
            let placeholders: Vec<String> = (1..=row.len()).map(|n| format!("?{}", n)).collect();
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote(operation.table),
                columns.join(", "),
                placeholders.join(", ")
            );
            (sql, row.values().map(to_sql).collect::<Vec<_>>())
        }
        OperationKind::Update { changes, version } => {
            let mut params: Vec<SqlValue> = changes.values().map(to_sql).collect();
            let mut assignments: Vec<String> = changes
                .keys()
                .enumerate()
                .map(|(n, column)| format!("{} = ?{}", quote(column), n + 1))
                .collect();
            if assignments.is_empty() {
                assignments.push(format!(
                    "{0} = {0}",
                    quote(operation.key_column)
                ));
            }
            params.push(key);
            let mut sql = format!(
                "UPDATE {} SET {} WHERE {} = ?{}",
                quote(operation.table),
                assignments.join(", "),
                quote(operation.key_column),
                params.len()
            );
            push_version_predicate(&mut sql, &mut params, version.as_ref());
            (sql, params)
        }
        OperationKind::Delete { version } => {
            let mut params = vec![key];
            let mut sql = format!(
                "DELETE FROM {} WHERE {} = ?1",
                quote(operation.table),
                quote(operation.key_column)
            );
            push_version_predicate(&mut sql, &mut params, version.as_ref());
            (sql, params)
        }
    };

    match tx.execute(&sql, params_from_iter(params.iter())) {
        Ok(0) => Ok(OperationOutcome::NoRowsMatched),
        Ok(_) => Ok(OperationOutcome::Success),
        Err(rusqlite::Error::SqliteFailure(failure, message))
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            Ok(OperationOutcome::ConstraintError(
                message.unwrap_or_else(|| failure.to_string()),
            ))
        }
        Err(err) => Err(from_rusqlite(operation.verb(), err)),
    }
}

fn push_version_predicate(sql: &mut String, params: &mut Vec<SqlValue>, check: Option<&VersionCheck>) {
    if let Some(check) = check {
        params.push(SqlValue::Integer(check.expected));
        sql.push_str(&format!(" AND {} = ?{}", quote(check.column), params.len()));
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(v) => SqlValue::Integer(i64::from(*v)),
        Value::Int(v) => SqlValue::Integer(*v),
        Value::Real(v) => SqlValue::Real(*v),
        Value::Text(v) => SqlValue::Text(v.clone()),
        Value::Bytes(v) => SqlValue::Blob(v.clone()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Result<Value> {
    Ok(match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::Int(v),
        ValueRef::Real(v) => Value::Real(v),
        ValueRef::Text(bytes) => {
            Value::Text(String::from_utf8(bytes.to_vec()).map_err(|e| KeelError::Storage {
                op: "load".to_string(),
                message: format!("invalid UTF-8 in text column: {}", e),
            })?)
        }
        ValueRef::Blob(bytes) => Value::Bytes(bytes.to_vec()),
    })
}
