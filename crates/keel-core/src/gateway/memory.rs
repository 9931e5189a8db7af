//! In-memory storage gateway
//!
//! Applies each batch to a staged copy of its tables and swaps it in only
//! when every operation succeeded. Optional foreign-key and check rules
//! let tests exercise constraint failures without a database.

use std::collections::BTreeMap;
use std::fmt;

use super::{Batch, BatchResult, Operation, OperationKind, OperationOutcome, StorageGateway, VersionCheck};
use crate::errors::{KeelError, Result};
use crate::model::{Key, Row, Value};

type Tables = BTreeMap<String, BTreeMap<Key, Row>>;
type CheckFn = Box<dyn Fn(&Row) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
struct ForeignKey {
    table: String,
    column: String,
    references: String,
}

struct CheckRule {
    table: String,
    name: String,
    rule: CheckFn,
}

/// Counters for asserting how often storage was touched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatewayStats {
    pub batches: u64,
    pub operations: u64,
}

#[derive(Default)]
pub struct MemoryGateway {
    tables: Tables,
    foreign_keys: Vec<ForeignKey>,
    checks: Vec<CheckRule>,
    stats: GatewayStats,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enforce `table.column -> references` on insert, update and delete
    pub fn with_foreign_key(mut self, table: &str, column: &str, references: &str) -> Self {
        self.foreign_keys.push(ForeignKey {
            table: table.to_string(),
            column: column.to_string(),
            references: references.to_string(),
        });
        self
    }

    /// Reject rows of `table` for which `rule` returns false
    pub fn with_check(
        mut self,
        table: &str,
        name: &str,
        rule: impl Fn(&Row) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.checks.push(CheckRule {
            table: table.to_string(),
            name: name.to_string(),
            rule: Box::new(rule),
        });
        self
    }

    /// Write a row directly, bypassing batches and rules
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the row lacks a usable key.
    pub fn seed(&mut self, table: &str, key_column: &str, row: Row) -> Result<()> {
        let key = row
            .get(key_column)
            .map(Key::from_value)
            .transpose()?
            .flatten()
            .ok_or_else(|| KeelError::Storage {
                op: "seed".to_string(),
                message: format!("row for {} has no {}", table, key_column),
            })?;
        self.tables.entry(table.to_string()).or_default().insert(key, row);
        Ok(())
    }

    pub fn row(&self, table: &str, key: impl Into<Key>) -> Option<&Row> {
        self.tables.get(table)?.get(&key.into())
    }

    pub fn rows(&self, table: &str) -> Vec<&Row> {
        self.tables
            .get(table)
            .map(|rows| rows.values().collect())
            .unwrap_or_default()
    }

    pub fn count(&self, table: &str) -> usize {
        self.tables.get(table).map_or(0, BTreeMap::len)
    }

    pub fn stats(&self) -> GatewayStats {
        self.stats
    }

    fn apply(&self, tables: &mut Tables, operation: &Operation) -> OperationOutcome {
        let key = operation.key();
        match &operation.kind {
            OperationKind::Insert { values } => {
                let mut row = values.clone();
                row.insert(operation.key_column.to_string(), key.to_value());
                if tables
                    .get(operation.table)
                    .is_some_and(|rows| rows.contains_key(key))
                {
                    return constraint(format!(
                        "duplicate key {} in {}",
                        key, operation.table
                    ));
                }
                if let Some(failure) = self.validate(tables, operation.table, &row) {
                    return failure;
                }
                tables
                    .entry(operation.table.to_string())
                    .or_default()
                    .insert(key.clone(), row);
                OperationOutcome::Success
            }
            OperationKind::Update { changes, version } => {
                let Some(current) = tables.get(operation.table).and_then(|rows| rows.get(key)) else {
                    return OperationOutcome::NoRowsMatched;
                };
                if !version_matches(current, version.as_ref()) {
                    return OperationOutcome::NoRowsMatched;
                }
                let mut row = current.clone();
                row.extend(changes.iter().map(|(column, value)| (column.clone(), value.clone())));
                if let Some(failure) = self.validate(tables, operation.table, &row) {
                    return failure;
                }
                tables
                    .entry(operation.table.to_string())
                    .or_default()
                    .insert(key.clone(), row);
                OperationOutcome::Success
            }
            OperationKind::Delete { version } => {
                let Some(current) = tables.get(operation.table).and_then(|rows| rows.get(key)) else {
                    return OperationOutcome::NoRowsMatched;
                };
                if !version_matches(current, version.as_ref()) {
                    return OperationOutcome::NoRowsMatched;
                }
                if let Some(referrer) = self.referrer(tables, operation.table, key) {
                    return constraint(format!(
                        "{} {} is still referenced by {}",
                        operation.table, key, referrer
                    ));
                }
                if let Some(rows) = tables.get_mut(operation.table) {
                    rows.remove(key);
                }
                OperationOutcome::Success
            }
        }
    }

    /// Outgoing foreign keys and check rules for a row about to be written
    fn validate(&self, tables: &Tables, table: &str, row: &Row) -> Option<OperationOutcome> {
        for fk in self.foreign_keys.iter().filter(|fk| fk.table == table) {
            let target = match row.get(&fk.column).map(Key::from_value) {
                Some(Ok(Some(target))) => target,
                Some(Ok(None)) | None => continue,
                Some(Err(err)) => return Some(constraint(err.to_string())),
            };
            let exists = tables
                .get(&fk.references)
                .is_some_and(|rows| rows.contains_key(&target));
            if !exists {
                return Some(constraint(format!(
                    "FOREIGN KEY constraint failed: {}.{} -> {} {}",
                    fk.table, fk.column, fk.references, target
                )));
            }
        }
        for check in self.checks.iter().filter(|check| check.table == table) {
            if !(check.rule)(row) {
                return Some(constraint(format!("CHECK constraint failed: {}", check.name)));
            }
        }
        None
    }

    /// A `table.column` describing some row that still references `key`
    fn referrer(&self, tables: &Tables, table: &str, key: &Key) -> Option<String> {
        let needle = key.to_value();
        self.foreign_keys
            .iter()
            .filter(|fk| fk.references == table)
            .find(|fk| {
                tables.get(&fk.table).is_some_and(|rows| {
                    rows.values().any(|row| row.get(&fk.column) == Some(&needle))
                })
            })
            .map(|fk| format!("{}.{}", fk.table, fk.column))
    }
}

fn version_matches(row: &Row, check: Option<&VersionCheck>) -> bool {
    match check {
        None => true,
        Some(check) => row.get(check.column) == Some(&Value::Int(check.expected)),
    }
}

fn constraint(message: String) -> OperationOutcome {
    OperationOutcome::ConstraintError(message)
}

impl StorageGateway for MemoryGateway {
    fn submit(&mut self, batch: &Batch) -> Result<BatchResult> {
        self.stats.batches += 1;
        self.stats.operations += batch.len() as u64;

        let mut staged = self.tables.clone();
        for (index, operation) in batch.operations().iter().enumerate() {
            let outcome = self.apply(&mut staged, operation);
            if outcome != OperationOutcome::Success {
                tracing::debug!(
                    index,
                    identity = %operation.identity,
                    outcome = ?outcome,
                    "memory batch rolled back"
                );
                return Ok(BatchResult::aborted_at(batch.len(), index, outcome));
            }
        }
        self.tables = staged;
        Ok(BatchResult::all_succeeded(batch.len()))
    }

    fn load(&self, table: &str, _key_column: &str, key: &Key) -> Result<Option<Row>> {
        Ok(self.tables.get(table).and_then(|rows| rows.get(key)).cloned())
    }

    fn load_referencing(&self, table: &str, column: &str, key: &Key) -> Result<Vec<Row>> {
        let needle = key.to_value();
        Ok(self
            .tables
            .get(table)
            .map(|rows| {
                rows.values()
                    .filter(|row| row.get(column) == Some(&needle))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

impl fmt::Debug for MemoryGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryGateway")
            .field("tables", &self.tables)
            .field("foreign_keys", &self.foreign_keys)
            .field("checks", &self.checks.iter().map(|c| c.name.as_str()).collect::<Vec<_>>())
            .field("stats", &self.stats)
            .finish()
    }
}
