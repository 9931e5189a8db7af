//! Storage gateway seam
//!
//! The flush coordinator hands one ordered [`Batch`] per flush to a
//! [`StorageGateway`]. The gateway applies it atomically: either every
//! operation takes effect, or none does and the [`BatchResult`] names the
//! failing operation.

pub mod memory;

use serde::Serialize;

pub use memory::{GatewayStats, MemoryGateway};

use crate::errors::Result;
use crate::model::{Identity, Key, Row};

/// Expected version token for a conditional update or delete
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionCheck {
    pub column: &'static str,
    pub expected: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum OperationKind {
    /// Full row, including key and version columns
    Insert { values: Row },
    /// Changed columns only, plus the new version when versioned
    Update {
        changes: Row,
        version: Option<VersionCheck>,
    },
    Delete { version: Option<VersionCheck> },
}

/// One row-level write
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Operation {
    pub identity: Identity,
    pub table: &'static str,
    pub key_column: &'static str,
    pub kind: OperationKind,
}

impl Operation {
    pub fn key(&self) -> &Key {
        &self.identity.key
    }

    pub fn version_check(&self) -> Option<&VersionCheck> {
        match &self.kind {
            OperationKind::Insert { .. } => None,
            OperationKind::Update { version, .. } | OperationKind::Delete { version } => {
                version.as_ref()
            }
        }
    }

    pub fn verb(&self) -> &'static str {
        match self.kind {
            OperationKind::Insert { .. } => "insert",
            OperationKind::Update { .. } => "update",
            OperationKind::Delete { .. } => "delete",
        }
    }
}

/// Ordered operations of one flush
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Batch {
    operations: Vec<Operation>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, operation: Operation) {
        self.operations.push(operation);
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum OperationOutcome {
    Success,
    /// Zero rows affected: the row is gone or its version moved on
    NoRowsMatched,
    /// Storage refused the write (unique, foreign key, check, ...)
    ConstraintError(String),
    /// Not attempted because an earlier operation failed
    Skipped,
}

/// Per-operation outcomes, aligned with the submitted batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    outcomes: Vec<OperationOutcome>,
}

impl BatchResult {
    pub fn new(outcomes: Vec<OperationOutcome>) -> Self {
        Self { outcomes }
    }

    pub fn all_succeeded(len: usize) -> Self {
        Self::new(vec![OperationOutcome::Success; len])
    }

    /// Operations before `index` succeeded, `index` failed, the rest skipped
    pub fn aborted_at(len: usize, index: usize, failure: OperationOutcome) -> Self {
        let outcomes = (0..len)
            .map(|position| match position.cmp(&index) {
                std::cmp::Ordering::Less => OperationOutcome::Success,
                std::cmp::Ordering::Equal => failure.clone(),
                std::cmp::Ordering::Greater => OperationOutcome::Skipped,
            })
            .collect();
        Self { outcomes }
    }

    pub fn outcomes(&self) -> &[OperationOutcome] {
        &self.outcomes
    }

    pub fn is_success(&self) -> bool {
        self.outcomes
            .iter()
            .all(|outcome| *outcome == OperationOutcome::Success)
    }
}

/// Storage backend for sessions
pub trait StorageGateway {
    /// Apply a batch atomically
    ///
    /// # Errors
    ///
    /// Returns `Storage` for transport failures; row-level failures are
    /// reported through the returned outcomes instead.
    fn submit(&mut self, batch: &Batch) -> Result<BatchResult>;

    /// Load one row by key
    ///
    /// # Errors
    ///
    /// Returns `Storage` on transport or SQL failure.
    fn load(&self, table: &str, key_column: &str, key: &Key) -> Result<Option<Row>>;

    /// Load every row whose `column` holds `key`, ordered by primary key
    ///
    /// # Errors
    ///
    /// Returns `Storage` on transport or SQL failure.
    fn load_referencing(&self, table: &str, column: &str, key: &Key) -> Result<Vec<Row>>;
}
