//! Optimistic concurrency control
//!
//! Versioned entity types carry an integer token. Updates and deletes are
//! conditional on the token the session last saw; updates also advance it.
//! A conditional write that matches no row means someone else changed or
//! deleted the row first.

use crate::errors::{KeelError, Result};
use crate::gateway::{Batch, BatchResult, OperationKind, OperationOutcome, VersionCheck};
use crate::registry::EntityDescriptor;

/// Condition for an update or delete of a versioned entity
pub(crate) fn version_check(descriptor: &EntityDescriptor, token: Option<i64>) -> Option<VersionCheck> {
    match (descriptor.version_column(), token) {
        (Some(column), Some(expected)) => Some(VersionCheck { column, expected }),
        _ => None,
    }
}

/// Token written by a successful update
pub(crate) fn next_version(token: i64) -> i64 {
    token.wrapping_add(1)
}

/// Turn gateway outcomes into the flush result
///
/// # Errors
///
/// - `StaleVersionConflict` for an update or delete that matched no row
/// - `ConstraintViolation` for a write storage refused
/// - `Internal` if the outcomes do not line up with the batch
pub(crate) fn interpret(batch: &Batch, result: &BatchResult) -> Result<()> {
    if result.outcomes().len() != batch.len() {
        return Err(KeelError::Internal {
            message: format!(
                "gateway returned {} outcomes for {} operations",
                result.outcomes().len(),
                batch.len()
            ),
        });
    }

    for (operation, outcome) in batch.operations().iter().zip(result.outcomes()) {
        match outcome {
            OperationOutcome::Success | OperationOutcome::Skipped => {}
            OperationOutcome::NoRowsMatched => {
                if let OperationKind::Insert { .. } = operation.kind {
                    return Err(KeelError::ConstraintViolation {
                        identity: operation.identity.clone(),
                        message: "insert affected no rows".to_string(),
                    });
                }
                return Err(KeelError::StaleVersionConflict {
                    identity: operation.identity.clone(),
                    expected_version: operation.version_check().map(|check| check.expected),
                });
            }
            OperationOutcome::ConstraintError(message) => {
                return Err(KeelError::ConstraintViolation {
                    identity: operation.identity.clone(),
                    message: message.clone(),
                });
            }
        }
    }

    if !result.is_success() {
        return Err(KeelError::Internal {
            message: "gateway skipped operations without reporting a failure".to_string(),
        });
    }
    Ok(())
}
