//! Error helpers for keel-store
//!
//! Store failures surface as `KeelError::Storage`, tagged with the operation
//! that hit them.

use keel_core::KeelError;

/// Result type alias using KeelError
pub type Result<T> = std::result::Result<T, KeelError>;

/// Wrap a rusqlite error raised while running `op`
pub fn from_rusqlite(op: &str, err: rusqlite::Error) -> KeelError {
    KeelError::Storage {
        op: op.to_string(),
        message: err.to_string(),
    }
}

/// Create a migration error
pub fn migration_error(migration_id: &str, reason: &str) -> KeelError {
    KeelError::Storage {
        op: "migration".to_string(),
        message: format!("Migration {} failed: {}", migration_id, reason),
    }
}

/// Create a checksum mismatch error
pub fn checksum_mismatch(migration_id: &str, expected: &str, actual: &str) -> KeelError {
    KeelError::Storage {
        op: "migration_checksum".to_string(),
        message: format!(
            "Checksum mismatch for migration {}: expected {}, got {}",
            migration_id, expected, actual
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_rusqlite_keeps_operation() {
        let err = from_rusqlite("load", rusqlite::Error::QueryReturnedNoRows);
        match err {
            KeelError::Storage { op, message } => {
                assert_eq!(op, "load");
                assert!(!message.is_empty());
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
