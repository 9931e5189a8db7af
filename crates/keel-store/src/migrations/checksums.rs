//! Migration checksums
//!
//! A checksum is the hex SHA-256 of the migration SQL with line endings
//! normalized to `\n`, so the same file checked out on another platform
//! still matches its recorded checksum.

use sha2::{Digest, Sha256};

/// Hex SHA-256 of `sql` after CRLF normalization
pub fn compute_checksum(sql: &str) -> String {
    let mut hasher = Sha256::new();
    for (index, line) in sql.split("\r\n").enumerate() {
        if index > 0 {
            hasher.update(b"\n");
        }
        hasher.update(line.as_bytes());
    }
    hex::encode(hasher.finalize())
}
