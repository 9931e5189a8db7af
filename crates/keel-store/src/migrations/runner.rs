//! Migration runner
//!
//! Applies migrations in order, each in its own transaction, recording a
//! SHA-256 checksum per migration. Re-running is a no-op; a migration whose
//! SQL changed after it was applied is refused.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};

use crate::errors::{checksum_mismatch, from_rusqlite, migration_error, Result};
use crate::migrations::checksums::compute_checksum;
use crate::migrations::embedded::Migration;

/// A row of the `schema_version` table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    pub migration_id: String,
    pub applied_at: DateTime<Utc>,
    pub checksum: String,
}

/// Apply every pending migration; returns how many were applied
pub fn apply_migrations(conn: &mut Connection, migrations: &[Migration]) -> Result<usize> {
    create_schema_version_table(conn)?;

    let mut applied = 0;
    for migration in migrations {
        if apply_migration(conn, migration)? {
            applied += 1;
        }
    }
    tracing::info!(applied, total = migrations.len(), "migrations applied");
    Ok(applied)
}

/// Migrations recorded in the database, in application order
pub fn applied_migrations(conn: &Connection) -> Result<Vec<AppliedMigration>> {
    create_schema_version_table(conn)?;
    let mut stmt = conn
        .prepare("SELECT migration_id, applied_at, checksum FROM schema_version ORDER BY id")
        .map_err(|e| from_rusqlite("applied_migrations", e))?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })
        .map_err(|e| from_rusqlite("applied_migrations", e))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| from_rusqlite("applied_migrations", e))?;

    rows.into_iter()
        .map(|(migration_id, applied_at, checksum)| {
            let applied_at = DateTime::<Utc>::from_timestamp(applied_at, 0)
                .ok_or_else(|| migration_error(&migration_id, "invalid applied_at timestamp"))?;
            Ok(AppliedMigration {
                migration_id,
                applied_at,
                checksum,
            })
        })
        .collect()
}

/// Create the schema_version table if it doesn't exist
fn create_schema_version_table(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY,
            migration_id TEXT NOT NULL UNIQUE,
            applied_at INTEGER NOT NULL,
            checksum TEXT NOT NULL
        )",
        [],
    )
    .map_err(|e| from_rusqlite("migration", e))?;

    Ok(())
}

/// Apply a single migration unless already recorded; true if it ran
fn apply_migration(conn: &mut Connection, migration: &Migration) -> Result<bool> {
    let checksum = compute_checksum(migration.sql);

    let recorded: Option<String> = conn
        .query_row(
            "SELECT checksum FROM schema_version WHERE migration_id = ?1",
            [migration.id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| from_rusqlite("migration", e))?;

    if let Some(recorded) = recorded {
        if recorded != checksum {
            return Err(checksum_mismatch(migration.id, &recorded, &checksum));
        }
        return Ok(false);
    }

    let tx = conn.transaction().map_err(|e| from_rusqlite("migration", e))?;
    tx.execute_batch(migration.sql)
        .map_err(|e| migration_error(migration.id, &e.to_string()))?;

    let now = Utc::now().timestamp();
    tx.execute(
        "INSERT INTO schema_version (migration_id, applied_at, checksum) VALUES (?1, ?2, ?3)",
        rusqlite::params![migration.id, now, checksum],
    )
    .map_err(|e| from_rusqlite("migration", e))?;

    tx.commit().map_err(|e| from_rusqlite("migration", e))?;
    tracing::debug!(migration_id = migration.id, "migration applied");

    Ok(true)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::migrations::embedded::demo_migrations;

    #[test]
    fn test_apply_migrations() {
        let mut conn = Connection::open_in_memory().unwrap();
        let applied = apply_migrations(&mut conn, &demo_migrations()).unwrap();
        assert_eq!(applied, demo_migrations().len());
    }

    #[test]
    fn test_idempotency() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_migrations(&mut conn, &demo_migrations()).unwrap();
        let applied = apply_migrations(&mut conn, &demo_migrations()).unwrap();
        assert_eq!(applied, 0);
    }

    #[test]
    fn test_failed_migration_is_not_recorded() {
        let mut conn = Connection::open_in_memory().unwrap();
        let broken = Migration {
            id: "001_broken",
            sql: "CREATE TABLE t (id INTEGER PRIMARY KEY); CREATE TABLE t (id INTEGER);",
        };

        assert!(apply_migrations(&mut conn, &[broken]).is_err());

        assert!(applied_migrations(&conn).unwrap().is_empty());
    }
}
