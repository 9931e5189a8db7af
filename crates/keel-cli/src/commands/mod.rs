//! Subcommands

pub mod conflict;
pub mod demo;
pub mod migrate;

use std::error::Error;

use keel_store::migrations::{apply_migrations, demo_migrations};
use keel_store::SqliteGateway;

use crate::config::CliConfig;

/// Open the configured database, creating it and its schema if needed
pub(crate) fn open_database(config: &CliConfig) -> Result<SqliteGateway, Box<dyn Error>> {
    if let Some(parent) = config.database.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut gateway = SqliteGateway::open(&config.database)?;
    apply_migrations(gateway.connection_mut(), &demo_migrations())?;
    Ok(gateway)
}

/// Render identities as a comma separated list, `-` when empty
pub(crate) fn list<T: std::fmt::Display>(items: &[T]) -> String {
    if items.is_empty() {
        return "-".to_string();
    }
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
