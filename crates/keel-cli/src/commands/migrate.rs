//! Schema migration command

use std::error::Error;

use clap::Args;
use keel_store::migrations::applied_migrations;

use crate::config::CliConfig;

#[derive(Debug, Args)]
pub struct MigrateArgs {
    /// Only list migrations already applied
    #[arg(long)]
    pub status: bool,
}

pub fn execute(args: MigrateArgs, config: &CliConfig) -> Result<(), Box<dyn Error>> {
    let gateway = if args.status {
        keel_store::SqliteGateway::open(&config.database)?
    } else {
        super::open_database(config)?
    };

    let applied = applied_migrations(gateway.connection())?;
    if applied.is_empty() {
        println!("No migrations applied to {}", config.database.display());
    }
    for migration in applied {
        println!(
            "{}  applied {}  sha256 {}",
            migration.migration_id,
            migration.applied_at.to_rfc3339(),
            &migration.checksum[..12.min(migration.checksum.len())]
        );
    }
    Ok(())
}
