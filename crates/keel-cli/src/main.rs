//! Keel CLI
//!
//! Demo program running Keel sessions against a SQLite database

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use keel_core::logging_facility::{self, Profile};

mod commands;
mod config;
mod domain;

use config::{CliConfig, Overrides};

#[derive(Debug, Parser)]
#[command(name = "keel")]
#[command(about = "Keel - persistence unit of work demo", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database file
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Log output: development, production or test
    #[arg(long, global = true)]
    log_profile: Option<Profile>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create or upgrade the demo schema
    Migrate(commands::migrate::MigrateArgs),
    /// Run the pirate walkthrough: insert, update, orphan removal, merge
    Demo(commands::demo::DemoArgs),
    /// Race two writers and retry the loser's unit of work
    Conflict(commands::conflict::ConflictArgs),
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = CliConfig::load(cli.config.as_deref())?.apply(Overrides {
        database: cli.db,
        log_profile: cli.log_profile,
        max_attempts: None,
    });
    logging_facility::init(config.log_profile);

    match cli.command {
        Commands::Migrate(args) => commands::migrate::execute(args, &config),
        Commands::Demo(args) => commands::demo::execute(args, &config),
        Commands::Conflict(args) => commands::conflict::execute(args, &config),
    }
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
