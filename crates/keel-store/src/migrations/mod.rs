//! Migration framework
//!
//! Provides:
//! - Migration runner with checksums and mismatch detection
//! - Idempotent application
//! - Embedded SQL for the demo schema

mod checksums;
mod embedded;
mod runner;

pub use checksums::compute_checksum;
pub use embedded::{demo_migrations, Migration};
pub use runner::{applied_migrations, apply_migrations, AppliedMigration};
