//! Keel Store - SQLite storage for Keel sessions
//!
//! Provides:
//! - Connection helpers (foreign keys on, WAL for file databases)
//! - Migration runner with checksums and idempotent re-application
//! - [`SqliteGateway`], a `StorageGateway` running each flush batch in
//!   one transaction

pub mod db;
pub mod errors;
pub mod gateway;
pub mod migrations;

// Re-export key types
pub use errors::Result;
pub use gateway::SqliteGateway;
