//! Core types shared across Keel crates
//!
//! This crate provides foundational types used by the persistence engine,
//! its error facility and its logging facility:
//!
//! - **Correlation types**: SessionId, FlushId, UnitOfWorkContext
//! - **Schema constants**: Canonical field keys and event names

pub mod correlation;
pub mod schema;

pub use correlation::{FlushId, SessionId, UnitOfWorkContext};
