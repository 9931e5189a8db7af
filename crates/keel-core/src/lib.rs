//! Keel Core - persistence unit of work
//!
//! This crate tracks in-memory entity instances on behalf of one unit of
//! work and synchronizes their changes to storage in atomic batches:
//! - Entity descriptors and a validated registry of mapped types
//! - Identity map guaranteeing one instance per row per session
//! - Snapshot-based dirty checking with minimal updates
//! - Cascading persist, remove, merge, refresh and detach
//! - Foreign-key ordered flushes with optimistic version checks
//!
//! Storage is reached only through the [`gateway::StorageGateway`] trait;
//! an in-memory implementation ships here, SQLite lives in `keel-store`.

pub(crate) mod cascade;
pub(crate) mod concurrency;
pub mod config;
pub mod errors;
pub mod flush;
pub mod gateway;
pub mod identity_map;
pub mod keygen;
pub mod logging_facility;
pub mod model;
pub mod registry;
pub mod relations;
pub mod session;
pub mod snapshot;

#[doc(hidden)]
pub use keel_core_types as core_types;

// Re-export commonly used types
pub use config::{FlushMode, SessionConfig};
pub use errors::{ExError, ExErrorKind, KeelError, Result};
pub use flush::{ChangeSet, FlushSummary};
pub use gateway::{MemoryGateway, StorageGateway};
pub use keygen::{KeyGenerator, SequenceKeyGenerator, UuidKeyGenerator};
pub use model::{Entity, EntityRef, EntityState, Identity, Key, Related, Row, Value};
pub use registry::{CascadeOp, EntityDescriptor, Registry};
pub use session::Session;
