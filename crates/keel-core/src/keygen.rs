//! Key generation for new entities

use std::collections::HashMap;
use std::sync::Mutex;

use uuid::Uuid;

use crate::errors::{KeelError, Result};
use crate::model::Key;

/// Supplies keys for entities attached without one
///
/// Shared by all sessions of an application, hence `Send + Sync`.
pub trait KeyGenerator: Send + Sync {
    /// # Errors
    ///
    /// Implementations may fail if their key source is unavailable.
    fn next_key(&self, entity_type: &'static str) -> Result<Key>;
}

/// Per-type integer sequences starting at 1
#[derive(Debug, Default)]
pub struct SequenceKeyGenerator {
    last: Mutex<HashMap<&'static str, i64>>,
}

impl SequenceKeyGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue a sequence after keys already present in storage
    pub fn starting_after(self, entity_type: &'static str, last_key: i64) -> Self {
        if let Ok(mut last) = self.last.lock() {
            last.insert(entity_type, last_key);
        }
        self
    }
}

impl KeyGenerator for SequenceKeyGenerator {
    fn next_key(&self, entity_type: &'static str) -> Result<Key> {
        let mut last = self.last.lock().map_err(|_| KeelError::Internal {
            message: "key sequence lock poisoned".to_string(),
        })?;
        let next = last.entry(entity_type).or_insert(0);
        *next += 1;
        Ok(Key::Int(*next))
    }
}

/// Time-ordered UUIDv7 text keys
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidKeyGenerator;

impl KeyGenerator for UuidKeyGenerator {
    fn next_key(&self, _entity_type: &'static str) -> Result<Key> {
        Ok(Key::Text(Uuid::now_v7().to_string()))
    }
}
