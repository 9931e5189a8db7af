use std::fmt;

use serde::Serialize;

use super::value::Value;
use crate::errors::{KeelError, Result};

/// Primary-key value of a row
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Key {
    Int(i64),
    Text(String),
}

impl Key {
    pub fn to_value(&self) -> Value {
        match self {
            Key::Int(v) => Value::Int(*v),
            Key::Text(v) => Value::Text(v.clone()),
        }
    }

    /// Read a key from a column value; `Null` means "no key"
    ///
    /// # Errors
    ///
    /// Returns `FieldTypeMismatch` for values that cannot be keys.
    pub fn from_value(value: &Value) -> Result<Option<Key>> {
        match value {
            Value::Null => Ok(None),
            Value::Int(v) => Ok(Some(Key::Int(*v))),
            Value::Text(v) => Ok(Some(Key::Text(v.clone()))),
            other => Err(KeelError::mismatch("key", other)),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(v) => write!(f, "{}", v),
            Key::Text(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for Key {
    fn from(v: i64) -> Self {
        Key::Int(v)
    }
}

impl From<i32> for Key {
    fn from(v: i32) -> Self {
        Key::Int(i64::from(v))
    }
}

impl From<String> for Key {
    fn from(v: String) -> Self {
        Key::Text(v)
    }
}

impl From<&str> for Key {
    fn from(v: &str) -> Self {
        Key::Text(v.to_string())
    }
}

impl From<Key> for Value {
    fn from(key: Key) -> Self {
        key.to_value()
    }
}

impl TryFrom<Key> for i64 {
    type Error = KeelError;

    fn try_from(key: Key) -> std::result::Result<Self, Self::Error> {
        match key {
            Key::Int(v) => Ok(v),
            other => Err(KeelError::mismatch("integer key", other)),
        }
    }
}

impl TryFrom<Key> for i32 {
    type Error = KeelError;

    fn try_from(key: Key) -> std::result::Result<Self, Self::Error> {
        match key {
            Key::Int(v) => i32::try_from(v).map_err(|_| KeelError::mismatch("32-bit integer key", v)),
            other => Err(KeelError::mismatch("integer key", other)),
        }
    }
}

impl TryFrom<Key> for String {
    type Error = KeelError;

    fn try_from(key: Key) -> std::result::Result<Self, Self::Error> {
        match key {
            Key::Text(v) => Ok(v),
            other => Err(KeelError::mismatch("text key", other)),
        }
    }
}

/// Marker for types usable as an entity's key field
pub trait KeyType: Clone + Into<Key> + TryFrom<Key, Error = KeelError> + 'static {}

impl<K> KeyType for K where K: Clone + Into<Key> + TryFrom<Key, Error = KeelError> + 'static {}

/// `(entity type, key)`: the sole basis of row identity within a session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Identity {
    pub entity_type: &'static str,
    pub key: Key,
}

impl Identity {
    pub fn new(entity_type: &'static str, key: impl Into<Key>) -> Self {
        Self {
            entity_type,
            key: key.into(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity_type, self.key)
    }
}
