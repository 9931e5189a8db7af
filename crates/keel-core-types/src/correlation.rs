//! Correlation types for unit-of-work tracking
//!
//! Every persistence session carries a `SessionId`, and every flush it
//! performs carries a `FlushId`, so log lines from one unit of work can be
//! grouped together.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a persistence session (one unit of work)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a new random SessionId using UUIDv7
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Get the string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Create from an existing string (for deserialization)
    pub fn from_string(s: String) -> Self {
        Self(s)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a single flush attempt within a session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlushId(String);

impl FlushId {
    /// Generate a new random FlushId using UUIDv7
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Get the string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for FlushId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for FlushId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Context carried by a session for log correlation
#[derive(Debug, Clone)]
pub struct UnitOfWorkContext {
    pub session_id: SessionId,
    pub label: Option<String>,
}

impl UnitOfWorkContext {
    /// Create a new context with a fresh SessionId
    pub fn new() -> Self {
        Self {
            session_id: SessionId::new(),
            label: None,
        }
    }

    /// Attach a human-readable label (e.g. the request or job name)
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

impl Default for UnitOfWorkContext {
    fn default() -> Self {
        Self::new()
    }
}
