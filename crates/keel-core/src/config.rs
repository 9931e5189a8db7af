//! Session configuration

use serde::{Deserialize, Serialize};

/// When pending changes are written without an explicit `flush`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// Only `flush` and `commit` write
    #[default]
    Manual,
    /// Also flush before `find` and `load_collection` query storage
    Auto,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub flush_mode: FlushMode,
    /// Version assigned to newly inserted rows of versioned types
    pub initial_version: i64,
    /// Free-form label carried in log correlation
    pub label: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            flush_mode: FlushMode::Manual,
            initial_version: 0,
            label: None,
        }
    }
}

impl SessionConfig {
    pub fn with_flush_mode(mut self, flush_mode: FlushMode) -> Self {
        self.flush_mode = flush_mode;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}
