use serde::Serialize;

/// Lifecycle state of an instance relative to one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EntityState {
    /// Never tracked by this session and carrying no session history
    Transient,
    /// Tracked; changes are written at the next flush
    Managed,
    /// Tracked and scheduled for deletion at the next flush
    Removed,
    /// Previously tracked, or owned by another session
    Detached,
}

impl EntityState {
    /// True for states that live in the identity map
    pub fn is_tracked(&self) -> bool {
        matches!(self, EntityState::Managed | EntityState::Removed)
    }
}
