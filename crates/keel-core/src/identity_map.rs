//! Per-session identity map
//!
//! Guarantees at most one managed instance per identity. Entries are also
//! indexed by instance address so the session can find the entry for an
//! instance even after application code edited its key field.

use std::collections::HashMap;

use crate::errors::{KeelError, Result};
use crate::model::{EntityState, ErasedRef, Identity};
use crate::snapshot::Snapshot;

/// One tracked entity
#[derive(Debug)]
pub struct ManagedEntry {
    identity: Identity,
    instance: ErasedRef,
    state: EntityState,
    snapshot: Snapshot,
    version: Option<i64>,
    persisted: bool,
    seq: u64,
}

impl ManagedEntry {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    /// Last synchronized state
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Version token expected in storage, for versioned types
    pub fn version(&self) -> Option<i64> {
        self.version
    }

    /// True once a row for this identity is known to exist in storage
    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    pub(crate) fn instance(&self) -> &ErasedRef {
        &self.instance
    }

    /// Attach order, used as the deterministic tiebreak for flush ordering
    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    pub(crate) fn set_state(&mut self, state: EntityState) {
        self.state = state;
    }

    pub(crate) fn set_snapshot(&mut self, snapshot: Snapshot) {
        self.snapshot = snapshot;
    }

    pub(crate) fn snapshot_mut(&mut self) -> &mut Snapshot {
        &mut self.snapshot
    }

    pub(crate) fn set_version(&mut self, version: Option<i64>) {
        self.version = version;
    }

    pub(crate) fn mark_persisted(&mut self) {
        self.persisted = true;
    }
}

#[derive(Debug, Default)]
pub struct IdentityMap {
    entries: HashMap<Identity, ManagedEntry>,
    by_instance: HashMap<usize, Identity>,
    next_seq: u64,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking an instance as `Managed`
    ///
    /// # Errors
    ///
    /// Returns `DuplicateIdentity` if the identity or the instance is
    /// already tracked.
    pub(crate) fn insert(
        &mut self,
        identity: Identity,
        instance: ErasedRef,
        snapshot: Snapshot,
        version: Option<i64>,
        persisted: bool,
    ) -> Result<&ManagedEntry> {
        if self.entries.contains_key(&identity) {
            return Err(KeelError::DuplicateIdentity { identity });
        }
        if let Some(existing) = self.by_instance.get(&instance.addr()) {
            return Err(KeelError::DuplicateIdentity {
                identity: existing.clone(),
            });
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_instance.insert(instance.addr(), identity.clone());
        let entry = self.entries.entry(identity.clone()).or_insert(ManagedEntry {
            identity,
            instance,
            state: EntityState::Managed,
            snapshot,
            version,
            persisted,
            seq,
        });
        Ok(entry)
    }

    pub fn lookup(&self, identity: &Identity) -> Option<&ManagedEntry> {
        self.entries.get(identity)
    }

    pub(crate) fn lookup_mut(&mut self, identity: &Identity) -> Option<&mut ManagedEntry> {
        self.entries.get_mut(identity)
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.entries.contains_key(identity)
    }

    /// Entry tracking exactly this instance
    pub(crate) fn find_instance(&self, instance: &ErasedRef) -> Option<&ManagedEntry> {
        self.by_instance
            .get(&instance.addr())
            .and_then(|identity| self.entries.get(identity))
    }

    pub(crate) fn remove(&mut self, identity: &Identity) -> Option<ManagedEntry> {
        let entry = self.entries.remove(identity)?;
        self.by_instance.remove(&entry.instance.addr());
        Some(entry)
    }

    /// All entries in attach order
    pub fn entries(&self) -> Vec<&ManagedEntry> {
        let mut entries: Vec<_> = self.entries.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries
    }

    /// Remove every entry, in attach order
    pub(crate) fn drain(&mut self) -> Vec<ManagedEntry> {
        self.by_instance.clear();
        let mut entries: Vec<_> = self.entries.drain().map(|(_, entry)| entry).collect();
        entries.sort_by_key(|entry| entry.seq);
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
