//! Flush planning
//!
//! Turns the identity map into one ordered batch:
//!
//! 1. Capture every managed entry and detect orphaned collection members
//! 2. Classify entries into inserts, updates, deletes and discards
//! 3. Order inserts parents-first and deletes children-first
//! 4. Record the bookkeeping to apply once storage has committed
//!
//! Planning never mutates the session; the caller applies
//! [`FlushPlan::effects`] only after the gateway reports success.

pub(crate) mod ordering;

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use self::ordering::Node;
use crate::cascade;
use crate::concurrency::{next_version, version_check};
use crate::config::SessionConfig;
use crate::errors::{KeelError, Result};
use crate::gateway::{Batch, Operation, OperationKind};
use crate::identity_map::{IdentityMap, ManagedEntry};
use crate::model::{EntityState, Identity, Row, Value};
use crate::registry::{CascadeOp, EntityDescriptor, Registry};
use crate::snapshot::{
    capture, compute_diff, referenced_identities, CaptureMode, FieldDiff, Snapshot,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedInsert {
    pub identity: Identity,
    pub values: Row,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedDelete {
    pub identity: Identity,
    /// Deleted because it left an orphan-removing collection
    pub orphan: bool,
}

/// What the next flush would write, in batch order
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChangeSet {
    pub inserts: Vec<PlannedInsert>,
    pub updates: Vec<FieldDiff>,
    pub deletes: Vec<PlannedDelete>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.deletes.len()
    }

    pub fn update_for(&self, identity: &Identity) -> Option<&FieldDiff> {
        self.updates.iter().find(|diff| diff.identity() == identity)
    }

    pub fn is_deleted(&self, identity: &Identity) -> bool {
        self.deletes.iter().any(|delete| &delete.identity == identity)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdatedEntity {
    pub identity: Identity,
    pub fields: Vec<String>,
}

/// What a successful flush wrote
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlushSummary {
    pub inserted: Vec<Identity>,
    pub updated: Vec<UpdatedEntity>,
    pub deleted: Vec<Identity>,
}

impl FlushSummary {
    pub fn is_empty(&self) -> bool {
        self.operations() == 0
    }

    pub fn operations(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.deleted.len()
    }
}

/// Session bookkeeping applied after storage committed
#[derive(Debug, Clone)]
pub(crate) enum Effect {
    /// The entry now matches storage
    Synchronize {
        identity: Identity,
        snapshot: Snapshot,
        version: Option<i64>,
        inserted: bool,
    },
    /// The entry leaves the session
    Discard { identity: Identity },
}

#[derive(Debug)]
pub(crate) struct FlushPlan {
    pub(crate) change_set: ChangeSet,
    pub(crate) batch: Batch,
    pub(crate) effects: Vec<Effect>,
}

impl FlushPlan {
    pub(crate) fn summary(&self) -> FlushSummary {
        FlushSummary {
            inserted: self
                .change_set
                .inserts
                .iter()
                .map(|insert| insert.identity.clone())
                .collect(),
            updated: self
                .change_set
                .updates
                .iter()
                .map(|diff| UpdatedEntity {
                    identity: diff.identity().clone(),
                    fields: diff.fields().into_iter().map(str::to_string).collect(),
                })
                .collect(),
            deleted: self
                .change_set
                .deletes
                .iter()
                .map(|delete| delete.identity.clone())
                .collect(),
        }
    }
}

/// Plan the next flush without touching the session or storage
///
/// # Errors
///
/// - `UnresolvedRelationshipTarget` if a managed entity references an
///   instance without a key
/// - `DependencyCycle` if inserts or deletes cannot be ordered
pub(crate) fn build_plan(
    registry: &Registry,
    map: &IdentityMap,
    config: &SessionConfig,
) -> Result<FlushPlan> {
    let entries = map.entries();

    let mut current = HashMap::new();
    let mut orphans: Vec<Identity> = Vec::new();
    for entry in entries.iter().filter(|e| e.state() == EntityState::Managed) {
        let descriptor = registry.descriptor(entry.identity().entity_type)?;
        ensure_key_unchanged(descriptor, entry)?;
        let snapshot = capture(registry, descriptor, entry.instance(), CaptureMode::Strict)?;
        for edge in descriptor.edges().iter().filter(|edge| edge.orphan_removal) {
            let after = snapshot.collection(edge.name).unwrap_or(&[]);
            for member in entry.snapshot().collection(edge.name).unwrap_or(&[]) {
                if !after.contains(member) && !orphans.contains(member) {
                    orphans.push(member.clone());
                }
            }
        }
        current.insert(entry.identity().clone(), snapshot);
    }

    let doomed = orphan_cascade(registry, map, &orphans)?;

    let mut effects = Vec::new();
    let mut insert_nodes = Vec::new();
    let mut inserts = HashMap::new();
    let mut delete_nodes = Vec::new();
    let mut deletes = HashMap::new();
    let mut updates = Vec::new();
    let mut change_set = ChangeSet::default();

    for entry in &entries {
        let identity = entry.identity();
        let descriptor = registry.descriptor(identity.entity_type)?;

        if entry.state() == EntityState::Removed || doomed.contains(identity) {
            if entry.is_persisted() {
                delete_nodes.push(Node {
                    identity: identity.clone(),
                    seq: entry.seq(),
                    references: referenced_identities(descriptor, entry.snapshot().values())?,
                });
                deletes.insert(identity.clone(), delete_operation(descriptor, entry));
            }
            effects.push(Effect::Discard {
                identity: identity.clone(),
            });
            continue;
        }

        let snapshot = current.remove(identity).ok_or_else(|| KeelError::Internal {
            message: format!("no capture for managed entry {}", identity),
        })?;

        if !entry.is_persisted() {
            let version = descriptor
                .version_column()
                .map(|_| entry.version().unwrap_or(config.initial_version));
            let values = insert_values(descriptor, identity, &snapshot, version);
            insert_nodes.push(Node {
                identity: identity.clone(),
                seq: entry.seq(),
                references: referenced_identities(descriptor, snapshot.values())?,
            });
            inserts.insert(identity.clone(), (descriptor, values));
            effects.push(Effect::Synchronize {
                identity: identity.clone(),
                snapshot,
                version,
                inserted: true,
            });
            continue;
        }

        let diff = compute_diff(identity, entry.snapshot(), &snapshot);
        if diff.is_empty() {
            // Collection membership may still have moved on.
            effects.push(Effect::Synchronize {
                identity: identity.clone(),
                snapshot,
                version: entry.version(),
                inserted: false,
            });
            continue;
        }

        let check = version_check(descriptor, entry.version());
        let new_version = check.as_ref().map(|check| next_version(check.expected));
        let mut changes = diff.to_row();
        if let (Some(check), Some(version)) = (&check, new_version) {
            changes.insert(check.column.to_string(), Value::Int(version));
        }
        updates.push(Operation {
            identity: identity.clone(),
            table: descriptor.table(),
            key_column: descriptor.key_column(),
            kind: OperationKind::Update {
                changes,
                version: check,
            },
        });
        change_set.updates.push(diff);
        effects.push(Effect::Synchronize {
            identity: identity.clone(),
            snapshot,
            version: new_version.or(entry.version()),
            inserted: false,
        });
    }

    let mut batch = Batch::new();
    for identity in ordering::order_inserts(&insert_nodes)? {
        if let Some((descriptor, values)) = inserts.remove(&identity) {
            change_set.inserts.push(PlannedInsert {
                identity: identity.clone(),
                values: values.clone(),
            });
            batch.push(Operation {
                identity,
                table: descriptor.table(),
                key_column: descriptor.key_column(),
                kind: OperationKind::Insert { values },
            });
        }
    }
    for update in updates {
        batch.push(update);
    }
    for identity in ordering::order_deletes(&delete_nodes)? {
        if let Some(operation) = deletes.remove(&identity) {
            change_set.deletes.push(PlannedDelete {
                orphan: orphans.contains(&identity),
                identity,
            });
            batch.push(operation);
        }
    }

    Ok(FlushPlan {
        change_set,
        batch,
        effects,
    })
}

/// Managed orphans plus everything their remove cascade reaches
fn orphan_cascade(
    registry: &Registry,
    map: &IdentityMap,
    orphans: &[Identity],
) -> Result<HashSet<Identity>> {
    let mut doomed = HashSet::new();
    for orphan in orphans {
        let Some(entry) = map.lookup(orphan) else {
            tracing::debug!(identity = %orphan, "orphan is not managed; leaving its row alone");
            continue;
        };
        if entry.state() != EntityState::Managed {
            continue;
        }
        for reached in cascade::reachable(registry, CascadeOp::Remove, entry.instance())? {
            if let Some(reached_entry) = map.find_instance(&reached) {
                if reached_entry.state() == EntityState::Managed {
                    doomed.insert(reached_entry.identity().clone());
                }
            }
        }
    }
    Ok(doomed)
}

fn ensure_key_unchanged(descriptor: &EntityDescriptor, entry: &ManagedEntry) -> Result<()> {
    let key = descriptor.ops().key(entry.instance())?;
    if key.as_ref() != Some(&entry.identity().key) {
        return Err(KeelError::Internal {
            message: format!(
                "key of managed entity {} was changed to {:?}",
                entry.identity(),
                key
            ),
        });
    }
    Ok(())
}

fn insert_values(
    descriptor: &EntityDescriptor,
    identity: &Identity,
    snapshot: &Snapshot,
    version: Option<i64>,
) -> Row {
    let mut values = snapshot.values().clone();
    values.insert(descriptor.key_column().to_string(), identity.key.to_value());
    if let (Some(column), Some(version)) = (descriptor.version_column(), version) {
        values.insert(column.to_string(), Value::Int(version));
    }
    values
}

fn delete_operation(descriptor: &EntityDescriptor, entry: &ManagedEntry) -> Operation {
    Operation {
        identity: entry.identity().clone(),
        table: descriptor.table(),
        key_column: descriptor.key_column(),
        kind: OperationKind::Delete {
            version: version_check(descriptor, entry.version()),
        },
    }
}
