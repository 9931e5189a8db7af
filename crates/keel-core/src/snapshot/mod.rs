//! Snapshots and dirty checking.
//!
//! A snapshot records the persisted field values of one managed entity as
//! of its last synchronization with storage. Comparing it with a fresh
//! capture of the live instance yields the field-level diff.
//!
//! ## Responsibilities
//!
//! - Capture scalar columns and owning foreign-key columns
//! - Record collection membership for orphan detection
//! - Compute field-level diffs
//!
//! ## Non-Responsibilities
//!
//! - Version columns (owned by the concurrency controller)
//! - Deciding what to write (handled by `flush`)

pub mod diff;

use std::collections::BTreeMap;

use serde::Serialize;

pub use diff::{compute_diff, FieldChange, FieldDiff};

use crate::errors::{KeelError, Result};
use crate::model::{ErasedRef, Identity, Key, RelatedHandle, Row, Value};
use crate::registry::ops::EdgeValue;
use crate::registry::{EntityDescriptor, Registry};

/// Persisted state of one entity
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Snapshot {
    values: Row,
    collections: BTreeMap<&'static str, Vec<Identity>>,
}

impl Snapshot {
    /// Column values: scalars plus owning foreign keys
    pub fn values(&self) -> &Row {
        &self.values
    }

    pub fn value(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    /// Identities that were members of a collection edge
    pub fn collection(&self, edge: &str) -> Option<&[Identity]> {
        self.collections.get(edge).map(Vec::as_slice)
    }

    pub(crate) fn set_collection(&mut self, edge: &'static str, members: Vec<Identity>) {
        self.collections.insert(edge, members);
    }
}

/// How to treat a loaded reference whose target has no key yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CaptureMode {
    /// Record the foreign key as NULL (used when attaching)
    Lenient,
    /// Fail with `UnresolvedRelationshipTarget` (used when flushing)
    Strict,
}

/// Key of any instance, via its registered descriptor
pub(crate) fn key_of(registry: &Registry, entity: &ErasedRef) -> Result<Option<Key>> {
    registry
        .descriptor(entity.entity_type())?
        .ops()
        .key(entity)
}

/// Capture the current persisted state of a live instance
pub(crate) fn capture(
    registry: &Registry,
    descriptor: &EntityDescriptor,
    entity: &ErasedRef,
    mode: CaptureMode,
) -> Result<Snapshot> {
    let ops = descriptor.ops();
    let mut snapshot = Snapshot {
        values: ops.read_fields(entity)?,
        collections: BTreeMap::new(),
    };

    for (index, edge) in descriptor.edges().iter().enumerate() {
        match ops.edge(entity, index)? {
            EdgeValue::One(handle) => {
                let Some(column) = edge.join_column else {
                    continue;
                };
                let value = match handle {
                    None => Value::Null,
                    Some(RelatedHandle::NotLoaded(identity)) => identity.key.to_value(),
                    Some(RelatedHandle::Loaded(target)) => match key_of(registry, &target)? {
                        Some(key) => key.to_value(),
                        None if mode == CaptureMode::Lenient => Value::Null,
                        None => {
                            return Err(KeelError::UnresolvedRelationshipTarget {
                                entity_type: descriptor.entity_type().to_string(),
                                edge: edge.name.to_string(),
                                reason: format!("{} target has no key", edge.target),
                            })
                        }
                    },
                };
                snapshot.values.insert(column.to_string(), value);
            }
            EdgeValue::Many(members) => {
                let mut identities = Vec::with_capacity(members.len());
                for member in &members {
                    if let Some(key) = key_of(registry, member)? {
                        identities.push(Identity::new(member.entity_type(), key));
                    }
                }
                snapshot.collections.insert(edge.name, identities);
            }
        }
    }

    Ok(snapshot)
}

/// Identities referenced by the owning foreign keys in `values`
pub(crate) fn referenced_identities(
    descriptor: &EntityDescriptor,
    values: &Row,
) -> Result<Vec<Identity>> {
    let mut referenced = Vec::new();
    for edge in descriptor.edges() {
        let Some(column) = edge.join_column else {
            continue;
        };
        if let Some(key) = values.get(column).map(Key::from_value).transpose()?.flatten() {
            referenced.push(Identity {
                entity_type: edge.target,
                key,
            });
        }
    }
    Ok(referenced)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::model::{Entity, EntityRef, Related};

    #[derive(Default)]
    struct Dock {
        id: Option<i64>,
        name: String,
    }

    impl Entity for Dock {
        const ENTITY_TYPE: &'static str = "Dock";
    }

    #[derive(Default)]
    struct Boat {
        id: Option<i64>,
        dock: Option<Related<Dock>>,
    }

    impl Entity for Boat {
        const ENTITY_TYPE: &'static str = "Boat";
    }

    fn registry() -> Registry {
        Registry::builder()
            .register(
                EntityDescriptor::builder::<Dock>()
                    .key("id", |d| &d.id, |d| &mut d.id)
                    .field("name", |d| &d.name, |d| &mut d.name)
                    .build()
                    .unwrap(),
            )
            .register(
                EntityDescriptor::builder::<Boat>()
                    .key("id", |b| &b.id, |b| &mut b.id)
                    .reference("dock", "dock_id", |b| &b.dock, |b| &mut b.dock)
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_capture_records_foreign_key() {
        let registry = registry();
        let dock = EntityRef::new(Dock {
            id: Some(4),
            name: "Port Royal".into(),
        });
        let boat = EntityRef::new(Boat {
            id: Some(1),
            dock: Some(Related::to(&dock)),
        });

        let descriptor = registry.descriptor("Boat").unwrap();
        let snapshot = capture(&registry, descriptor, &boat.erase(), CaptureMode::Strict).unwrap();
        assert_eq!(snapshot.value("dock_id"), Some(&Value::Int(4)));
        assert_eq!(
            referenced_identities(descriptor, snapshot.values()).unwrap(),
            vec![Identity::new("Dock", 4)]
        );
    }

    #[test]
    fn test_unkeyed_target_depends_on_mode() {
        let registry = registry();
        let dock = EntityRef::new(Dock::default());
        let boat = EntityRef::new(Boat {
            id: Some(1),
            dock: Some(Related::to(&dock)),
        });
        let descriptor = registry.descriptor("Boat").unwrap();

        let lenient = capture(&registry, descriptor, &boat.erase(), CaptureMode::Lenient).unwrap();
        assert_eq!(lenient.value("dock_id"), Some(&Value::Null));

        let err = capture(&registry, descriptor, &boat.erase(), CaptureMode::Strict).unwrap_err();
        assert!(matches!(err, KeelError::UnresolvedRelationshipTarget { .. }));
    }
}
