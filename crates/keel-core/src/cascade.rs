//! Cascade reachability
//!
//! Computes the set of instances an operation reaches from a root by
//! following only edges that cascade that operation. Each instance is
//! visited once, so cyclic graphs terminate.

use std::collections::HashSet;

use crate::errors::Result;
use crate::model::{ErasedRef, Identity};
use crate::registry::{CascadeOp, Registry};
use crate::snapshot::key_of;

/// Visited-set key: the identity when the instance has a key, otherwise
/// the instance address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum VisitKey {
    Identity(Identity),
    Instance(usize),
}

pub(crate) fn visit_key(registry: &Registry, entity: &ErasedRef) -> Result<VisitKey> {
    Ok(match key_of(registry, entity)? {
        Some(key) => VisitKey::Identity(Identity::new(entity.entity_type(), key)),
        None => VisitKey::Instance(entity.addr()),
    })
}

/// Root plus every loaded instance reachable along edges cascading `op`,
/// in depth-first pre-order
///
/// Instances sharing an identity are reached once.
pub(crate) fn reachable(registry: &Registry, op: CascadeOp, root: &ErasedRef) -> Result<Vec<ErasedRef>> {
    walk(registry, op, root, |entity| visit_key(registry, entity))
}

/// Like [`reachable`], but every distinct instance is reached, including
/// two instances that carry the same identity
pub(crate) fn reachable_instances(
    registry: &Registry,
    op: CascadeOp,
    root: &ErasedRef,
) -> Result<Vec<ErasedRef>> {
    walk(registry, op, root, |entity| Ok(VisitKey::Instance(entity.addr())))
}

fn walk(
    registry: &Registry,
    op: CascadeOp,
    root: &ErasedRef,
    key: impl Fn(&ErasedRef) -> Result<VisitKey>,
) -> Result<Vec<ErasedRef>> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    let mut stack = vec![root.clone()];

    while let Some(entity) = stack.pop() {
        if !visited.insert(key(&entity)?) {
            continue;
        }
        let descriptor = registry.descriptor(entity.entity_type())?;
        let mut children = Vec::new();
        for (index, edge) in descriptor.edges().iter().enumerate() {
            if edge.cascades(op) {
                children.extend(descriptor.ops().edge(&entity, index)?.loaded());
            }
        }
        // Reverse so the first declared child is visited first.
        stack.extend(children.into_iter().rev());
        order.push(entity);
    }

    tracing::trace!(op = ?op, reached = order.len(), "cascade reachability computed");
    Ok(order)
}
