use std::any::TypeId;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::builder::EntityDescriptorBuilder;
use super::ops::EntityOps;
use crate::model::Entity;

/// Operations that may propagate along a relationship
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadeOp {
    Persist,
    Remove,
    Merge,
    Refresh,
    Detach,
}

impl CascadeOp {
    pub const ALL: [CascadeOp; 5] = [
        CascadeOp::Persist,
        CascadeOp::Remove,
        CascadeOp::Merge,
        CascadeOp::Refresh,
        CascadeOp::Detach,
    ];

    fn bit(self) -> u8 {
        match self {
            CascadeOp::Persist => 1,
            CascadeOp::Remove => 1 << 1,
            CascadeOp::Merge => 1 << 2,
            CascadeOp::Refresh => 1 << 3,
            CascadeOp::Detach => 1 << 4,
        }
    }
}

/// Set of cascaded operations on one edge
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CascadeSet(u8);

impl CascadeSet {
    pub const NONE: CascadeSet = CascadeSet(0);
    pub const ALL: CascadeSet = CascadeSet(0b1_1111);

    pub fn of(ops: &[CascadeOp]) -> Self {
        ops.iter().copied().collect()
    }

    pub fn contains(&self, op: CascadeOp) -> bool {
        self.0 & op.bit() != 0
    }

    pub fn insert(&mut self, op: CascadeOp) {
        self.0 |= op.bit();
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = CascadeOp> + '_ {
        CascadeOp::ALL.into_iter().filter(|op| self.contains(*op))
    }
}

impl FromIterator<CascadeOp> for CascadeSet {
    fn from_iter<I: IntoIterator<Item = CascadeOp>>(iter: I) -> Self {
        let mut set = CascadeSet::NONE;
        for op in iter {
            set.insert(op);
        }
        set
    }
}

impl fmt::Debug for CascadeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Cardinality {
    One,
    Many,
}

/// A named relationship from one entity type to another
///
/// Only owning to-one edges store a foreign key. Inverse edges name the
/// owning edge on the target type through `mapped_by`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipEdge {
    pub name: &'static str,
    pub target: &'static str,
    pub cardinality: Cardinality,
    pub owning: bool,
    pub join_column: Option<&'static str>,
    pub mapped_by: Option<&'static str>,
    pub cascade: CascadeSet,
    pub orphan_removal: bool,
    pub(crate) target_type: TypeId,
}

impl RelationshipEdge {
    pub fn is_collection(&self) -> bool {
        self.cardinality == Cardinality::Many
    }

    pub fn cascades(&self, op: CascadeOp) -> bool {
        self.cascade.contains(op)
    }
}

/// Mapping metadata for one entity type
pub struct EntityDescriptor {
    pub(crate) entity_type: &'static str,
    pub(crate) type_id: TypeId,
    pub(crate) table: &'static str,
    pub(crate) key_column: &'static str,
    pub(crate) version_column: Option<&'static str>,
    pub(crate) fields: Vec<&'static str>,
    pub(crate) edges: Vec<RelationshipEdge>,
    pub(crate) ops: Box<dyn EntityOps>,
}

impl EntityDescriptor {
    /// Start describing `T`; the table defaults to the entity type name
    pub fn builder<T: Entity>() -> EntityDescriptorBuilder<T> {
        EntityDescriptorBuilder::new()
    }

    pub fn entity_type(&self) -> &'static str {
        self.entity_type
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    pub fn key_column(&self) -> &'static str {
        self.key_column
    }

    pub fn version_column(&self) -> Option<&'static str> {
        self.version_column
    }

    pub fn is_versioned(&self) -> bool {
        self.version_column.is_some()
    }

    /// Scalar columns, excluding key and version
    pub fn fields(&self) -> &[&'static str] {
        &self.fields
    }

    pub fn edges(&self) -> &[RelationshipEdge] {
        &self.edges
    }

    /// Look up an edge and its position by name
    pub fn edge(&self, name: &str) -> Option<(usize, &RelationshipEdge)> {
        self.edges
            .iter()
            .enumerate()
            .find(|(_, edge)| edge.name == name)
    }

    /// Every stored column: key, scalars, foreign keys, version
    pub fn columns(&self) -> Vec<&'static str> {
        let mut columns = vec![self.key_column];
        columns.extend(self.fields.iter().copied());
        columns.extend(self.edges.iter().filter_map(|edge| edge.join_column));
        columns.extend(self.version_column);
        columns
    }

    pub(crate) fn ops(&self) -> &dyn EntityOps {
        self.ops.as_ref()
    }
}

impl fmt::Debug for EntityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityDescriptor")
            .field("entity_type", &self.entity_type)
            .field("table", &self.table)
            .field("key_column", &self.key_column)
            .field("version_column", &self.version_column)
            .field("fields", &self.fields)
            .field("edges", &self.edges)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cascade_set_membership() {
        let set = CascadeSet::of(&[CascadeOp::Persist, CascadeOp::Merge]);
        assert!(set.contains(CascadeOp::Persist));
        assert!(set.contains(CascadeOp::Merge));
        assert!(!set.contains(CascadeOp::Remove));
        assert!(!set.is_empty());
        assert!(CascadeSet::NONE.is_empty());
    }

    #[test]
    fn test_cascade_all_covers_every_op() {
        for op in CascadeOp::ALL {
            assert!(CascadeSet::ALL.contains(op), "{:?} missing", op);
        }
        assert_eq!(CascadeSet::ALL.iter().count(), 5);
    }
}
