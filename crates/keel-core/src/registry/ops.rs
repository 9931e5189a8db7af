//! Type-erased field access generated by the descriptor builder

use crate::errors::{KeelError, Result};
use crate::model::entity::EntityCell;
use crate::model::{Entity, EntityRef, ErasedRef, Key, RelatedHandle, Row, Value};

/// Current value of a relationship edge on one instance
#[derive(Debug, Clone)]
pub(crate) enum EdgeValue {
    One(Option<RelatedHandle>),
    Many(Vec<ErasedRef>),
}

impl EdgeValue {
    /// In-memory instances reachable through this edge
    pub(crate) fn loaded(&self) -> Vec<ErasedRef> {
        match self {
            EdgeValue::One(Some(RelatedHandle::Loaded(entity))) => vec![entity.clone()],
            EdgeValue::One(_) => Vec::new(),
            EdgeValue::Many(members) => members.clone(),
        }
    }
}

/// Engine-side access to an entity's mapped state
pub(crate) trait EntityOps: Send + Sync {
    fn instantiate(&self) -> ErasedRef;
    fn key(&self, entity: &ErasedRef) -> Result<Option<Key>>;
    fn set_key(&self, entity: &ErasedRef, key: &Key) -> Result<()>;
    /// `None` for unversioned types
    fn version(&self, entity: &ErasedRef) -> Result<Option<i64>>;
    fn set_version(&self, entity: &ErasedRef, version: i64) -> Result<()>;
    /// Scalar fields keyed by column
    fn read_fields(&self, entity: &ErasedRef) -> Result<Row>;
    /// Writes the scalar columns present in `row`; others are left alone
    fn write_fields(&self, entity: &ErasedRef, row: &Row) -> Result<()>;
    fn edge(&self, entity: &ErasedRef, index: usize) -> Result<EdgeValue>;
    fn set_edge(&self, entity: &ErasedRef, index: usize, value: EdgeValue) -> Result<()>;
}

pub(crate) type Reader<T, V> = Box<dyn Fn(&T) -> V + Send + Sync>;
pub(crate) type Writer<T, V> = Box<dyn Fn(&mut T, V) -> Result<()> + Send + Sync>;

pub(crate) struct KeyAccessor<T> {
    pub(crate) get: Reader<T, Option<Key>>,
    pub(crate) set: Writer<T, Key>,
}

pub(crate) struct VersionAccessor<T> {
    pub(crate) get: Reader<T, i64>,
    pub(crate) set: Box<dyn Fn(&mut T, i64) + Send + Sync>,
}

pub(crate) struct FieldAccessor<T> {
    pub(crate) column: &'static str,
    pub(crate) get: Reader<T, Value>,
    pub(crate) set: Writer<T, Value>,
}

pub(crate) enum EdgeAccessor<T> {
    One {
        get: Reader<T, Option<RelatedHandle>>,
        set: Writer<T, Option<RelatedHandle>>,
    },
    Many {
        get: Reader<T, Vec<ErasedRef>>,
        set: Writer<T, Vec<ErasedRef>>,
    },
}

pub(crate) struct TypedOps<T> {
    pub(crate) key: KeyAccessor<T>,
    pub(crate) version: Option<VersionAccessor<T>>,
    pub(crate) fields: Vec<FieldAccessor<T>>,
    pub(crate) edges: Vec<EdgeAccessor<T>>,
}

impl<T: Entity> TypedOps<T> {
    fn cell<'a>(&self, entity: &'a ErasedRef) -> Result<&'a EntityCell<T>> {
        entity
            .slot()
            .as_any()
            .downcast_ref::<EntityCell<T>>()
            .ok_or_else(|| KeelError::Internal {
                message: format!(
                    "descriptor for {} applied to a {} instance",
                    T::ENTITY_TYPE,
                    entity.entity_type()
                ),
            })
    }

    fn read<R>(&self, entity: &ErasedRef, f: impl FnOnce(&T) -> R) -> Result<R> {
        let cell = self.cell(entity)?;
        let value = cell.value.try_borrow().map_err(|_| in_use::<T>())?;
        Ok(f(&value))
    }

    fn write<R>(&self, entity: &ErasedRef, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let cell = self.cell(entity)?;
        let mut value = cell.value.try_borrow_mut().map_err(|_| in_use::<T>())?;
        Ok(f(&mut value))
    }

    fn edge_accessor(&self, index: usize) -> Result<&EdgeAccessor<T>> {
        self.edges.get(index).ok_or_else(|| KeelError::Internal {
            message: format!("{} has no edge at position {}", T::ENTITY_TYPE, index),
        })
    }
}

fn in_use<T: Entity>() -> KeelError {
    KeelError::EntityInUse {
        entity_type: T::ENTITY_TYPE.to_string(),
    }
}

impl<T: Entity> EntityOps for TypedOps<T> {
    fn instantiate(&self) -> ErasedRef {
        EntityRef::new(T::default()).erase()
    }

    fn key(&self, entity: &ErasedRef) -> Result<Option<Key>> {
        self.read(entity, |value| (self.key.get)(value))
    }

    fn set_key(&self, entity: &ErasedRef, key: &Key) -> Result<()> {
        self.write(entity, |value| (self.key.set)(value, key.clone()))?
    }

    fn version(&self, entity: &ErasedRef) -> Result<Option<i64>> {
        match &self.version {
            Some(accessor) => self.read(entity, |value| Some((accessor.get)(value))),
            None => Ok(None),
        }
    }

    fn set_version(&self, entity: &ErasedRef, version: i64) -> Result<()> {
        match &self.version {
            Some(accessor) => self.write(entity, |value| (accessor.set)(value, version)),
            None => Ok(()),
        }
    }

    fn read_fields(&self, entity: &ErasedRef) -> Result<Row> {
        self.read(entity, |value| {
            self.fields
                .iter()
                .map(|field| (field.column.to_string(), (field.get)(value)))
                .collect()
        })
    }

    fn write_fields(&self, entity: &ErasedRef, row: &Row) -> Result<()> {
        self.write(entity, |value| {
            for field in &self.fields {
                if let Some(column_value) = row.get(field.column) {
                    (field.set)(value, column_value.clone())?;
                }
            }
            Ok(())
        })?
    }

    fn edge(&self, entity: &ErasedRef, index: usize) -> Result<EdgeValue> {
        let accessor = self.edge_accessor(index)?;
        self.read(entity, |value| match accessor {
            EdgeAccessor::One { get, .. } => EdgeValue::One(get(value)),
            EdgeAccessor::Many { get, .. } => EdgeValue::Many(get(value)),
        })
    }

    fn set_edge(&self, entity: &ErasedRef, index: usize, edge_value: EdgeValue) -> Result<()> {
        let accessor = self.edge_accessor(index)?;
        self.write(entity, |value| match (accessor, edge_value) {
            (EdgeAccessor::One { set, .. }, EdgeValue::One(handle)) => set(value, handle),
            (EdgeAccessor::Many { set, .. }, EdgeValue::Many(members)) => set(value, members),
            _ => Err(KeelError::Internal {
                message: format!(
                    "cardinality mismatch writing edge {} of {}",
                    index,
                    T::ENTITY_TYPE
                ),
            }),
        })?
    }
}
