use std::any::TypeId;
use std::collections::HashSet;

use super::descriptor::{Cardinality, CascadeOp, CascadeSet, EntityDescriptor, RelationshipEdge};
use super::ops::{EdgeAccessor, FieldAccessor, KeyAccessor, TypedOps, VersionAccessor};
use crate::errors::{KeelError, Result};
use crate::model::{
    Entity, EntityRef, ErasedRef, FieldType, Key, KeyType, Related, RelatedHandle, Value,
};

/// Declarative builder for an [`EntityDescriptor`]
///
/// Fields are mapped with a pair of lenses: one returning a shared
/// reference to the field, one returning a mutable reference.
///
/// ```
/// use keel_core::model::Entity;
/// use keel_core::registry::EntityDescriptor;
///
/// #[derive(Default)]
/// struct Ship { id: Option<i64>, name: String }
/// impl Entity for Ship { const ENTITY_TYPE: &'static str = "Ship"; }
///
/// let ship = EntityDescriptor::builder::<Ship>()
///     .table("ships")
///     .key("id", |s| &s.id, |s| &mut s.id)
///     .field("name", |s| &s.name, |s| &mut s.name)
///     .build()
///     .unwrap();
/// assert_eq!(ship.columns(), vec!["id", "name"]);
/// ```
pub struct EntityDescriptorBuilder<T: Entity> {
    table: &'static str,
    key_column: Option<&'static str>,
    key: Option<KeyAccessor<T>>,
    version_column: Option<&'static str>,
    version: Option<VersionAccessor<T>>,
    fields: Vec<FieldAccessor<T>>,
    edges: Vec<RelationshipEdge>,
    edge_accessors: Vec<EdgeAccessor<T>>,
    problems: Vec<String>,
}

impl<T: Entity> EntityDescriptorBuilder<T> {
    pub(crate) fn new() -> Self {
        Self {
            table: T::ENTITY_TYPE,
            key_column: None,
            key: None,
            version_column: None,
            version: None,
            fields: Vec::new(),
            edges: Vec::new(),
            edge_accessors: Vec::new(),
            problems: Vec::new(),
        }
    }

    pub fn table(mut self, table: &'static str) -> Self {
        self.table = table;
        self
    }

    /// Map the primary key; an empty key means "not yet assigned"
    pub fn key<K, G, S>(mut self, column: &'static str, get: G, set: S) -> Self
    where
        K: KeyType,
        G: Fn(&T) -> &Option<K> + Send + Sync + 'static,
        S: Fn(&mut T) -> &mut Option<K> + Send + Sync + 'static,
    {
        if self.key_column.is_some() {
            self.problems.push("key mapped twice".to_string());
        }
        self.key_column = Some(column);
        self.key = Some(KeyAccessor {
            get: Box::new(move |entity: &T| -> Option<Key> { get(entity).clone().map(Into::into) }),
            set: Box::new(move |entity: &mut T, key: Key| -> Result<()> {
                *set(entity) = Some(K::try_from(key)?);
                Ok(())
            }),
        });
        self
    }

    /// Map the optimistic-lock version counter
    pub fn version<G, S>(mut self, column: &'static str, get: G, set: S) -> Self
    where
        G: Fn(&T) -> &i64 + Send + Sync + 'static,
        S: Fn(&mut T) -> &mut i64 + Send + Sync + 'static,
    {
        if self.version_column.is_some() {
            self.problems.push("version mapped twice".to_string());
        }
        self.version_column = Some(column);
        self.version = Some(VersionAccessor {
            get: Box::new(move |entity: &T| *get(entity)),
            set: Box::new(move |entity: &mut T, version: i64| *set(entity) = version),
        });
        self
    }

    pub fn field<V, G, S>(mut self, column: &'static str, get: G, set: S) -> Self
    where
        V: FieldType,
        G: Fn(&T) -> &V + Send + Sync + 'static,
        S: Fn(&mut T) -> &mut V + Send + Sync + 'static,
    {
        self.fields.push(FieldAccessor {
            column,
            get: Box::new(move |entity: &T| -> Value { get(entity).clone().into() }),
            set: Box::new(move |entity: &mut T, value: Value| -> Result<()> {
                *set(entity) = V::try_from(value)?;
                Ok(())
            }),
        });
        self
    }

    /// Owning to-one edge stored in `join_column`
    pub fn reference<S, G, M>(self, name: &'static str, join_column: &'static str, get: G, set: M) -> Self
    where
        S: Entity,
        G: Fn(&T) -> &Option<Related<S>> + Send + Sync + 'static,
        M: Fn(&mut T) -> &mut Option<Related<S>> + Send + Sync + 'static,
    {
        self.to_one::<S, G, M>(name, Some(join_column), None, get, set)
    }

    /// Non-owning to-one edge mirrored by `mapped_by` on the target
    pub fn inverse_reference<S, G, M>(
        self,
        name: &'static str,
        mapped_by: &'static str,
        get: G,
        set: M,
    ) -> Self
    where
        S: Entity,
        G: Fn(&T) -> &Option<Related<S>> + Send + Sync + 'static,
        M: Fn(&mut T) -> &mut Option<Related<S>> + Send + Sync + 'static,
    {
        self.to_one::<S, G, M>(name, None, Some(mapped_by), get, set)
    }

    /// Inverse to-many edge; membership is stored by the children's
    /// `mapped_by` reference
    pub fn collection<S, G, M>(mut self, name: &'static str, mapped_by: &'static str, get: G, set: M) -> Self
    where
        S: Entity,
        G: Fn(&T) -> &Vec<EntityRef<S>> + Send + Sync + 'static,
        M: Fn(&mut T) -> &mut Vec<EntityRef<S>> + Send + Sync + 'static,
    {
        self.edges.push(RelationshipEdge {
            name,
            target: S::ENTITY_TYPE,
            cardinality: Cardinality::Many,
            owning: false,
            join_column: None,
            mapped_by: Some(mapped_by),
            cascade: CascadeSet::NONE,
            orphan_removal: false,
            target_type: TypeId::of::<S>(),
        });
        self.edge_accessors.push(EdgeAccessor::Many {
            get: Box::new(move |entity: &T| -> Vec<ErasedRef> {
                get(entity).iter().map(EntityRef::erase).collect()
            }),
            set: Box::new(move |entity: &mut T, members: Vec<ErasedRef>| -> Result<()> {
                let typed = members
                    .iter()
                    .map(|member| downcast_member::<S>(T::ENTITY_TYPE, name, member))
                    .collect::<Result<Vec<_>>>()?;
                *set(entity) = typed;
                Ok(())
            }),
        });
        self
    }

    /// Cascade the given operations along the most recently declared edge
    pub fn cascade(mut self, ops: &[CascadeOp]) -> Self {
        match self.edges.last_mut() {
            Some(edge) => {
                for op in ops {
                    edge.cascade.insert(*op);
                }
            }
            None => self.problems.push("cascade declared before any edge".to_string()),
        }
        self
    }

    /// Delete children dropped from the most recently declared collection
    pub fn orphan_removal(mut self) -> Self {
        match self.edges.last_mut() {
            Some(edge) if edge.is_collection() => edge.orphan_removal = true,
            Some(edge) => self
                .problems
                .push(format!("orphan removal on non-collection edge {}", edge.name)),
            None => self
                .problems
                .push("orphan removal declared before any edge".to_string()),
        }
        self
    }

    /// Validate the declaration
    ///
    /// # Errors
    ///
    /// Returns `InvalidDescriptor` when the key is missing, a column or
    /// edge name repeats, or a modifier was misplaced.
    pub fn build(self) -> Result<EntityDescriptor> {
        let invalid = |reason: String| KeelError::InvalidDescriptor {
            entity_type: T::ENTITY_TYPE.to_string(),
            reason,
        };

        if let Some(problem) = self.problems.into_iter().next() {
            return Err(invalid(problem));
        }
        let (key_column, key) = match (self.key_column, self.key) {
            (Some(column), Some(key)) => (column, key),
            _ => return Err(invalid("no key mapped".to_string())),
        };

        let mut columns = HashSet::new();
        let all_columns = std::iter::once(key_column)
            .chain(self.fields.iter().map(|field| field.column))
            .chain(self.edges.iter().filter_map(|edge| edge.join_column))
            .chain(self.version_column);
        for column in all_columns {
            if !columns.insert(column) {
                return Err(invalid(format!("column {} mapped twice", column)));
            }
        }

        let mut edge_names = HashSet::new();
        for edge in &self.edges {
            if !edge_names.insert(edge.name) {
                return Err(invalid(format!("edge {} declared twice", edge.name)));
            }
        }

        Ok(EntityDescriptor {
            entity_type: T::ENTITY_TYPE,
            type_id: TypeId::of::<T>(),
            table: self.table,
            key_column,
            version_column: self.version_column,
            fields: self.fields.iter().map(|field| field.column).collect(),
            edges: self.edges,
            ops: Box::new(TypedOps {
                key,
                version: self.version,
                fields: self.fields,
                edges: self.edge_accessors,
            }),
        })
    }

    fn to_one<S, G, M>(
        mut self,
        name: &'static str,
        join_column: Option<&'static str>,
        mapped_by: Option<&'static str>,
        get: G,
        set: M,
    ) -> Self
    where
        S: Entity,
        G: Fn(&T) -> &Option<Related<S>> + Send + Sync + 'static,
        M: Fn(&mut T) -> &mut Option<Related<S>> + Send + Sync + 'static,
    {
        self.edges.push(RelationshipEdge {
            name,
            target: S::ENTITY_TYPE,
            cardinality: Cardinality::One,
            owning: join_column.is_some(),
            join_column,
            mapped_by,
            cascade: CascadeSet::NONE,
            orphan_removal: false,
            target_type: TypeId::of::<S>(),
        });
        self.edge_accessors.push(EdgeAccessor::One {
            get: Box::new(move |entity: &T| -> Option<RelatedHandle> {
                get(entity).as_ref().map(|related| match related {
                    Related::Loaded(target) => RelatedHandle::Loaded(target.erase()),
                    Related::NotLoaded(identity) => RelatedHandle::NotLoaded(identity.clone()),
                })
            }),
            set: Box::new(move |entity: &mut T, handle: Option<RelatedHandle>| -> Result<()> {
                let related = match handle {
                    None => None,
                    Some(RelatedHandle::Loaded(target)) => Some(Related::Loaded(
                        downcast_member::<S>(T::ENTITY_TYPE, name, &target)?,
                    )),
                    Some(RelatedHandle::NotLoaded(identity)) => Some(Related::NotLoaded(identity)),
                };
                *set(entity) = related;
                Ok(())
            }),
        });
        self
    }
}

fn downcast_member<S: Entity>(
    owner_type: &'static str,
    edge: &'static str,
    member: &ErasedRef,
) -> Result<EntityRef<S>> {
    member
        .downcast::<S>()
        .ok_or_else(|| KeelError::UnresolvedRelationshipTarget {
            entity_type: owner_type.to_string(),
            edge: edge.to_string(),
            reason: format!("expected {}, found {}", S::ENTITY_TYPE, member.entity_type()),
        })
}
