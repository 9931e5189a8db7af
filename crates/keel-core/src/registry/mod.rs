//! Entity descriptor registry
//!
//! The registry is built once before any session exists and is shared
//! read-only (`Arc<Registry>`) by every session afterwards.

pub mod builder;
pub mod descriptor;
pub(crate) mod ops;

use std::any::TypeId;
use std::collections::HashMap;

pub use builder::EntityDescriptorBuilder;
pub use descriptor::{Cardinality, CascadeOp, CascadeSet, EntityDescriptor, RelationshipEdge};

use crate::errors::{KeelError, Result};
use crate::model::Entity;

/// Immutable set of entity descriptors keyed by entity type
#[derive(Debug)]
pub struct Registry {
    descriptors: HashMap<&'static str, EntityDescriptor>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Descriptor for an entity type name
    ///
    /// # Errors
    ///
    /// Returns `UnknownEntityType` if the type was never registered.
    pub fn descriptor(&self, entity_type: &str) -> Result<&EntityDescriptor> {
        self.descriptors
            .get(entity_type)
            .ok_or_else(|| KeelError::UnknownEntityType {
                entity_type: entity_type.to_string(),
            })
    }

    /// Descriptor for a Rust type
    ///
    /// # Errors
    ///
    /// Returns `UnknownEntityType` if `T` was never registered, or if the
    /// name was registered by a different Rust type.
    pub fn descriptor_of<T: Entity>(&self) -> Result<&EntityDescriptor> {
        let descriptor = self.descriptor(T::ENTITY_TYPE)?;
        if descriptor.type_id != TypeId::of::<T>() {
            return Err(KeelError::UnknownEntityType {
                entity_type: T::ENTITY_TYPE.to_string(),
            });
        }
        Ok(descriptor)
    }

    pub fn contains(&self, entity_type: &str) -> bool {
        self.descriptors.contains_key(entity_type)
    }

    /// Registered type names, sorted
    pub fn entity_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.descriptors.keys().copied().collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct RegistryBuilder {
    descriptors: Vec<EntityDescriptor>,
}

impl RegistryBuilder {
    pub fn register(mut self, descriptor: EntityDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Cross-validate all descriptors and freeze the registry
    ///
    /// # Errors
    ///
    /// Returns `InvalidDescriptor` for duplicate types, edges whose target
    /// is not registered, and inverse edges whose `mapped_by` does not name
    /// an owning reference back to the declaring type.
    pub fn build(self) -> Result<Registry> {
        let mut descriptors = HashMap::new();
        for descriptor in self.descriptors {
            let entity_type = descriptor.entity_type;
            if descriptors.insert(entity_type, descriptor).is_some() {
                return Err(invalid(entity_type, "registered twice".to_string()));
            }
        }

        for descriptor in descriptors.values() {
            for edge in &descriptor.edges {
                validate_edge(&descriptors, descriptor, edge)?;
            }
        }

        Ok(Registry { descriptors })
    }
}

fn validate_edge(
    descriptors: &HashMap<&'static str, EntityDescriptor>,
    owner: &EntityDescriptor,
    edge: &RelationshipEdge,
) -> Result<()> {
    let target = descriptors.get(edge.target).ok_or_else(|| {
        invalid(
            owner.entity_type,
            format!("edge {} targets unregistered type {}", edge.name, edge.target),
        )
    })?;
    if target.type_id != edge.target_type {
        return Err(invalid(
            owner.entity_type,
            format!("edge {} targets a different Rust type named {}", edge.name, edge.target),
        ));
    }

    if let Some(mapped_by) = edge.mapped_by {
        let mirrors = target.edges.iter().any(|candidate| {
            candidate.name == mapped_by && candidate.owning && candidate.target == owner.entity_type
        });
        if !mirrors {
            return Err(invalid(
                owner.entity_type,
                format!(
                    "edge {} is mapped by {}.{}, which is not an owning reference to {}",
                    edge.name, edge.target, mapped_by, owner.entity_type
                ),
            ));
        }
    }
    Ok(())
}

fn invalid(entity_type: &str, reason: String) -> KeelError {
    KeelError::InvalidDescriptor {
        entity_type: entity_type.to_string(),
        reason,
    }
}
