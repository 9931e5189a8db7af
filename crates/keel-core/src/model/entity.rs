//! Shared entity instances
//!
//! Application code and the session hold the same instance through
//! [`EntityRef`], so mutations made by either side are visible to the
//! other. The session only ever sees instances through the type-erased
//! [`ErasedRef`] and reaches their fields through the registered
//! descriptor.

use std::any::Any;
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;

use super::key::Identity;
use crate::snapshot::Snapshot;

/// A persistable application type
///
/// Types need a `Default` so the engine can materialize fresh instances
/// while loading or merging.
pub trait Entity: Default + 'static {
    /// Stable type name used in identities and the registry
    const ENTITY_TYPE: &'static str;
}

/// What a session remembers about an instance after detaching it
#[derive(Debug, Clone)]
pub(crate) struct DetachedState {
    pub(crate) snapshot: Snapshot,
    pub(crate) version: Option<i64>,
    pub(crate) persisted: bool,
}

pub(crate) struct EntityCell<T> {
    pub(crate) value: RefCell<T>,
    owner: Cell<Option<u64>>,
    detached: RefCell<Option<DetachedState>>,
}

/// Session bookkeeping shared by every entity cell regardless of `T`
pub(crate) trait Slot: Any {
    fn owner(&self) -> Option<u64>;
    fn set_owner(&self, owner: Option<u64>);
    fn detached_state(&self) -> Option<DetachedState>;
    fn set_detached_state(&self, state: Option<DetachedState>);
    /// Whether application code currently holds a borrow of the value
    fn is_borrowed(&self) -> bool;
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Rc<Self>) -> Rc<dyn Any>;
}

impl<T: Entity> Slot for EntityCell<T> {
    fn owner(&self) -> Option<u64> {
        self.owner.get()
    }

    fn set_owner(&self, owner: Option<u64>) {
        self.owner.set(owner);
    }

    fn detached_state(&self) -> Option<DetachedState> {
        self.detached.borrow().clone()
    }

    fn set_detached_state(&self, state: Option<DetachedState>) {
        *self.detached.borrow_mut() = state;
    }

    fn is_borrowed(&self) -> bool {
        self.value.try_borrow_mut().is_err()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

/// Shared handle to an entity instance
///
/// Cloning the handle shares the instance; equality is instance identity.
pub struct EntityRef<T: Entity> {
    inner: Rc<EntityCell<T>>,
}

impl<T: Entity> EntityRef<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Rc::new(EntityCell {
                value: RefCell::new(value),
                owner: Cell::new(None),
                detached: RefCell::new(None),
            }),
        }
    }

    /// Immutable access to the instance
    ///
    /// # Panics
    ///
    /// Panics if the instance is currently mutably borrowed.
    pub fn borrow(&self) -> Ref<'_, T> {
        self.inner.value.borrow()
    }

    /// Mutable access to the instance
    ///
    /// # Panics
    ///
    /// Panics if the instance is currently borrowed.
    pub fn borrow_mut(&self) -> RefMut<'_, T> {
        self.inner.value.borrow_mut()
    }

    /// Read through a closure
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.value.borrow())
    }

    /// Mutate through a closure
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.inner.value.borrow_mut())
    }

    /// True when both handles point at the same instance
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// True while some live session tracks this instance
    pub fn is_managed(&self) -> bool {
        self.inner.owner.get().is_some()
    }

    pub(crate) fn erase(&self) -> ErasedRef {
        ErasedRef {
            entity_type: T::ENTITY_TYPE,
            slot: self.inner.clone(),
        }
    }
}

impl<T: Entity> Clone for EntityRef<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Entity> PartialEq for EntityRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl<T: Entity> Eq for EntityRef<T> {}

impl<T: Entity + fmt::Debug> fmt::Debug for EntityRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.value.try_borrow() {
            Ok(value) => f.debug_tuple("EntityRef").field(&*value).finish(),
            Err(_) => write!(f, "EntityRef({}, <borrowed>)", T::ENTITY_TYPE),
        }
    }
}

/// Type-erased instance handle used inside the engine
#[derive(Clone)]
pub(crate) struct ErasedRef {
    entity_type: &'static str,
    slot: Rc<dyn Slot>,
}

impl ErasedRef {
    pub(crate) fn entity_type(&self) -> &'static str {
        self.entity_type
    }

    pub(crate) fn slot(&self) -> &dyn Slot {
        self.slot.as_ref()
    }

    /// Address of the shared cell, stable while any handle is alive
    pub(crate) fn addr(&self) -> usize {
        Rc::as_ptr(&self.slot) as *const () as usize
    }

    pub(crate) fn ptr_eq(&self, other: &ErasedRef) -> bool {
        self.addr() == other.addr()
    }

    pub(crate) fn downcast<T: Entity>(&self) -> Option<EntityRef<T>> {
        self.slot
            .clone()
            .into_any()
            .downcast::<EntityCell<T>>()
            .ok()
            .map(|inner| EntityRef { inner })
    }
}

impl fmt::Debug for ErasedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ErasedRef({} @ {:#x})", self.entity_type, self.addr())
    }
}

/// A to-one reference that may or may not be in memory
///
/// `NotLoaded` carries only the target identity; the session resolves it
/// on demand.
pub enum Related<T: Entity> {
    Loaded(EntityRef<T>),
    NotLoaded(Identity),
}

impl<T: Entity> Related<T> {
    pub fn to(entity: &EntityRef<T>) -> Self {
        Related::Loaded(entity.clone())
    }

    pub fn loaded(&self) -> Option<&EntityRef<T>> {
        match self {
            Related::Loaded(entity) => Some(entity),
            Related::NotLoaded(_) => None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, Related::Loaded(_))
    }

    /// Identity of an unloaded target
    pub fn pending_identity(&self) -> Option<&Identity> {
        match self {
            Related::Loaded(_) => None,
            Related::NotLoaded(identity) => Some(identity),
        }
    }
}

impl<T: Entity> Clone for Related<T> {
    fn clone(&self) -> Self {
        match self {
            Related::Loaded(entity) => Related::Loaded(entity.clone()),
            Related::NotLoaded(identity) => Related::NotLoaded(identity.clone()),
        }
    }
}

// Does not print the target: object graphs are routinely cyclic.
impl<T: Entity> fmt::Debug for Related<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Related::Loaded(_) => write!(f, "Loaded({})", T::ENTITY_TYPE),
            Related::NotLoaded(identity) => write!(f, "NotLoaded({})", identity),
        }
    }
}

/// Type-erased form of [`Related`]
#[derive(Debug, Clone)]
pub(crate) enum RelatedHandle {
    Loaded(ErasedRef),
    NotLoaded(Identity),
}
