//! Persistence context
//!
//! A [`Session`] is one unit of work. It tracks instances in its identity
//! map, cascades lifecycle operations across relationships and writes the
//! accumulated changes to a [`StorageGateway`] when flushed.
//!
//! ## Responsibilities
//!
//! - Assigning identities and keys on attach
//! - Lifecycle transitions (persist, remove, detach, merge)
//! - Loading through the gateway without ever aliasing an identity
//! - Applying flush bookkeeping only after storage committed
//!
//! ## Non-Responsibilities
//!
//! - Building SQL (gateway)
//! - Retrying conflicts (caller)
//!
//! Sessions are single-threaded. Instances hold shared references, so a
//! session is neither `Send` nor `Sync`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use keel_core_types::{FlushId, UnitOfWorkContext};

use crate::cascade::{self, VisitKey};
use crate::config::{FlushMode, SessionConfig};
use crate::errors::{KeelError, Result};
use crate::flush::{self, ChangeSet, Effect, FlushSummary};
use crate::gateway::StorageGateway;
use crate::identity_map::{IdentityMap, ManagedEntry};
use crate::keygen::KeyGenerator;
use crate::model::{
    DetachedState, Entity, EntityRef, EntityState, ErasedRef, Identity, Key, Related,
    RelatedHandle, Row,
};
use crate::registry::ops::EdgeValue;
use crate::registry::{CascadeOp, EntityDescriptor, Registry, RelationshipEdge};
use crate::snapshot::{capture, compute_diff, key_of, CaptureMode, FieldDiff, Snapshot};
use crate::{log_op_end, log_op_error, log_op_start};

static NEXT_TAG: AtomicU64 = AtomicU64::new(1);

/// One unit of work against storage
pub struct Session {
    registry: Arc<Registry>,
    keys: Arc<dyn KeyGenerator>,
    config: SessionConfig,
    context: UnitOfWorkContext,
    tag: u64,
    map: IdentityMap,
}

/// How a merged source maps onto the session
enum MergeKind {
    /// Copy onto the instance already managed under the same identity
    Existing,
    /// Copy onto a fresh instance registered once resolution succeeded
    New {
        persisted: bool,
        baseline: Option<Snapshot>,
        version: Option<i64>,
    },
}

struct MergeNode {
    target: ErasedRef,
    kind: MergeKind,
    key: Key,
    fields: Row,
    edges: Vec<(usize, EdgeValue)>,
}

impl Session {
    pub fn new(registry: Arc<Registry>, keys: Arc<dyn KeyGenerator>) -> Self {
        Self::with_config(registry, keys, SessionConfig::default())
    }

    pub fn with_config(
        registry: Arc<Registry>,
        keys: Arc<dyn KeyGenerator>,
        config: SessionConfig,
    ) -> Self {
        let mut context = UnitOfWorkContext::new();
        context.label = config.label.clone();
        tracing::debug!(
            session_id = context.session_id.as_str(),
            label = context.label.as_deref().unwrap_or(""),
            flush_mode = ?config.flush_mode,
            "session opened"
        );
        Self {
            registry,
            keys,
            config,
            context,
            tag: NEXT_TAG.fetch_add(1, Ordering::Relaxed),
            map: IdentityMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        self.context.session_id.as_str()
    }

    pub fn context(&self) -> &UnitOfWorkContext {
        &self.context
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn identity_map(&self) -> &IdentityMap {
        &self.map
    }

    /// Tracked entries, including those scheduled for removal
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    // ========== Identity map ==========

    /// Start tracking a new instance
    ///
    /// An empty key is filled from the key generator and a versioned type
    /// gets the configured initial version. No relationships are followed.
    ///
    /// # Errors
    ///
    /// - `DuplicateIdentity` if the identity or the instance is already tracked
    /// - `ManagedElsewhere` if another live session tracks the instance
    /// - `DetachedEntityOperation` if the instance left a session before
    pub fn attach<T: Entity>(&mut self, entity: &EntityRef<T>) -> Result<Identity> {
        let started = self.begin("attach", T::ENTITY_TYPE);
        let result = self
            .check_registered::<T>()
            .and_then(|()| self.attach_erased("attach", &entity.erase(), false, None));
        self.finish("attach", started, result)
    }

    /// Start tracking an instance that mirrors a stored row
    ///
    /// Its current values become the baseline, or its detached memory when
    /// it left a session earlier.
    ///
    /// # Errors
    ///
    /// As [`Session::attach`], plus `MissingKey` if the key is empty.
    pub fn attach_existing<T: Entity>(&mut self, entity: &EntityRef<T>) -> Result<Identity> {
        let started = self.begin("attach_existing", T::ENTITY_TYPE);
        let result = self
            .check_registered::<T>()
            .and_then(|()| self.attach_erased("attach_existing", &entity.erase(), true, None));
        self.finish("attach_existing", started, result)
    }

    /// Managed instance for `key`; entries scheduled for removal are hidden
    pub fn lookup<T: Entity>(&self, key: impl Into<Key>) -> Option<EntityRef<T>> {
        let identity = Identity::new(T::ENTITY_TYPE, key);
        self.map
            .lookup(&identity)
            .filter(|entry| entry.state() == EntityState::Managed)
            .and_then(|entry| entry.instance().downcast::<T>())
    }

    /// True if this exact instance is managed here
    pub fn contains<T: Entity>(&self, entity: &EntityRef<T>) -> bool {
        self.map
            .find_instance(&entity.erase())
            .is_some_and(|entry| entry.state() == EntityState::Managed)
    }

    pub fn state_of<T: Entity>(&self, entity: &EntityRef<T>) -> EntityState {
        let erased = entity.erase();
        if let Some(entry) = self.map.find_instance(&erased) {
            return entry.state();
        }
        let slot = erased.slot();
        if slot.owner().is_some() || slot.detached_state().is_some() {
            EntityState::Detached
        } else {
            EntityState::Transient
        }
    }

    pub fn identity_of<T: Entity>(&self, entity: &EntityRef<T>) -> Option<Identity> {
        self.map
            .find_instance(&entity.erase())
            .map(|entry| entry.identity().clone())
    }

    /// Tracking record of an instance, if this session tracks it
    pub fn entry_of<T: Entity>(&self, entity: &EntityRef<T>) -> Option<&ManagedEntry> {
        self.map.find_instance(&entity.erase())
    }

    // ========== Lifecycle ==========

    /// Make a transient graph managed along persist cascades
    ///
    /// Instances already managed here are left alone; removed ones are
    /// revived. The whole reachable set is validated, and keys for key-less
    /// instances are drawn, before anything is attached; on failure the
    /// session tracks exactly what it tracked before.
    ///
    /// # Errors
    ///
    /// - `ManagedElsewhere` if any reached instance belongs to another session
    /// - `DetachedEntityOperation` if any reached instance is detached (use `merge`)
    /// - `DuplicateIdentity` if two reached instances share an identity, or one
    ///   collides with a tracked identity
    /// - `EntityInUse` if a reached instance is borrowed while its key is set
    pub fn persist<T: Entity>(&mut self, entity: &EntityRef<T>) -> Result<Identity> {
        let started = self.begin("persist", T::ENTITY_TYPE);
        let result = self
            .check_registered::<T>()
            .and_then(|()| self.persist_erased(&entity.erase()));
        self.finish("persist", started, result)
    }

    /// Schedule a managed graph for deletion along remove cascades
    ///
    /// Removing an entry already scheduled is a no-op. Reached instances
    /// that were never stored are skipped.
    ///
    /// # Errors
    ///
    /// - `DetachedEntityOperation` if the root or a reached stored instance
    ///   is not managed here
    /// - `ManagedElsewhere` if a reached instance belongs to another session
    pub fn remove<T: Entity>(&mut self, entity: &EntityRef<T>) -> Result<()> {
        let started = self.begin("remove", T::ENTITY_TYPE);
        let result = self.remove_erased(&entity.erase());
        self.finish("remove", started, result)
    }

    /// Stop tracking an instance and everything reached along detach
    /// cascades; pending changes to them are dropped
    ///
    /// Detaching an untracked instance is a no-op.
    pub fn detach<T: Entity>(&mut self, entity: &EntityRef<T>) -> Result<()> {
        let started = self.begin("detach", T::ENTITY_TYPE);
        let result = self.detach_erased(&entity.erase());
        self.finish("detach", started, result)
    }

    /// Copy a detached graph into this session and return the managed copy
    ///
    /// Nothing is registered or overwritten unless the whole graph resolves.
    ///
    /// # Errors
    ///
    /// - `UnresolvedRelationshipTarget` for a key-less target of an edge
    ///   that does not cascade merge
    /// - `EntityRemoved` if the identity is scheduled for removal here
    /// - `StaleVersionConflict` if the source's version differs from the
    ///   managed token
    pub fn merge<T: Entity>(&mut self, detached: &EntityRef<T>) -> Result<EntityRef<T>> {
        let started = self.begin("merge", T::ENTITY_TYPE);
        let result = self
            .check_registered::<T>()
            .and_then(|()| self.merge_erased(&detached.erase()))
            .and_then(|managed| typed::<T>(&managed));
        self.finish("merge", started, result)
    }

    // ========== Loading ==========

    /// Managed instance for `key`, loading the row when it is not tracked
    ///
    /// Returns `None` when storage has no row or the identity is scheduled
    /// for removal.
    pub fn find<T: Entity>(
        &mut self,
        gateway: &mut dyn StorageGateway,
        key: impl Into<Key>,
    ) -> Result<Option<EntityRef<T>>> {
        let key = key.into();
        let started = self.begin("find", T::ENTITY_TYPE);
        let result = self
            .check_registered::<T>()
            .and_then(|()| self.find_erased(gateway, T::ENTITY_TYPE, key))
            .and_then(|found| found.map(|entity| typed::<T>(&entity)).transpose());
        self.finish("find", started, result)
    }

    /// Follow a reference, loading its target when it is not in memory
    ///
    /// # Errors
    ///
    /// `UnresolvedRelationshipTarget` if storage has no row for the target.
    pub fn resolve<T: Entity>(
        &mut self,
        gateway: &mut dyn StorageGateway,
        related: &Related<T>,
    ) -> Result<EntityRef<T>> {
        match related {
            Related::Loaded(entity) => Ok(entity.clone()),
            Related::NotLoaded(identity) => self
                .find::<T>(gateway, identity.key.clone())?
                .ok_or_else(|| KeelError::UnresolvedRelationshipTarget {
                    entity_type: identity.entity_type.to_string(),
                    edge: "<reference>".to_string(),
                    reason: format!("no stored row for {}", identity),
                }),
        }
    }

    /// Fill an inverse collection from the rows that reference its owner
    ///
    /// Members still in memory but not yet stored are kept. Returns the
    /// collection size.
    pub fn load_collection<T: Entity>(
        &mut self,
        gateway: &mut dyn StorageGateway,
        owner: &EntityRef<T>,
        edge: &str,
    ) -> Result<usize> {
        let started = self.begin("load_collection", T::ENTITY_TYPE);
        let result = self
            .check_registered::<T>()
            .and_then(|()| self.load_collection_erased(gateway, &owner.erase(), edge));
        self.finish("load_collection", started, result)
    }

    /// Overwrite a managed graph with stored values along refresh cascades
    ///
    /// Every row is read before any instance is touched.
    ///
    /// # Errors
    ///
    /// - `DetachedEntityOperation` / `EntityRemoved` if the root is not managed
    /// - `EntityNotFound` if a reached row no longer exists
    pub fn refresh<T: Entity>(
        &mut self,
        gateway: &mut dyn StorageGateway,
        entity: &EntityRef<T>,
    ) -> Result<()> {
        let started = self.begin("refresh", T::ENTITY_TYPE);
        let result = self.refresh_erased(gateway, &entity.erase());
        self.finish("refresh", started, result)
    }

    // ========== Dirty checking and flush ==========

    /// Changed fields of a managed instance since its last synchronization
    pub fn diff<T: Entity>(&self, entity: &EntityRef<T>) -> Result<FieldDiff> {
        let erased = entity.erase();
        let identity = self.require_managed("diff", &erased)?;
        let descriptor = self.registry.descriptor(identity.entity_type)?;
        let current = capture(&self.registry, descriptor, &erased, CaptureMode::Strict)?;
        let baseline = self
            .map
            .lookup(&identity)
            .map(ManagedEntry::snapshot)
            .ok_or_else(|| missing_entry(&identity))?;
        Ok(compute_diff(&identity, baseline, &current))
    }

    /// What the next flush would write
    pub fn change_set(&self) -> Result<ChangeSet> {
        flush::build_plan(&self.registry, &self.map, &self.config).map(|plan| plan.change_set)
    }

    /// Write every pending change in one atomic batch
    ///
    /// With nothing pending the gateway is not called. On failure no
    /// snapshot, version or entry changes; the flush may be retried.
    ///
    /// # Errors
    ///
    /// - `StaleVersionConflict` if a conditional write matched no row
    /// - `ConstraintViolation` if storage rejected an operation
    /// - `UnresolvedRelationshipTarget` / `DependencyCycle` from planning
    pub fn flush(&mut self, gateway: &mut dyn StorageGateway) -> Result<FlushSummary> {
        let flush_id = FlushId::new();
        log_op_start!(
            "flush",
            session_id = self.context.session_id.as_str(),
            flush_id = flush_id.as_str()
        );
        let started = Instant::now();
        let result = self.flush_pending(gateway);
        let duration_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(summary) => log_op_end!(
                "flush",
                duration_ms = duration_ms,
                session_id = self.context.session_id.as_str(),
                flush_id = flush_id.as_str(),
                inserts = summary.inserted.len(),
                updates = summary.updated.len(),
                deletes = summary.deleted.len()
            ),
            Err(err) => log_op_error!(
                "flush",
                err.clone(),
                duration_ms = duration_ms,
                session_id = self.context.session_id.as_str(),
                flush_id = flush_id.as_str()
            ),
        }
        result
    }

    /// Flush, then detach everything on success
    pub fn commit(&mut self, gateway: &mut dyn StorageGateway) -> Result<FlushSummary> {
        let summary = self.flush(gateway)?;
        self.clear();
        Ok(summary)
    }

    /// Detach every tracked instance, dropping pending changes
    pub fn clear(&mut self) {
        let detached = self.evict_all();
        tracing::debug!(
            session_id = self.context.session_id.as_str(),
            detached,
            "session cleared"
        );
    }

    /// End the unit of work without flushing
    pub fn close(self) {
        tracing::debug!(
            session_id = self.context.session_id.as_str(),
            tracked = self.map.len(),
            "session closed"
        );
    }

    // ========== Internals ==========

    fn begin(&self, op: &'static str, entity_type: &str) -> Instant {
        log_op_start!(
            op,
            session_id = self.context.session_id.as_str(),
            entity_type = entity_type
        );
        Instant::now()
    }

    fn finish<R>(&self, op: &'static str, started: Instant, result: Result<R>) -> Result<R> {
        let duration_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => log_op_end!(
                op,
                duration_ms = duration_ms,
                session_id = self.context.session_id.as_str()
            ),
            Err(err) => log_op_error!(
                op,
                err.clone(),
                duration_ms = duration_ms,
                session_id = self.context.session_id.as_str()
            ),
        }
        result
    }

    fn check_registered<T: Entity>(&self) -> Result<()> {
        self.registry.descriptor_of::<T>().map(|_| ())
    }

    fn describe(&self, entity: &ErasedRef) -> String {
        match key_of(&self.registry, entity) {
            Ok(Some(key)) => Identity::new(entity.entity_type(), key).to_string(),
            _ => format!("{}#<unassigned>", entity.entity_type()),
        }
    }

    fn ensure_not_elsewhere(&self, entity: &ErasedRef) -> Result<()> {
        match entity.slot().owner() {
            Some(owner) if owner != self.tag => Err(KeelError::ManagedElsewhere {
                entity: self.describe(entity),
            }),
            _ => Ok(()),
        }
    }

    fn require_managed(&self, op: &str, entity: &ErasedRef) -> Result<Identity> {
        match self.map.find_instance(entity) {
            Some(entry) if entry.state() == EntityState::Managed => Ok(entry.identity().clone()),
            Some(entry) => Err(KeelError::EntityRemoved {
                op: op.to_string(),
                identity: entry.identity().clone(),
            }),
            None => Err(KeelError::DetachedEntityOperation {
                op: op.to_string(),
                entity: self.describe(entity),
            }),
        }
    }

    /// Handle for a reference to `identity`: the managed instance if any
    fn handle_for(&self, identity: Identity) -> RelatedHandle {
        match self.map.lookup(&identity) {
            Some(entry) if entry.state() == EntityState::Managed => {
                RelatedHandle::Loaded(entry.instance().clone())
            }
            _ => RelatedHandle::NotLoaded(identity),
        }
    }

    /// `reserved` supplies the key for a key-less instance; otherwise one is
    /// generated
    fn attach_erased(
        &mut self,
        op: &str,
        entity: &ErasedRef,
        existing: bool,
        reserved: Option<Key>,
    ) -> Result<Identity> {
        self.ensure_not_elsewhere(entity)?;
        if let Some(entry) = self.map.find_instance(entity) {
            return Err(KeelError::DuplicateIdentity {
                identity: entry.identity().clone(),
            });
        }
        let history = entity.slot().detached_state();
        if history.is_some() && !existing {
            return Err(KeelError::DetachedEntityOperation {
                op: op.to_string(),
                entity: self.describe(entity),
            });
        }

        let registry = Arc::clone(&self.registry);
        let descriptor = registry.descriptor(entity.entity_type())?;
        let ops = descriptor.ops();
        let key = match ops.key(entity)? {
            Some(key) => key,
            None if existing => {
                return Err(KeelError::MissingKey {
                    op: op.to_string(),
                    entity_type: descriptor.entity_type().to_string(),
                })
            }
            None => match reserved {
                Some(key) => key,
                None => self.keys.next_key(descriptor.entity_type())?,
            },
        };
        let identity = Identity::new(descriptor.entity_type(), key);
        if self.map.contains(&identity) {
            return Err(KeelError::DuplicateIdentity { identity });
        }
        ops.set_key(entity, &identity.key)?;

        let (snapshot, version, persisted) = match history {
            Some(state) => (state.snapshot, state.version, state.persisted),
            None => {
                if !existing && descriptor.is_versioned() {
                    ops.set_version(entity, self.config.initial_version)?;
                }
                let snapshot = capture(&registry, descriptor, entity, CaptureMode::Lenient)?;
                (snapshot, ops.version(entity)?, existing)
            }
        };

        self.map
            .insert(identity.clone(), entity.clone(), snapshot, version, persisted)?;
        entity.slot().set_owner(Some(self.tag));
        entity.slot().set_detached_state(None);
        tracing::debug!(
            session_id = self.context.session_id.as_str(),
            identity = %identity,
            persisted,
            "entity attached"
        );
        Ok(identity)
    }

    fn persist_erased(&mut self, root: &ErasedRef) -> Result<Identity> {
        let targets = cascade::reachable_instances(&self.registry, CascadeOp::Persist, root)?;

        let mut revive = Vec::new();
        let mut attach = Vec::new();
        let mut keyless = Vec::new();
        let mut claimed = HashSet::new();
        for target in &targets {
            self.ensure_not_elsewhere(target)?;
            if let Some(entry) = self.map.find_instance(target) {
                if entry.state() == EntityState::Removed {
                    revive.push(entry.identity().clone());
                }
                continue;
            }
            if target.slot().detached_state().is_some() {
                return Err(KeelError::DetachedEntityOperation {
                    op: "persist".to_string(),
                    entity: self.describe(target),
                });
            }
            match key_of(&self.registry, target)? {
                Some(key) => {
                    let identity = Identity::new(target.entity_type(), key);
                    if self.map.contains(&identity) || !claimed.insert(identity.clone()) {
                        return Err(KeelError::DuplicateIdentity { identity });
                    }
                    attach.push((target.clone(), None));
                }
                None => keyless.push(target.clone()),
            }
        }

        // Generated keys must not collide with preset ones anywhere in the graph.
        for target in keyless {
            let key = self.keys.next_key(target.entity_type())?;
            let identity = Identity::new(target.entity_type(), key.clone());
            if self.map.contains(&identity) || !claimed.insert(identity.clone()) {
                return Err(KeelError::DuplicateIdentity { identity });
            }
            attach.push((target, Some(key)));
        }
        attach.sort_by_key(|(target, _)| {
            targets
                .iter()
                .position(|reached| reached.ptr_eq(target))
                .unwrap_or(usize::MAX)
        });

        let mut attached = Vec::with_capacity(attach.len());
        for (target, reserved) in attach {
            match self.attach_erased("persist", &target, false, reserved) {
                Ok(identity) => attached.push(identity),
                Err(err) => {
                    self.unwind_attached(&attached);
                    return Err(err);
                }
            }
        }
        for identity in &revive {
            if let Some(entry) = self.map.lookup_mut(identity) {
                entry.set_state(EntityState::Managed);
            }
        }

        self.map
            .find_instance(root)
            .map(|entry| entry.identity().clone())
            .ok_or_else(|| KeelError::Internal {
                message: format!("persist root {} was not attached", self.describe(root)),
            })
    }

    /// Evict entries attached by a cascade that failed part way
    ///
    /// Keys and initial versions already written into the instances stay.
    fn unwind_attached(&mut self, identities: &[Identity]) {
        for identity in identities {
            if let Some(entry) = self.map.remove(identity) {
                entry.instance().slot().set_owner(None);
            }
        }
        tracing::debug!(
            session_id = self.context.session_id.as_str(),
            evicted = identities.len(),
            "persist cascade unwound"
        );
    }

    fn remove_erased(&mut self, root: &ErasedRef) -> Result<()> {
        self.ensure_not_elsewhere(root)?;
        match self.map.find_instance(root) {
            None => {
                return Err(KeelError::DetachedEntityOperation {
                    op: "remove".to_string(),
                    entity: self.describe(root),
                })
            }
            Some(entry) if entry.state() == EntityState::Removed => return Ok(()),
            Some(_) => {}
        }

        let mut doomed = Vec::new();
        for target in cascade::reachable(&self.registry, CascadeOp::Remove, root)? {
            self.ensure_not_elsewhere(&target)?;
            match self.map.find_instance(&target) {
                Some(entry) => {
                    if entry.state() == EntityState::Managed {
                        doomed.push(entry.identity().clone());
                    }
                }
                None if target.slot().detached_state().is_some() => {
                    return Err(KeelError::DetachedEntityOperation {
                        op: "remove".to_string(),
                        entity: self.describe(&target),
                    });
                }
                // Never stored, nothing to delete.
                None => {}
            }
        }

        for identity in &doomed {
            if let Some(entry) = self.map.lookup_mut(identity) {
                entry.set_state(EntityState::Removed);
            }
        }
        Ok(())
    }

    fn detach_erased(&mut self, root: &ErasedRef) -> Result<()> {
        if self.map.find_instance(root).is_none() {
            return Ok(());
        }
        let identities: Vec<Identity> = cascade::reachable(&self.registry, CascadeOp::Detach, root)?
            .iter()
            .filter_map(|target| self.map.find_instance(target))
            .map(|entry| entry.identity().clone())
            .collect();
        for identity in &identities {
            self.evict(identity, true);
        }
        Ok(())
    }

    /// Drop an entry; `remember` keeps its snapshot on the instance
    fn evict(&mut self, identity: &Identity, remember: bool) {
        if let Some(entry) = self.map.remove(identity) {
            release(&entry, remember);
        }
    }

    fn evict_all(&mut self) -> usize {
        let entries = self.map.drain();
        for entry in &entries {
            release(entry, true);
        }
        entries.len()
    }

    fn merge_erased(&mut self, source: &ErasedRef) -> Result<ErasedRef> {
        let mut visited = HashMap::new();
        let mut nodes = Vec::new();
        let root = self.merge_resolve(source, &mut visited, &mut nodes)?;

        let registry = Arc::clone(&self.registry);
        for node in &nodes {
            let ops = registry.descriptor(node.target.entity_type())?.ops();
            ops.write_fields(&node.target, &node.fields)?;
            if let MergeKind::New { version, .. } = &node.kind {
                ops.set_key(&node.target, &node.key)?;
                if let Some(version) = version {
                    ops.set_version(&node.target, *version)?;
                }
            }
            for (index, value) in &node.edges {
                ops.set_edge(&node.target, *index, value.clone())?;
            }
        }

        for node in nodes {
            let MergeKind::New {
                persisted,
                baseline,
                version,
            } = node.kind
            else {
                continue;
            };
            let descriptor = registry.descriptor(node.target.entity_type())?;
            let snapshot = match baseline {
                Some(snapshot) => snapshot,
                None => capture(&registry, descriptor, &node.target, CaptureMode::Lenient)?,
            };
            let identity = Identity::new(descriptor.entity_type(), node.key);
            self.map
                .insert(identity, node.target.clone(), snapshot, version, persisted)?;
            node.target.slot().set_owner(Some(self.tag));
        }
        Ok(root)
    }

    /// Resolve `source` to its managed target, collecting the copies to make
    fn merge_resolve(
        &self,
        source: &ErasedRef,
        visited: &mut HashMap<VisitKey, ErasedRef>,
        nodes: &mut Vec<MergeNode>,
    ) -> Result<ErasedRef> {
        let visit = cascade::visit_key(&self.registry, source)?;
        if let Some(target) = visited.get(&visit) {
            return Ok(target.clone());
        }
        self.ensure_not_elsewhere(source)?;
        let descriptor = self.registry.descriptor(source.entity_type())?;
        let ops = descriptor.ops();

        if let Some(entry) = self.map.find_instance(source) {
            if entry.state() == EntityState::Removed {
                return Err(KeelError::EntityRemoved {
                    op: "merge".to_string(),
                    identity: entry.identity().clone(),
                });
            }
            visited.insert(visit, source.clone());
            for (index, edge) in descriptor.edges().iter().enumerate() {
                if edge.cascades(CascadeOp::Merge) {
                    for child in ops.edge(source, index)?.loaded() {
                        self.merge_resolve(&child, visited, nodes)?;
                    }
                }
            }
            return Ok(source.clone());
        }

        let (target, kind, key) = match ops.key(source)? {
            Some(key) => {
                let identity = Identity::new(descriptor.entity_type(), key.clone());
                match self.map.lookup(&identity) {
                    Some(entry) if entry.state() == EntityState::Removed => {
                        return Err(KeelError::EntityRemoved {
                            op: "merge".to_string(),
                            identity,
                        });
                    }
                    Some(entry) => {
                        if let (Some(expected), Some(found)) = (entry.version(), ops.version(source)?) {
                            if expected != found {
                                return Err(KeelError::StaleVersionConflict {
                                    identity,
                                    expected_version: Some(expected),
                                });
                            }
                        }
                        (entry.instance().clone(), MergeKind::Existing, key)
                    }
                    None => {
                        let kind = match source.slot().detached_state() {
                            Some(state) => MergeKind::New {
                                persisted: state.persisted,
                                baseline: Some(state.snapshot),
                                version: state.version,
                            },
                            None => MergeKind::New {
                                persisted: true,
                                baseline: None,
                                version: ops.version(source)?,
                            },
                        };
                        (ops.instantiate(), kind, key)
                    }
                }
            }
            None => {
                let key = self.keys.next_key(descriptor.entity_type())?;
                let kind = MergeKind::New {
                    persisted: false,
                    baseline: None,
                    version: descriptor
                        .version_column()
                        .map(|_| self.config.initial_version),
                };
                (ops.instantiate(), kind, key)
            }
        };
        visited.insert(visit, target.clone());

        let fields = ops.read_fields(source)?;
        let mut edges = Vec::with_capacity(descriptor.edges().len());
        for (index, edge) in descriptor.edges().iter().enumerate() {
            let value = ops.edge(source, index)?;
            let resolved = if edge.cascades(CascadeOp::Merge) {
                self.merge_edge(value, visited, nodes)?
            } else {
                self.rebind_edge(descriptor, edge, value, visited)?
            };
            edges.push((index, resolved));
        }

        nodes.push(MergeNode {
            target: target.clone(),
            kind,
            key,
            fields,
            edges,
        });
        Ok(target)
    }

    fn merge_edge(
        &self,
        value: EdgeValue,
        visited: &mut HashMap<VisitKey, ErasedRef>,
        nodes: &mut Vec<MergeNode>,
    ) -> Result<EdgeValue> {
        Ok(match value {
            EdgeValue::One(Some(RelatedHandle::Loaded(child))) => EdgeValue::One(Some(
                RelatedHandle::Loaded(self.merge_resolve(&child, visited, nodes)?),
            )),
            EdgeValue::One(Some(RelatedHandle::NotLoaded(identity))) => {
                EdgeValue::One(Some(self.handle_for(identity)))
            }
            EdgeValue::One(None) => EdgeValue::One(None),
            EdgeValue::Many(members) => EdgeValue::Many(
                members
                    .iter()
                    .map(|member| self.merge_resolve(member, visited, nodes))
                    .collect::<Result<_>>()?,
            ),
        })
    }

    /// Point a non-cascading edge at instances of this session
    fn rebind_edge(
        &self,
        descriptor: &EntityDescriptor,
        edge: &RelationshipEdge,
        value: EdgeValue,
        visited: &HashMap<VisitKey, ErasedRef>,
    ) -> Result<EdgeValue> {
        Ok(match value {
            EdgeValue::One(Some(RelatedHandle::Loaded(target))) => {
                EdgeValue::One(Some(self.rebind_target(descriptor, edge, &target, visited)?))
            }
            EdgeValue::One(Some(RelatedHandle::NotLoaded(identity))) => {
                EdgeValue::One(Some(self.handle_for(identity)))
            }
            EdgeValue::One(None) => EdgeValue::One(None),
            EdgeValue::Many(members) => {
                let mut rebound = Vec::with_capacity(members.len());
                for member in &members {
                    // Collections only hold loaded instances.
                    if let RelatedHandle::Loaded(instance) =
                        self.rebind_target(descriptor, edge, member, visited)?
                    {
                        rebound.push(instance);
                    }
                }
                EdgeValue::Many(rebound)
            }
        })
    }

    fn rebind_target(
        &self,
        descriptor: &EntityDescriptor,
        edge: &RelationshipEdge,
        target: &ErasedRef,
        visited: &HashMap<VisitKey, ErasedRef>,
    ) -> Result<RelatedHandle> {
        if let Some(merged) = visited.get(&cascade::visit_key(&self.registry, target)?) {
            return Ok(RelatedHandle::Loaded(merged.clone()));
        }
        match key_of(&self.registry, target)? {
            Some(key) => Ok(self.handle_for(Identity::new(target.entity_type(), key))),
            None => Err(KeelError::UnresolvedRelationshipTarget {
                entity_type: descriptor.entity_type().to_string(),
                edge: edge.name.to_string(),
                reason: format!(
                    "{} target has no key and the edge does not cascade merge",
                    edge.target
                ),
            }),
        }
    }

    fn find_erased(
        &mut self,
        gateway: &mut dyn StorageGateway,
        entity_type: &'static str,
        key: Key,
    ) -> Result<Option<ErasedRef>> {
        let identity = Identity::new(entity_type, key);
        if let Some(entry) = self.map.lookup(&identity) {
            return Ok((entry.state() == EntityState::Managed).then(|| entry.instance().clone()));
        }
        if self.config.flush_mode == FlushMode::Auto {
            self.flush_pending(gateway)?;
        }

        let registry = Arc::clone(&self.registry);
        let descriptor = registry.descriptor(entity_type)?;
        match gateway.load(descriptor.table(), descriptor.key_column(), &identity.key)? {
            Some(row) => self.materialize(descriptor, &identity, &row).map(Some),
            None => Ok(None),
        }
    }

    /// Build, hydrate and register an instance for a stored row
    fn materialize(
        &mut self,
        descriptor: &EntityDescriptor,
        identity: &Identity,
        row: &Row,
    ) -> Result<ErasedRef> {
        let ops = descriptor.ops();
        let instance = ops.instantiate();
        ops.set_key(&instance, &identity.key)?;
        self.hydrate(descriptor, &instance, row)?;
        let snapshot = capture(&self.registry, descriptor, &instance, CaptureMode::Lenient)?;
        self.map.insert(
            identity.clone(),
            instance.clone(),
            snapshot,
            ops.version(&instance)?,
            true,
        )?;
        instance.slot().set_owner(Some(self.tag));
        Ok(instance)
    }

    /// Copy a stored row onto an instance: scalars, version and owning references
    fn hydrate(&self, descriptor: &EntityDescriptor, instance: &ErasedRef, row: &Row) -> Result<()> {
        let ops = descriptor.ops();
        ops.write_fields(instance, row)?;
        if let Some(value) = descriptor.version_column().and_then(|column| row.get(column)) {
            ops.set_version(instance, i64::try_from(value.clone())?)?;
        }
        for (index, edge) in descriptor.edges().iter().enumerate() {
            let Some(column) = edge.join_column else {
                continue;
            };
            let handle = match row.get(column) {
                Some(value) => Key::from_value(value)?
                    .map(|key| self.handle_for(Identity::new(edge.target, key))),
                None => None,
            };
            ops.set_edge(instance, index, EdgeValue::One(handle))?;
        }
        Ok(())
    }

    fn load_collection_erased(
        &mut self,
        gateway: &mut dyn StorageGateway,
        owner: &ErasedRef,
        edge_name: &str,
    ) -> Result<usize> {
        let owner_identity = self.require_managed("load_collection", owner)?;
        let registry = Arc::clone(&self.registry);
        let descriptor = registry.descriptor(owner.entity_type())?;
        let unknown = || KeelError::UnknownRelationship {
            entity_type: descriptor.entity_type().to_string(),
            edge: edge_name.to_string(),
        };
        let (index, edge) = descriptor.edge(edge_name).ok_or_else(unknown)?;
        if !edge.is_collection() {
            return Err(unknown());
        }
        let target = registry.descriptor(edge.target)?;
        let join_column = edge
            .mapped_by
            .and_then(|mapped_by| target.edge(mapped_by))
            .and_then(|(_, inverse)| inverse.join_column)
            .ok_or_else(|| KeelError::Internal {
                message: format!("{}.{} has no join column", descriptor.entity_type(), edge.name),
            })?;

        if self.config.flush_mode == FlushMode::Auto {
            self.flush_pending(gateway)?;
        }

        let rows = gateway.load_referencing(target.table(), join_column, &owner_identity.key)?;
        let mut members = Vec::with_capacity(rows.len());
        let mut stored = Vec::with_capacity(rows.len());
        for row in &rows {
            let key = row
                .get(target.key_column())
                .map(Key::from_value)
                .transpose()?
                .flatten()
                .ok_or_else(|| KeelError::Storage {
                    op: "load_collection".to_string(),
                    message: format!("{} row without key", target.table()),
                })?;
            let identity = Identity::new(target.entity_type(), key);
            let tracked = self
                .map
                .lookup(&identity)
                .map(|entry| (entry.state(), entry.instance().clone()));
            let member = match tracked {
                Some((EntityState::Removed, _)) => continue,
                Some((_, instance)) => instance,
                None => self.materialize(target, &identity, row)?,
            };
            members.push(member);
            stored.push(identity);
        }

        let ops = descriptor.ops();
        for current in ops.edge(owner, index)?.loaded() {
            let unstored = self
                .map
                .find_instance(&current)
                .map_or(true, |entry| !entry.is_persisted());
            if unstored && !members.iter().any(|member| member.ptr_eq(&current)) {
                members.push(current);
            }
        }
        let size = members.len();
        ops.set_edge(owner, index, EdgeValue::Many(members))?;
        if let Some(entry) = self.map.lookup_mut(&owner_identity) {
            entry.snapshot_mut().set_collection(edge.name, stored);
        }
        Ok(size)
    }

    fn refresh_erased(&mut self, gateway: &mut dyn StorageGateway, root: &ErasedRef) -> Result<()> {
        self.require_managed("refresh", root)?;
        let registry = Arc::clone(&self.registry);

        let mut loaded = Vec::new();
        for target in cascade::reachable(&registry, CascadeOp::Refresh, root)? {
            let Some(entry) = self.map.find_instance(&target) else {
                continue;
            };
            if entry.state() != EntityState::Managed || !entry.is_persisted() {
                continue;
            }
            let identity = entry.identity().clone();
            let descriptor = registry.descriptor(identity.entity_type)?;
            let row = gateway
                .load(descriptor.table(), descriptor.key_column(), &identity.key)?
                .ok_or_else(|| KeelError::EntityNotFound {
                    identity: identity.clone(),
                })?;
            loaded.push((identity, target, row));
        }

        for (identity, target, row) in loaded {
            let descriptor = registry.descriptor(identity.entity_type)?;
            self.hydrate(descriptor, &target, &row)?;
            let snapshot = capture(&registry, descriptor, &target, CaptureMode::Lenient)?;
            let version = descriptor.ops().version(&target)?;
            if let Some(entry) = self.map.lookup_mut(&identity) {
                entry.set_snapshot(snapshot);
                entry.set_version(version);
            }
        }
        Ok(())
    }

    fn flush_pending(&mut self, gateway: &mut dyn StorageGateway) -> Result<FlushSummary> {
        let plan = flush::build_plan(&self.registry, &self.map, &self.config)?;
        if plan.batch.is_empty() {
            tracing::debug!(
                session_id = self.context.session_id.as_str(),
                "no pending writes"
            );
        } else {
            self.ensure_writable(&plan.effects)?;
            let result = gateway.submit(&plan.batch)?;
            crate::concurrency::interpret(&plan.batch, &result)?;
        }
        let summary = plan.summary();
        self.apply_effects(plan.effects)?;
        Ok(summary)
    }

    /// Version tokens are written back after storage commits, so every
    /// instance receiving one must be free to borrow before submitting
    fn ensure_writable(&self, effects: &[Effect]) -> Result<()> {
        for effect in effects {
            let Effect::Synchronize {
                identity,
                version: Some(_),
                ..
            } = effect
            else {
                continue;
            };
            if let Some(entry) = self.map.lookup(identity) {
                if entry.instance().slot().is_borrowed() {
                    return Err(KeelError::EntityInUse {
                        entity_type: identity.entity_type.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Bring the identity map in line with committed storage
    ///
    /// Every entry is synchronized before any version token is written back,
    /// so a failing write leaves the map consistent with storage and only
    /// the instance's version field stale.
    fn apply_effects(&mut self, effects: Vec<Effect>) -> Result<()> {
        let mut tokens = Vec::new();
        for effect in effects {
            match effect {
                Effect::Synchronize {
                    identity,
                    snapshot,
                    version,
                    inserted,
                } => {
                    let Some(entry) = self.map.lookup_mut(&identity) else {
                        continue;
                    };
                    entry.set_snapshot(snapshot);
                    entry.set_version(version);
                    if inserted {
                        entry.mark_persisted();
                    }
                    if let Some(version) = version {
                        tokens.push((identity, version));
                    }
                }
                Effect::Discard { identity } => self.evict(&identity, false),
            }
        }

        let mut failed = None;
        for (identity, version) in tokens {
            let Some(entry) = self.map.lookup(&identity) else {
                continue;
            };
            let written = self
                .registry
                .descriptor(identity.entity_type)
                .and_then(|descriptor| descriptor.ops().set_version(entry.instance(), version));
            if let Err(err) = written {
                failed.get_or_insert(err);
            }
        }
        failed.map_or(Ok(()), Err)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.evict_all();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.context.session_id)
            .field("tracked", &self.map.len())
            .field("config", &self.config)
            .finish()
    }
}

fn release(entry: &ManagedEntry, remember: bool) {
    let slot = entry.instance().slot();
    slot.set_owner(None);
    slot.set_detached_state(remember.then(|| DetachedState {
        snapshot: entry.snapshot().clone(),
        version: entry.version(),
        persisted: entry.is_persisted(),
    }));
}

fn typed<T: Entity>(entity: &ErasedRef) -> Result<EntityRef<T>> {
    entity.downcast::<T>().ok_or_else(|| KeelError::Internal {
        message: format!("{} instance is not a {}", entity.entity_type(), T::ENTITY_TYPE),
    })
}

fn missing_entry(identity: &Identity) -> KeelError {
    KeelError::Internal {
        message: format!("no identity map entry for {}", identity),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::gateway::MemoryGateway;
    use crate::keygen::SequenceKeyGenerator;
    use crate::model::Value;
    use crate::registry::EntityDescriptor;

    #[derive(Default, Debug)]
    struct Parrot {
        id: Option<i64>,
        name: String,
        version: i64,
    }

    impl Entity for Parrot {
        const ENTITY_TYPE: &'static str = "Parrot";
    }

    fn session() -> Session {
        let registry = Registry::builder()
            .register(
                EntityDescriptor::builder::<Parrot>()
                    .table("parrots")
                    .key("id", |p| &p.id, |p| &mut p.id)
                    .version("version", |p| &p.version, |p| &mut p.version)
                    .field("name", |p| &p.name, |p| &mut p.name)
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        Session::new(Arc::new(registry), Arc::new(SequenceKeyGenerator::new()))
    }

    fn parrot(name: &str) -> EntityRef<Parrot> {
        EntityRef::new(Parrot {
            name: name.to_string(),
            ..Default::default()
        })
    }

    #[test]
    fn test_attach_generates_key_and_initial_version() {
        let mut session = session();
        let polly = parrot("Polly");

        let identity = session.attach(&polly).unwrap();

        assert_eq!(identity, Identity::new("Parrot", 1));
        assert_eq!(polly.read(|p| p.id), Some(1));
        assert_eq!(session.state_of(&polly), EntityState::Managed);
        assert!(polly.is_managed());
    }

    #[test]
    fn test_attach_twice_is_duplicate() {
        let mut session = session();
        let polly = parrot("Polly");
        session.attach(&polly).unwrap();

        let err = session.attach(&polly).unwrap_err();
        assert!(matches!(err, KeelError::DuplicateIdentity { .. }));

        let twin = EntityRef::new(Parrot {
            id: Some(1),
            ..Default::default()
        });
        let err = session.attach(&twin).unwrap_err();
        assert_eq!(
            err,
            KeelError::DuplicateIdentity {
                identity: Identity::new("Parrot", 1)
            }
        );
    }

    #[test]
    fn test_instance_managed_in_one_session_only() {
        let mut first = session();
        let mut second = session();
        let polly = parrot("Polly");
        first.attach(&polly).unwrap();

        let err = second.attach(&polly).unwrap_err();
        assert!(matches!(err, KeelError::ManagedElsewhere { .. }));
        assert_eq!(second.state_of(&polly), EntityState::Detached);
    }

    #[test]
    fn test_attach_existing_requires_key() {
        let mut session = session();
        let err = session.attach_existing(&parrot("Polly")).unwrap_err();
        assert!(matches!(err, KeelError::MissingKey { .. }));
    }

    #[test]
    fn test_flush_inserts_then_updates_changed_field_only() {
        let mut session = session();
        let mut gateway = MemoryGateway::new();
        let polly = parrot("Polly");
        session.persist(&polly).unwrap();

        session.flush(&mut gateway).unwrap();
        assert_eq!(gateway.count("parrots"), 1);

        polly.update(|p| p.name = "Pretty Polly".to_string());
        let summary = session.flush(&mut gateway).unwrap();

        assert_eq!(summary.updated.len(), 1);
        assert_eq!(summary.updated[0].fields, vec!["name".to_string()]);
        assert_eq!(polly.read(|p| p.version), 1);
        let row = gateway.row("parrots", 1).unwrap();
        assert_eq!(row.get("version"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_flush_without_changes_skips_gateway() {
        let mut session = session();
        let mut gateway = MemoryGateway::new();
        session.persist(&parrot("Polly")).unwrap();
        session.flush(&mut gateway).unwrap();
        let before = gateway.stats();

        let summary = session.flush(&mut gateway).unwrap();

        assert!(summary.is_empty());
        assert_eq!(gateway.stats(), before);
    }

    #[test]
    fn test_removed_unstored_entity_is_discarded_silently() {
        let mut session = session();
        let mut gateway = MemoryGateway::new();
        let polly = parrot("Polly");
        session.persist(&polly).unwrap();
        session.remove(&polly).unwrap();

        let summary = session.flush(&mut gateway).unwrap();

        assert!(summary.is_empty());
        assert_eq!(gateway.stats().batches, 0);
        assert!(session.is_empty());
        assert_eq!(session.state_of(&polly), EntityState::Transient);
    }

    #[test]
    fn test_find_returns_tracked_instance() {
        let mut session = session();
        let mut gateway = MemoryGateway::new();
        let polly = parrot("Polly");
        session.persist(&polly).unwrap();
        session.flush(&mut gateway).unwrap();

        let found = session.find::<Parrot>(&mut gateway, 1).unwrap().unwrap();
        assert!(found.ptr_eq(&polly));
        assert_eq!(gateway.stats().operations, 1);
    }

    #[test]
    fn test_close_detaches_with_memory() {
        let mut session_a = session();
        let mut gateway = MemoryGateway::new();
        let polly = parrot("Polly");
        session_a.persist(&polly).unwrap();
        session_a.flush(&mut gateway).unwrap();

        session_a.close();

        assert!(!polly.is_managed());
        let mut session_b = session();
        assert_eq!(session_b.state_of(&polly), EntityState::Detached);
        let err = session_b.persist(&polly).unwrap_err();
        assert!(matches!(err, KeelError::DetachedEntityOperation { .. }));
    }
}
