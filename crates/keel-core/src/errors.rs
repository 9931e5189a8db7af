use keel_core_types::SessionId;
use thiserror::Error;

use crate::model::Identity;

/// Result type alias using KeelError
pub type Result<T> = std::result::Result<T, KeelError>;

// ========== Error Facility ==========

/// Canonical error kind taxonomy
///
/// This taxonomy provides a stable, structured classification of all errors
/// raised by the persistence engine. Each kind maps to a stable error code
/// that can be used for programmatic handling, logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExErrorKind {
    // Identity map
    DuplicateIdentity,
    ManagedElsewhere,
    DetachedEntity,
    EntityRemoved,
    EntityInUse,
    NotFound,
    MissingKey,

    // Relationships
    UnresolvedTarget,
    CycleDetected,

    // Mapping
    InvalidDescriptor,
    TypeMismatch,

    // Flush
    StaleVersion,
    ConstraintViolation,
    Persistence,
    Serialization,

    // Internal
    Internal,
}

impl ExErrorKind {
    /// Get the stable error code for this kind
    pub fn code(&self) -> &'static str {
        match self {
            ExErrorKind::DuplicateIdentity => "ERR_DUPLICATE_IDENTITY",
            ExErrorKind::ManagedElsewhere => "ERR_MANAGED_ELSEWHERE",
            ExErrorKind::DetachedEntity => "ERR_DETACHED_ENTITY",
            ExErrorKind::EntityRemoved => "ERR_ENTITY_REMOVED",
            ExErrorKind::EntityInUse => "ERR_ENTITY_IN_USE",
            ExErrorKind::NotFound => "ERR_NOT_FOUND",
            ExErrorKind::MissingKey => "ERR_MISSING_KEY",
            ExErrorKind::UnresolvedTarget => "ERR_UNRESOLVED_TARGET",
            ExErrorKind::CycleDetected => "ERR_CYCLE_DETECTED",
            ExErrorKind::InvalidDescriptor => "ERR_INVALID_DESCRIPTOR",
            ExErrorKind::TypeMismatch => "ERR_TYPE_MISMATCH",
            ExErrorKind::StaleVersion => "ERR_STALE_VERSION",
            ExErrorKind::ConstraintViolation => "ERR_CONSTRAINT_VIOLATION",
            ExErrorKind::Persistence => "ERR_PERSISTENCE",
            ExErrorKind::Serialization => "ERR_SERIALIZATION",
            ExErrorKind::Internal => "ERR_INTERNAL",
        }
    }

    /// Whether retrying the whole unit of work can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExErrorKind::StaleVersion)
    }
}

/// Canonical structured error type
///
/// Carries the classification fields used for logging and programmatic
/// handling, plus context for debugging.
#[derive(Debug, Clone)]
pub struct ExError {
    kind: ExErrorKind,
    op: Option<String>,
    entity: Option<String>,
    session_id: Option<SessionId>,
    message: String,
}

impl ExError {
    /// Create a new error with the specified kind
    pub fn new(kind: ExErrorKind) -> Self {
        Self {
            kind,
            op: None,
            entity: None,
            session_id: None,
            message: String::new(),
        }
    }

    /// Add operation context
    pub fn with_op(mut self, op: impl Into<String>) -> Self {
        self.op = Some(op.into());
        self
    }

    /// Add entity context (usually an identity such as `Pirate#1`)
    pub fn with_entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }

    /// Add session context
    pub fn with_session_id(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Add custom message
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Get the error kind
    pub fn kind(&self) -> ExErrorKind {
        self.kind
    }

    /// Get the stable error code
    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    /// Get the operation context, if any
    pub fn op(&self) -> Option<&str> {
        self.op.as_deref()
    }

    /// Get the entity context, if any
    pub fn entity(&self) -> Option<&str> {
        self.entity.as_deref()
    }

    /// Get the session context, if any
    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for ExError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.code())?;
        if let Some(op) = &self.op {
            write!(f, " in operation '{}'", op)?;
        }
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        if let Some(entity) = &self.entity {
            write!(f, " (entity: {})", entity)?;
        }
        Ok(())
    }
}

impl std::error::Error for ExError {}

// ========== End Error Facility ==========

/// Error taxonomy for persistence-context operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum KeelError {
    // ===== Identity map =====
    /// An entry with this identity is already tracked by the session
    #[error("Duplicate identity in session: {identity}")]
    DuplicateIdentity { identity: Identity },

    /// The instance is currently managed by another live session
    #[error("Entity {entity} is managed by another session")]
    ManagedElsewhere { entity: String },

    /// Operation requires a managed entity but the instance is not tracked here
    #[error("Cannot {op} entity {entity}: it is not managed by this session")]
    DetachedEntityOperation { op: String, entity: String },

    /// Operation targets an entry already scheduled for deletion
    #[error("Cannot {op} entity {identity}: it is scheduled for removal")]
    EntityRemoved { op: String, identity: Identity },

    /// Storage has no row for the identity
    #[error("Entity not found in storage: {identity}")]
    EntityNotFound { identity: Identity },

    /// An operation that needs an existing row got an instance without a key
    #[error("Cannot {op} entity of type {entity_type}: it has no key")]
    MissingKey { op: String, entity_type: String },

    /// The instance is mutably borrowed while the engine needs to read it
    #[error("Entity of type {entity_type} is borrowed elsewhere")]
    EntityInUse { entity_type: String },

    // ===== Relationships =====
    /// A reference cannot be resolved to a valid identity
    #[error("Unresolved relationship target via {entity_type}.{edge}: {reason}")]
    UnresolvedRelationshipTarget {
        entity_type: String,
        edge: String,
        reason: String,
    },

    /// Insert or delete ordering has a foreign-key cycle
    #[error("Foreign-key dependency cycle between: {identities:?}")]
    DependencyCycle { identities: Vec<String> },

    // ===== Mapping =====
    /// The entity type was never registered
    #[error("Unknown entity type: {entity_type}")]
    UnknownEntityType { entity_type: String },

    /// The entity type has no relationship with this name
    #[error("Unknown relationship {entity_type}.{edge}")]
    UnknownRelationship { entity_type: String, edge: String },

    /// Descriptor or registry declaration is inconsistent
    #[error("Invalid descriptor for {entity_type}: {reason}")]
    InvalidDescriptor { entity_type: String, reason: String },

    /// A stored value does not fit the mapped field type
    #[error("Type mismatch: expected {expected}, found {found}")]
    FieldTypeMismatch { expected: String, found: String },

    // ===== Flush =====
    /// Optimistic version check failed; the whole flush was rolled back
    #[error("Stale version for {identity} (expected version {expected_version:?})")]
    StaleVersionConflict {
        identity: Identity,
        expected_version: Option<i64>,
    },

    /// Storage rejected an operation; the whole flush was rolled back
    #[error("Constraint violation on {identity}: {message}")]
    ConstraintViolation { identity: Identity, message: String },

    /// Storage transport or SQL failure
    #[error("Storage error in {op}: {message}")]
    Storage { op: String, message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl KeelError {
    /// Whether retrying the whole unit of work can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, KeelError::StaleVersionConflict { .. })
    }

    pub(crate) fn mismatch(expected: &str, found: impl std::fmt::Debug) -> Self {
        KeelError::FieldTypeMismatch {
            expected: expected.to_string(),
            found: format!("{:?}", found),
        }
    }
}

impl From<KeelError> for ExError {
    fn from(err: KeelError) -> Self {
        match err {
            KeelError::DuplicateIdentity { identity } => {
                ExError::new(ExErrorKind::DuplicateIdentity)
                    .with_entity(identity.to_string())
                    .with_op("attach")
                    .with_message("Identity already present in the identity map")
            }

            KeelError::ManagedElsewhere { entity } => ExError::new(ExErrorKind::ManagedElsewhere)
                .with_entity(entity)
                .with_message("Entity is managed by another session"),

            KeelError::DetachedEntityOperation { op, entity } => {
                ExError::new(ExErrorKind::DetachedEntity)
                    .with_entity(entity)
                    .with_op(op)
                    .with_message("Entity is not managed by this session")
            }

            KeelError::EntityRemoved { op, identity } => ExError::new(ExErrorKind::EntityRemoved)
                .with_entity(identity.to_string())
                .with_op(op)
                .with_message("Entity is scheduled for removal"),

            KeelError::EntityNotFound { identity } => ExError::new(ExErrorKind::NotFound)
                .with_entity(identity.to_string())
                .with_message("Entity not found in storage"),

            KeelError::MissingKey { op, entity_type } => ExError::new(ExErrorKind::MissingKey)
                .with_entity(entity_type)
                .with_op(op)
                .with_message("Entity has no key"),

            KeelError::EntityInUse { entity_type } => ExError::new(ExErrorKind::EntityInUse)
                .with_entity(entity_type)
                .with_message("Entity is mutably borrowed"),

            KeelError::UnresolvedRelationshipTarget {
                entity_type,
                edge,
                reason,
            } => ExError::new(ExErrorKind::UnresolvedTarget)
                .with_entity(entity_type)
                .with_message(format!("Relationship {}: {}", edge, reason)),

            KeelError::DependencyCycle { identities } => {
                ExError::new(ExErrorKind::CycleDetected)
                    .with_op("flush")
                    .with_message(format!("Dependency cycle: {}", identities.join(", ")))
            }

            KeelError::UnknownEntityType { entity_type } => {
                ExError::new(ExErrorKind::InvalidDescriptor)
                    .with_entity(entity_type)
                    .with_message("Entity type is not registered")
            }

            KeelError::UnknownRelationship { entity_type, edge } => {
                ExError::new(ExErrorKind::InvalidDescriptor)
                    .with_entity(entity_type)
                    .with_message(format!("Unknown relationship {}", edge))
            }

            KeelError::InvalidDescriptor {
                entity_type,
                reason,
            } => ExError::new(ExErrorKind::InvalidDescriptor)
                .with_entity(entity_type)
                .with_message(reason),

            KeelError::FieldTypeMismatch { expected, found } => {
                ExError::new(ExErrorKind::TypeMismatch)
                    .with_message(format!("Expected {}, found {}", expected, found))
            }

            KeelError::StaleVersionConflict {
                identity,
                expected_version,
            } => ExError::new(ExErrorKind::StaleVersion)
                .with_entity(identity.to_string())
                .with_op("flush")
                .with_message(match expected_version {
                    Some(v) => format!("Row no longer at version {}", v),
                    None => "Row no longer exists".to_string(),
                }),

            KeelError::ConstraintViolation { identity, message } => {
                ExError::new(ExErrorKind::ConstraintViolation)
                    .with_entity(identity.to_string())
                    .with_op("flush")
                    .with_message(message)
            }

            KeelError::Storage { op, message } => ExError::new(ExErrorKind::Persistence)
                .with_op(op)
                .with_message(message),

            KeelError::Serialization { message } => {
                ExError::new(ExErrorKind::Serialization).with_message(message)
            }

            KeelError::Internal { message } => {
                ExError::new(ExErrorKind::Internal).with_message(message)
            }
        }
    }
}

/// Conversion from serde_json::Error to KeelError
impl From<serde_json::Error> for KeelError {
    fn from(err: serde_json::Error) -> Self {
        KeelError::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_codes() {
        let cases = [
            (ExErrorKind::DuplicateIdentity, "ERR_DUPLICATE_IDENTITY"),
            (ExErrorKind::UnresolvedTarget, "ERR_UNRESOLVED_TARGET"),
            (ExErrorKind::StaleVersion, "ERR_STALE_VERSION"),
            (ExErrorKind::ConstraintViolation, "ERR_CONSTRAINT_VIOLATION"),
            (ExErrorKind::DetachedEntity, "ERR_DETACHED_ENTITY"),
        ];
        for (kind, expected_code) in cases {
            assert_eq!(kind.code(), expected_code, "Wrong code for {:?}", kind);
        }
    }

    #[test]
    fn test_stale_version_maps_to_retryable_kind() {
        let err = KeelError::StaleVersionConflict {
            identity: Identity::new("Pirate", 1),
            expected_version: Some(0),
        };
        assert!(err.is_retryable());

        let ex: ExError = err.into();
        assert_eq!(ex.kind(), ExErrorKind::StaleVersion);
        assert!(ex.kind().is_retryable());
        assert_eq!(ex.entity(), Some("Pirate#1"));
    }

    #[test]
    fn test_constraint_violation_identifies_entity() {
        let err = KeelError::ConstraintViolation {
            identity: Identity::new("CrewMember", 7),
            message: "UNIQUE constraint failed".to_string(),
        };
        assert!(!err.is_retryable());

        let ex: ExError = err.into();
        assert_eq!(ex.code(), "ERR_CONSTRAINT_VIOLATION");
        assert_eq!(ex.entity(), Some("CrewMember#7"));
        assert!(ex.to_string().contains("UNIQUE constraint failed"));
    }

    #[test]
    fn test_ex_error_display_includes_op() {
        let err = ExError::new(ExErrorKind::DetachedEntity)
            .with_op("remove")
            .with_message("not managed");
        let rendered = err.to_string();
        assert!(rendered.starts_with("[ERR_DETACHED_ENTITY]"));
        assert!(rendered.contains("'remove'"));
    }
}
