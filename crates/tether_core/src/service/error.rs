//! Shared service error for entity, relationship and cascade use-cases.
//!
//! # Invariants
//! - Every variant maps to exactly one `ErrorKind`.
//! - Store failures keep the underlying `RepoError` as their source.

use crate::model::entity::EntityId;
use crate::model::validation::ValidationError;
use crate::repo::RepoError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type CoreResult<T> = Result<T, CoreError>;

/// What a `NotFound` error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundTarget {
    Entity(EntityId),
    Relationship {
        source_id: EntityId,
        target_id: EntityId,
    },
}

/// Coarse error classification for callers mapping errors to responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Validation,
    InactiveEndpoint,
    InvalidTransition,
    Conflict,
    Store,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Validation => "validation",
            Self::InactiveEndpoint => "inactive_endpoint",
            Self::InvalidTransition => "invalid_transition",
            Self::Conflict => "conflict",
            Self::Store => "store",
        }
    }
}

/// Service error for core use-cases.
#[derive(Debug)]
pub enum CoreError {
    NotFound(NotFoundTarget),
    Validation(ValidationError),
    /// Endpoint entity is soft-deleted.
    InactiveEndpoint(EntityId),
    /// Entity is not in a state the requested operation accepts.
    InvalidTransition { id: EntityId, reason: &'static str },
    /// An active relationship already exists for the pair.
    Conflict {
        source_id: EntityId,
        target_id: EntityId,
    },
    /// Propagation went deeper than the configured limit.
    CascadeDepthExceeded { depth: usize },
    Store(RepoError),
}

impl CoreError {
    pub fn entity_not_found(id: EntityId) -> Self {
        Self::NotFound(NotFoundTarget::Entity(id))
    }

    pub fn relationship_not_found(source_id: EntityId, target_id: EntityId) -> Self {
        Self::NotFound(NotFoundTarget::Relationship {
            source_id,
            target_id,
        })
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Validation(_) => ErrorKind::Validation,
            Self::InactiveEndpoint(_) => ErrorKind::InactiveEndpoint,
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::CascadeDepthExceeded { .. } | Self::Store(_) => ErrorKind::Store,
        }
    }

    /// HTTP status a transport layer would answer with.
    pub fn http_status(&self) -> u16 {
        match self.kind() {
            ErrorKind::NotFound => 404,
            ErrorKind::Validation | ErrorKind::InactiveEndpoint | ErrorKind::InvalidTransition => {
                400
            }
            ErrorKind::Conflict => 409,
            ErrorKind::Store => 500,
        }
    }
}

impl Display for CoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(NotFoundTarget::Entity(id)) => write!(f, "entity not found: {id}"),
            Self::NotFound(NotFoundTarget::Relationship {
                source_id,
                target_id,
            }) => write!(f, "relationship not found: {source_id} -> {target_id}"),
            Self::Validation(err) => write!(f, "{err}"),
            Self::InactiveEndpoint(id) => write!(f, "entity is inactive: {id}"),
            Self::InvalidTransition { id, reason } => {
                write!(f, "invalid transition for entity {id}: {reason}")
            }
            Self::Conflict {
                source_id,
                target_id,
            } => write!(
                f,
                "active relationship already exists: {source_id} -> {target_id}"
            ),
            Self::CascadeDepthExceeded { depth } => {
                write!(f, "cascade exceeded maximum depth {depth}")
            }
            Self::Store(err) => write!(f, "{err}"),
        }
    }
}

impl Error for CoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RepoError> for CoreError {
    fn from(value: RepoError) -> Self {
        Self::Store(value)
    }
}

impl From<ValidationError> for CoreError {
    fn from(value: ValidationError) -> Self {
        Self::Validation(value)
    }
}
