//! Entity domain model.
//!
//! # Responsibility
//! - Define the top-level business record (mentor, learner, session, ...).
//! - Define the two-state lifecycle (`active`/`inactive`) and its transitions.
//!
//! # Invariants
//! - `id` is assigned once at creation and never reused.
//! - Entities are never physically erased; deletion is `active = false`.
//! - `kind` is a lowercase identifier, so new kinds need no code changes.

use crate::model::validation::{require_identifier, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Stable entity identifier.
pub type EntityId = Uuid;

/// Free-form entity/relationship attributes keyed by field name.
pub type Attributes = BTreeMap<String, Value>;

/// Entity kind tag, e.g. `mentor` or `learner`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityKind(String);

impl EntityKind {
    /// Validates and wraps a kind tag.
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();
        require_identifier("entity kind", &value)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EntityKind {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EntityKind> for String {
    fn from(value: EntityKind) -> Self {
        value.0
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle transition on an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// `active -> inactive` (soft delete).
    Deactivate,
    /// `inactive -> active`.
    Reactivate,
}

impl Transition {
    /// Returns the `active` flag an entity holds after this transition.
    pub fn target_active(self) -> bool {
        matches!(self, Self::Reactivate)
    }

    /// Returns the transition that moves an entity into `active`.
    pub fn towards(active: bool) -> Self {
        if active {
            Self::Reactivate
        } else {
            Self::Deactivate
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deactivate => "deactivate",
            Self::Reactivate => "reactivate",
        }
    }
}

impl Display for Transition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical entity record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub active: bool,
    pub attributes: Attributes,
    /// Unix epoch milliseconds.
    pub created_at: i64,
    /// Unix epoch milliseconds.
    pub updated_at: i64,
}

impl Entity {
    /// Creates an active, not yet persisted entity with a generated id.
    ///
    /// Timestamps are zero until the store assigns them.
    pub fn new(kind: EntityKind, attributes: Attributes) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            active: true,
            attributes,
            created_at: 0,
            updated_at: 0,
        }
    }

    /// Returns whether `transition` is legal from the current state.
    pub fn can(&self, transition: Transition) -> bool {
        self.active != transition.target_active()
    }

    /// Reads an integer attribute (e.g. epoch-ms schedule fields).
    pub fn attribute_i64(&self, field: &str) -> Option<i64> {
        self.attributes.get(field).and_then(Value::as_i64)
    }
}

/// Merges `patch` into `attributes`; `null` values remove the field.
pub fn merge_attributes(attributes: &mut Attributes, patch: Attributes) {
    for (field, value) in patch {
        if value.is_null() {
            attributes.remove(&field);
        } else {
            attributes.insert(field, value);
        }
    }
}
