//! Relationship domain model.
//!
//! # Invariants
//! - At most one record exists per `(source_id, target_id)` pair; soft-deleted
//!   pairs are reactivated in place instead of duplicated.
//! - Any status may follow any other; there is no status transition graph.

use crate::model::entity::{Attributes, EntityId};
use crate::model::validation::{require_identifier, ValidationError};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Relationship status. Custom variants carry domain-specific identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RelationshipStatus {
    #[default]
    Registered,
    Attended,
    Cancelled,
    Custom(String),
}

impl RelationshipStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Registered => "registered",
            Self::Attended => "attended",
            Self::Cancelled => "cancelled",
            Self::Custom(value) => value.as_str(),
        }
    }
}

impl FromStr for RelationshipStatus {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "registered" => Ok(Self::Registered),
            "attended" => Ok(Self::Attended),
            "cancelled" => Ok(Self::Cancelled),
            other => {
                require_identifier("relationship status", other)?;
                Ok(Self::Custom(other.to_string()))
            }
        }
    }
}

impl TryFrom<String> for RelationshipStatus {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RelationshipStatus> for String {
    fn from(value: RelationshipStatus) -> Self {
        value.as_str().to_string()
    }
}

impl Display for RelationshipStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which endpoint of a relationship an entity occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Source,
    Target,
    /// Either endpoint.
    #[default]
    Any,
}

impl Role {
    /// Returns whether an entity in `actual` position satisfies this role.
    pub fn admits(self, actual: Role) -> bool {
        self == Role::Any || self == actual
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Target => "target",
            Self::Any => "any",
        }
    }
}

/// Directed association between two entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub source_id: EntityId,
    pub target_id: EntityId,
    pub status: RelationshipStatus,
    pub attributes: Attributes,
    pub active: bool,
    /// Unix epoch milliseconds; refreshed when a soft-deleted pair is re-associated.
    pub created_at: i64,
    /// Unix epoch milliseconds.
    pub updated_at: i64,
}

impl Relationship {
    /// Returns the position `id` occupies, or `None` if it is not an endpoint.
    ///
    /// Self-relationships report `Source`.
    pub fn role_of(&self, id: EntityId) -> Option<Role> {
        if self.source_id == id {
            Some(Role::Source)
        } else if self.target_id == id {
            Some(Role::Target)
        } else {
            None
        }
    }

    /// Returns the other endpoint relative to `id`.
    pub fn counterpart_of(&self, id: EntityId) -> Option<EntityId> {
        match self.role_of(id)? {
            Role::Source => Some(self.target_id),
            _ => Some(self.source_id),
        }
    }

    /// Reads an integer attribute (e.g. epoch-ms schedule fields).
    pub fn attribute_i64(&self, field: &str) -> Option<i64> {
        self.attributes
            .get(field)
            .and_then(serde_json::Value::as_i64)
    }
}

#[cfg(test)]
mod tests {
    use super::{Relationship, RelationshipStatus, Role};
    use crate::model::entity::Attributes;
    use uuid::Uuid;

    #[test]
    fn status_parses_builtin_and_custom_values() {
        assert_eq!(
            "cancelled".parse::<RelationshipStatus>().unwrap(),
            RelationshipStatus::Cancelled
        );
        assert_eq!(
            "waitlisted".parse::<RelationshipStatus>().unwrap(),
            RelationshipStatus::Custom("waitlisted".to_string())
        );
        assert!("Wait Listed".parse::<RelationshipStatus>().is_err());
    }

    #[test]
    fn status_serializes_as_plain_string() {
        let value = serde_json::to_value(RelationshipStatus::Attended).unwrap();
        assert_eq!(value, serde_json::json!("attended"));
    }

    #[test]
    fn role_any_admits_both_positions() {
        assert!(Role::Any.admits(Role::Source));
        assert!(Role::Any.admits(Role::Target));
        assert!(!Role::Source.admits(Role::Target));
    }

    #[test]
    fn counterpart_resolves_either_endpoint() {
        let source = Uuid::new_v4();
        let target = Uuid::new_v4();
        let relationship = Relationship {
            source_id: source,
            target_id: target,
            status: RelationshipStatus::Registered,
            attributes: Attributes::new(),
            active: true,
            created_at: 0,
            updated_at: 0,
        };
        assert_eq!(relationship.counterpart_of(source), Some(target));
        assert_eq!(relationship.counterpart_of(target), Some(source));
        assert_eq!(relationship.role_of(Uuid::new_v4()), None);
    }
}
