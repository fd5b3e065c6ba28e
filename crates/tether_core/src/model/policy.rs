//! Declarative lifecycle policy: entity schemas and cascade rules.
//!
//! # Responsibility
//! - Describe per-kind required/unique attributes.
//! - Describe, as data, which relationship updates follow an entity transition.
//!
//! # Invariants
//! - Policies are validated before use; an invalid policy never reaches the
//!   cascade engine.
//! - Rules are looked up by `(kind, transition)`; rule order is preserved.
//!
//! # See also
//! - tests/fixtures/mentorship_policy.json

use crate::model::entity::{Entity, EntityKind, Transition};
use crate::model::relationship::{Relationship, RelationshipStatus, Role};
use crate::model::validation::{require_field_name, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;

/// Required/unique attribute declaration for one entity kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySchema {
    pub kind: EntityKind,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub unique: Vec<String>,
}

impl EntitySchema {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            required: Vec::new(),
            unique: Vec::new(),
        }
    }

    pub fn require(mut self, field: impl Into<String>) -> Self {
        self.required.push(field.into());
        self
    }

    pub fn unique(mut self, field: impl Into<String>) -> Self {
        self.unique.push(field.into());
        self
    }
}

/// Where a schedule field is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSource {
    Relationship,
    Counterpart,
}

/// Time window relative to the operation clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeWindow {
    /// Field value is strictly after now.
    Future,
    /// Field value is at or before now.
    Past,
}

/// Epoch-millisecond field filter, e.g. "only future-scheduled sessions".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleFilter {
    pub field: String,
    pub on: FieldSource,
    pub window: TimeWindow,
}

impl ScheduleFilter {
    /// Returns whether `value` (epoch ms) falls inside the window at `now_ms`.
    ///
    /// A missing or non-integer value never matches.
    pub fn admits(&self, value: Option<i64>, now_ms: i64) -> bool {
        match (value, self.window) {
            (Some(at), TimeWindow::Future) => at > now_ms,
            (Some(at), TimeWindow::Past) => at <= now_ms,
            (None, _) => false,
        }
    }
}

/// Updates applied to each matching relationship.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeAction {
    #[serde(default)]
    pub set_status: Option<RelationshipStatus>,
    #[serde(default)]
    pub deactivate_relationship: bool,
    #[serde(default)]
    pub reactivate_relationship: bool,
    /// Apply the same transition to the counterpart entity, recursively.
    #[serde(default)]
    pub propagate: bool,
}

impl CascadeAction {
    fn is_empty(&self) -> bool {
        self.set_status.is_none()
            && !self.deactivate_relationship
            && !self.reactivate_relationship
            && !self.propagate
    }
}

/// One cascade rule keyed by `(kind, transition)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeRule {
    pub kind: EntityKind,
    pub transition: Transition,
    /// Position the transitioning entity must hold in the relationship.
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub counterpart_kind: Option<EntityKind>,
    /// Only relationships whose status is listed; empty means any status.
    #[serde(default)]
    pub status_in: Vec<RelationshipStatus>,
    #[serde(default)]
    pub schedule: Option<ScheduleFilter>,
    /// Also consider soft-deleted relationships (needed to restore them).
    #[serde(default)]
    pub include_inactive: bool,
    pub action: CascadeAction,
}

impl CascadeRule {
    /// Starts a rule with no filters and an empty action.
    pub fn on(kind: EntityKind, transition: Transition) -> Self {
        Self {
            kind,
            transition,
            role: Role::Any,
            counterpart_kind: None,
            status_in: Vec::new(),
            schedule: None,
            include_inactive: false,
            action: CascadeAction::default(),
        }
    }

    pub fn role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn counterpart(mut self, kind: EntityKind) -> Self {
        self.counterpart_kind = Some(kind);
        self
    }

    pub fn when_status(mut self, status: RelationshipStatus) -> Self {
        self.status_in.push(status);
        self
    }

    pub fn scheduled(
        mut self,
        field: impl Into<String>,
        on: FieldSource,
        window: TimeWindow,
    ) -> Self {
        self.schedule = Some(ScheduleFilter {
            field: field.into(),
            on,
            window,
        });
        self
    }

    pub fn include_inactive(mut self) -> Self {
        self.include_inactive = true;
        self
    }

    pub fn set_status(mut self, status: RelationshipStatus) -> Self {
        self.action.set_status = Some(status);
        self
    }

    pub fn deactivate_relationship(mut self) -> Self {
        self.action.deactivate_relationship = true;
        self
    }

    pub fn reactivate_relationship(mut self) -> Self {
        self.action.reactivate_relationship = true;
        self
    }

    pub fn propagate(mut self) -> Self {
        self.action.propagate = true;
        self
    }

    /// Evaluates every filter of this rule.
    ///
    /// `role` is the position of the transitioning entity; `counterpart` is
    /// the other endpoint when it could be loaded.
    pub fn matches(
        &self,
        relationship: &Relationship,
        role: Role,
        counterpart: Option<&Entity>,
        now_ms: i64,
    ) -> bool {
        if !self.role.admits(role) {
            return false;
        }
        if !relationship.active && !self.include_inactive {
            return false;
        }
        if let Some(kind) = self.counterpart_kind.as_ref() {
            if counterpart.map(|entity| &entity.kind) != Some(kind) {
                return false;
            }
        }
        if !self.status_in.is_empty() && !self.status_in.contains(&relationship.status) {
            return false;
        }
        if let Some(schedule) = self.schedule.as_ref() {
            let value = match schedule.on {
                FieldSource::Relationship => relationship.attribute_i64(&schedule.field),
                FieldSource::Counterpart => {
                    counterpart.and_then(|entity| entity.attribute_i64(&schedule.field))
                }
            };
            if !schedule.admits(value, now_ms) {
                return false;
            }
        }
        true
    }
}

/// Complete lifecycle policy document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecyclePolicy {
    #[serde(default)]
    pub entities: Vec<EntitySchema>,
    #[serde(default)]
    pub cascades: Vec<CascadeRule>,
}

impl LifecyclePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, schema: EntitySchema) -> Self {
        self.entities.push(schema);
        self
    }

    pub fn with_rule(mut self, rule: CascadeRule) -> Self {
        self.cascades.push(rule);
        self
    }

    /// Parses and validates a JSON policy document.
    pub fn from_json_str(source: &str) -> Result<Self, PolicyError> {
        let policy: Self =
            serde_json::from_str(source).map_err(|err| PolicyError::Parse(err.to_string()))?;
        policy.validate()?;
        Ok(policy)
    }

    /// Reads, parses and validates a JSON policy file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|err| PolicyError::Io(format!("{}: {err}", path.display())))?;
        Self::from_json_str(&source)
    }

    /// Returns the schema for `kind`, if one is declared.
    pub fn schema(&self, kind: &EntityKind) -> Option<&EntitySchema> {
        self.entities.iter().find(|schema| &schema.kind == kind)
    }

    /// Returns rules for `(kind, transition)` in declaration order.
    pub fn rules_for<'a>(
        &'a self,
        kind: &'a EntityKind,
        transition: Transition,
    ) -> impl Iterator<Item = &'a CascadeRule> + 'a {
        self.cascades
            .iter()
            .filter(move |rule| &rule.kind == kind && rule.transition == transition)
    }

    /// Validates declaration-level policy invariants.
    pub fn validate(&self) -> Result<(), PolicyError> {
        let mut kinds = BTreeSet::new();
        for schema in &self.entities {
            if !kinds.insert(schema.kind.clone()) {
                return Err(PolicyError::DuplicateSchema(schema.kind.to_string()));
            }
            for field in schema.required.iter().chain(schema.unique.iter()) {
                require_field_name(field).map_err(PolicyError::Invalid)?;
            }
        }

        for (index, rule) in self.cascades.iter().enumerate() {
            if rule.action.is_empty() {
                return Err(PolicyError::EmptyAction { rule: index });
            }
            if rule.action.deactivate_relationship && rule.action.reactivate_relationship {
                return Err(PolicyError::ContradictoryAction { rule: index });
            }
            if let Some(schedule) = rule.schedule.as_ref() {
                require_field_name(&schedule.field).map_err(PolicyError::Invalid)?;
            }
        }
        Ok(())
    }
}

/// Policy loading/validation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    Io(String),
    Parse(String),
    Invalid(ValidationError),
    DuplicateSchema(String),
    EmptyAction { rule: usize },
    ContradictoryAction { rule: usize },
}

impl Display for PolicyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(message) => write!(f, "failed to read policy: {message}"),
            Self::Parse(message) => write!(f, "failed to parse policy: {message}"),
            Self::Invalid(err) => write!(f, "invalid policy: {err}"),
            Self::DuplicateSchema(kind) => write!(f, "duplicate schema for kind `{kind}`"),
            Self::EmptyAction { rule } => write!(f, "cascade rule #{rule} has no action"),
            Self::ContradictoryAction { rule } => write!(
                f,
                "cascade rule #{rule} both deactivates and reactivates relationships"
            ),
        }
    }
}

impl Error for PolicyError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Invalid(err) => Some(err),
            _ => None,
        }
    }
}
