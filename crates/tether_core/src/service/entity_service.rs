//! Entity Store use-case service.
//!
//! # Responsibility
//! - Create entities validated against their kind's schema.
//! - Flip the active flag with transition checks.
//! - Expose lazy, restartable entity queries.
//!
//! # Invariants
//! - Required fields are present, non-null and non-blank after every write.
//! - Unique fields are scalar and enforced by the store-level unique index.
//! - Setting an entity to the state it already has is an `InvalidTransition`.

use crate::model::entity::{
    merge_attributes, Attributes, Entity, EntityId, EntityKind, Transition,
};
use crate::model::policy::LifecyclePolicy;
use crate::model::validation::{require_field_name, ValidationError};
use crate::repo::cursor::{PageCursor, DEFAULT_PAGE_SIZE};
use crate::repo::entity_repo::{EntityQuery, EntityRepository, EntitySort, UniqueKey};
use crate::repo::RepoError;
use crate::service::error::{CoreError, CoreResult};
use serde_json::Value;

/// Lazy entity query result; see [`PageCursor`].
pub type EntityCursor<'a> = PageCursor<'a, Entity>;

/// Entity service over a repository and the schema part of a policy.
pub struct EntityStore<'p, R: EntityRepository> {
    repo: R,
    policy: &'p LifecyclePolicy,
}

impl<'p, R: EntityRepository> EntityStore<'p, R> {
    pub fn new(repo: R, policy: &'p LifecyclePolicy) -> Self {
        Self { repo, policy }
    }

    /// Creates an active entity of `kind`.
    ///
    /// # Errors
    /// - `Validation` for attribute names that cannot be queried, missing
    ///   required fields or unique collisions.
    pub fn create(&self, kind: EntityKind, attributes: Attributes) -> CoreResult<Entity> {
        require_field_names(&attributes)?;
        let unique_keys = self.validate_attributes(&kind, &attributes)?;
        let entity = Entity::new(kind, attributes);
        self.repo
            .insert_entity(&entity, &unique_keys)
            .map_err(|err| duplicate_value_error(&entity.kind, err))
    }

    pub fn get(&self, id: EntityId) -> CoreResult<Entity> {
        self.repo
            .get_entity(id)?
            .ok_or_else(|| CoreError::entity_not_found(id))
    }

    /// Sets the active flag; fails with `InvalidTransition` when unchanged.
    pub fn set_active(&self, id: EntityId, active: bool) -> CoreResult<Entity> {
        let entity = self.get(id)?;
        if !entity.can(Transition::towards(active)) || !self.repo.set_entity_active(id, active)? {
            return Err(already_in_state(id, active));
        }
        self.get(id)
    }

    /// Starts a lazy query. Nothing is read until the cursor is polled.
    ///
    /// # Errors
    /// - `Validation` when a filter or sort field is not an attribute name.
    pub fn find(&self, query: EntityQuery) -> CoreResult<EntityCursor<'_>> {
        for (field, _) in &query.attribute_equals {
            require_field_name(field)?;
        }
        if let Some(EntitySort::Attribute { field, .. }) = query.sort.as_ref() {
            require_field_name(field)?;
        }

        let repo = &self.repo;
        let limit = query.limit;
        Ok(PageCursor::new(
            DEFAULT_PAGE_SIZE,
            limit,
            move |after, page_size| repo.list_entities(&query, after, page_size),
        ))
    }

    /// Merges `patch` into an active entity's attributes.
    ///
    /// `null` values remove fields. The result is re-validated against the
    /// kind's schema.
    pub fn update_attributes(&self, id: EntityId, patch: Attributes) -> CoreResult<Entity> {
        if patch.is_empty() {
            return Err(ValidationError::EmptyPatch.into());
        }
        require_field_names(&patch)?;
        let entity = self.get(id)?;
        if !entity.active {
            return Err(CoreError::InactiveEndpoint(id));
        }

        let mut attributes = entity.attributes;
        merge_attributes(&mut attributes, patch);
        let unique_keys = self.validate_attributes(&entity.kind, &attributes)?;
        let changed = self
            .repo
            .replace_attributes(id, &attributes, &unique_keys)
            .map_err(|err| duplicate_value_error(&entity.kind, err))?;
        if !changed {
            return Err(CoreError::InactiveEndpoint(id));
        }
        self.get(id)
    }

    fn validate_attributes(
        &self,
        kind: &EntityKind,
        attributes: &Attributes,
    ) -> CoreResult<Vec<UniqueKey>> {
        let Some(schema) = self.policy.schema(kind) else {
            return Ok(Vec::new());
        };

        for field in &schema.required {
            if is_blank(attributes.get(field)) {
                return Err(ValidationError::MissingAttribute {
                    kind: kind.to_string(),
                    field: field.clone(),
                }
                .into());
            }
        }

        let mut unique_keys = Vec::with_capacity(schema.unique.len());
        for field in &schema.unique {
            match attributes.get(field) {
                None | Some(Value::Null) => {}
                Some(Value::Array(_)) | Some(Value::Object(_)) => {
                    return Err(ValidationError::UnindexableValue {
                        kind: kind.to_string(),
                        field: field.clone(),
                    }
                    .into());
                }
                Some(value) => unique_keys.push(UniqueKey {
                    field: field.clone(),
                    value: value.to_string(),
                }),
            }
        }
        Ok(unique_keys)
    }
}

fn require_field_names(attributes: &Attributes) -> Result<(), ValidationError> {
    attributes.keys().try_for_each(|field| require_field_name(field))
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(text)) => text.trim().is_empty(),
        Some(_) => false,
    }
}

fn already_in_state(id: EntityId, active: bool) -> CoreError {
    CoreError::InvalidTransition {
        id,
        reason: if active {
            "entity is already active"
        } else {
            "entity is already inactive"
        },
    }
}

fn duplicate_value_error(kind: &EntityKind, err: RepoError) -> CoreError {
    match err {
        RepoError::UniqueViolation(field) => ValidationError::DuplicateValue {
            kind: kind.to_string(),
            field,
        }
        .into(),
        other => other.into(),
    }
}
