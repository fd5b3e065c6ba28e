//! Relationship Index use-case service.
//!
//! # Responsibility
//! - Associate, deactivate and re-status relationships between live entities.
//! - Answer endpoint, counterpart and aggregate queries.
//!
//! # Invariants
//! - New or revived relationships only join active endpoints.
//! - One record per `(source, target)` pair; re-association revives it.
//! - `active_only` listings never yield inactive records.

use crate::model::entity::{merge_attributes, Attributes, Entity, EntityId, EntityKind};
use crate::model::relationship::{Relationship, RelationshipStatus, Role};
use crate::model::validation::ValidationError;
use crate::repo::cursor::{PageCursor, DEFAULT_PAGE_SIZE};
use crate::repo::entity_repo::EntityRepository;
use crate::repo::relationship_repo::RelationshipRepository;
use crate::repo::RepoError;
use crate::service::error::{CoreError, CoreResult};
use log::{info, warn};

/// Lazy relationship listing; see [`PageCursor`].
pub type RelationshipCursor<'a> = PageCursor<'a, Relationship>;

/// Relationship service over entity and relationship repositories.
pub struct RelationshipIndex<E: EntityRepository, R: RelationshipRepository> {
    entities: E,
    relationships: R,
}

impl<E: EntityRepository, R: RelationshipRepository> RelationshipIndex<E, R> {
    pub fn new(entities: E, relationships: R) -> Self {
        Self {
            entities,
            relationships,
        }
    }

    /// Creates or revives the relationship `source -> target`.
    ///
    /// # Errors
    /// - `NotFound` / `InactiveEndpoint` for a missing or inactive endpoint.
    /// - `Conflict` when an active record exists, including one inserted
    ///   concurrently; callers should re-read with [`Self::get`].
    pub fn associate(
        &self,
        source_id: EntityId,
        target_id: EntityId,
        attributes: Attributes,
    ) -> CoreResult<Relationship> {
        self.require_active_endpoint(source_id)?;
        self.require_active_endpoint(target_id)?;

        let conflict = CoreError::Conflict {
            source_id,
            target_id,
        };
        let mode = match self.relationships.get_relationship(source_id, target_id)? {
            Some(existing) if existing.active => return Err(conflict),
            Some(_) => {
                if !self
                    .relationships
                    .reactivate_relationship(source_id, target_id, &attributes)?
                {
                    return Err(conflict);
                }
                "reactivate"
            }
            None => {
                let relationship = Relationship {
                    source_id,
                    target_id,
                    status: RelationshipStatus::Registered,
                    attributes,
                    active: true,
                    created_at: 0,
                    updated_at: 0,
                };
                match self.relationships.insert_relationship(&relationship) {
                    Ok(_) => {}
                    Err(RepoError::UniqueViolation(_)) => {
                        warn!(
                            "event=relationship_associate module=relationship status=error error_code=conflict"
                        );
                        return Err(conflict);
                    }
                    Err(err) => return Err(err.into()),
                }
                "insert"
            }
        };

        info!("event=relationship_associate module=relationship status=ok mode={mode}");
        self.get(source_id, target_id)
    }

    /// Soft-deletes an active relationship.
    pub fn deactivate(&self, source_id: EntityId, target_id: EntityId) -> CoreResult<Relationship> {
        if !self
            .relationships
            .set_relationship_active(source_id, target_id, false)?
        {
            return Err(CoreError::relationship_not_found(source_id, target_id));
        }
        info!("event=relationship_deactivate module=relationship status=ok");
        self.get(source_id, target_id)
    }

    /// Lists relationships where `entity_id` occupies `role`, in insertion order.
    pub fn by_entity(
        &self,
        entity_id: EntityId,
        role: Role,
        active_only: bool,
    ) -> RelationshipCursor<'_> {
        let relationships = &self.relationships;
        PageCursor::new(DEFAULT_PAGE_SIZE, None, move |after, limit| {
            relationships.list_by_entity(entity_id, role, active_only, after, limit)
        })
    }

    /// Sets the status of an existing record. Any status may follow any other.
    pub fn update_status(
        &self,
        source_id: EntityId,
        target_id: EntityId,
        status: RelationshipStatus,
    ) -> CoreResult<Relationship> {
        self.get(source_id, target_id)?;
        self.relationships
            .set_relationship_status(source_id, target_id, &status)?;
        self.get(source_id, target_id)
    }

    pub fn get(&self, source_id: EntityId, target_id: EntityId) -> CoreResult<Relationship> {
        self.relationships
            .get_relationship(source_id, target_id)?
            .ok_or_else(|| CoreError::relationship_not_found(source_id, target_id))
    }

    /// Merges `patch` into the relationship's attributes (`null` removes).
    pub fn patch_attributes(
        &self,
        source_id: EntityId,
        target_id: EntityId,
        patch: Attributes,
    ) -> CoreResult<Relationship> {
        if patch.is_empty() {
            return Err(ValidationError::EmptyPatch.into());
        }
        let mut attributes = self.get(source_id, target_id)?.attributes;
        merge_attributes(&mut attributes, patch);
        self.relationships
            .replace_relationship_attributes(source_id, target_id, &attributes)?;
        self.get(source_id, target_id)
    }

    /// Distinct counterparts of an entity, ordered by first association.
    pub fn counterparts(
        &self,
        entity_id: EntityId,
        role: Role,
        active_only: bool,
    ) -> CoreResult<Vec<Entity>> {
        self.require_entity(entity_id)?;
        Ok(self
            .relationships
            .list_counterparts(entity_id, role, active_only)?)
    }

    /// Counts distinct counterparts linked with `status`, including
    /// soft-deleted records.
    pub fn count_counterparts_with_status(
        &self,
        entity_id: EntityId,
        role: Role,
        status: &RelationshipStatus,
    ) -> CoreResult<u64> {
        self.require_entity(entity_id)?;
        Ok(self
            .relationships
            .count_counterparts_with_status(entity_id, role, status)?)
    }

    /// Active entities of `kind` with no active relationship in `role`.
    pub fn entities_without_active_relationships(
        &self,
        kind: &EntityKind,
        role: Role,
    ) -> CoreResult<Vec<Entity>> {
        Ok(self
            .relationships
            .list_without_active_relationships(kind, role)?)
    }

    /// Entities of `kind` with more than `threshold` relationships carrying
    /// `status`, busiest first.
    pub fn counterparts_exceeding(
        &self,
        kind: &EntityKind,
        role: Role,
        status: &RelationshipStatus,
        threshold: u64,
    ) -> CoreResult<Vec<(Entity, u64)>> {
        Ok(self
            .relationships
            .list_exceeding(kind, role, status, threshold)?)
    }

    /// Most recently created active relationships.
    pub fn recent(&self, limit: u32) -> CoreResult<Vec<Relationship>> {
        Ok(self.relationships.list_recent(limit)?)
    }

    fn require_entity(&self, id: EntityId) -> CoreResult<Entity> {
        self.entities
            .get_entity(id)?
            .ok_or_else(|| CoreError::entity_not_found(id))
    }

    fn require_active_endpoint(&self, id: EntityId) -> CoreResult<Entity> {
        let entity = self.require_entity(id)?;
        if !entity.active {
            return Err(CoreError::InactiveEndpoint(id));
        }
        Ok(entity)
    }
}
