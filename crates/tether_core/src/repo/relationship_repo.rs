//! Relationship repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Persist relationship records keyed by `(source_id, target_id)`.
//! - Answer endpoint, counterpart and aggregate queries.
//!
//! # Invariants
//! - The `UNIQUE (source_id, target_id)` index keeps one record per pair.
//! - Every state write is conditional and reports whether it changed a row.
//! - Endpoint listings follow insertion order (`seq ASC`) and page by `seq`.

use crate::model::entity::{Attributes, Entity, EntityId, EntityKind};
use crate::model::relationship::{Relationship, RelationshipStatus, Role};
use crate::repo::cursor::PageKey;
use crate::repo::entity_repo::parse_entity_row;
use crate::repo::{
    bool_to_int, decode_attributes, encode_attributes, parse_flag, parse_uuid, RepoError,
    RepoResult, NOW_MS_SQL,
};
use rusqlite::{params, Connection, Row};

const RELATIONSHIP_SELECT_SQL: &str = "SELECT
    seq,
    source_id,
    target_id,
    status,
    attributes,
    is_active,
    created_at,
    updated_at
FROM relationships";

const JOINED_ENTITY_COLUMNS: &str = "e.id AS id,
    e.kind AS kind,
    e.is_active AS is_active,
    e.attributes AS attributes,
    e.created_at AS created_at,
    e.updated_at AS updated_at";

/// Repository interface for relationship persistence.
pub trait RelationshipRepository {
    /// Inserts a new active record; an existing pair fails with `UniqueViolation`.
    fn insert_relationship(&self, relationship: &Relationship) -> RepoResult<Relationship>;
    fn get_relationship(
        &self,
        source_id: EntityId,
        target_id: EntityId,
    ) -> RepoResult<Option<Relationship>>;
    /// Revives an inactive record in place: status `registered`, new
    /// attributes, fresh timestamps. Returns whether a row changed.
    fn reactivate_relationship(
        &self,
        source_id: EntityId,
        target_id: EntityId,
        attributes: &Attributes,
    ) -> RepoResult<bool>;
    /// Sets the active flag only if it differs.
    fn set_relationship_active(
        &self,
        source_id: EntityId,
        target_id: EntityId,
        active: bool,
    ) -> RepoResult<bool>;
    /// Sets the status only if it differs.
    fn set_relationship_status(
        &self,
        source_id: EntityId,
        target_id: EntityId,
        status: &RelationshipStatus,
    ) -> RepoResult<bool>;
    fn replace_relationship_attributes(
        &self,
        source_id: EntityId,
        target_id: EntityId,
        attributes: &Attributes,
    ) -> RepoResult<bool>;
    /// Reads up to `limit` relationships where `entity_id` occupies `role`,
    /// in insertion order, starting after `after`.
    fn list_by_entity(
        &self,
        entity_id: EntityId,
        role: Role,
        active_only: bool,
        after: Option<&PageKey>,
        limit: u32,
    ) -> RepoResult<Vec<(PageKey, Relationship)>>;
    /// Active relationships, newest first.
    fn list_recent(&self, limit: u32) -> RepoResult<Vec<Relationship>>;
    /// Distinct counterparts of `entity_id`, ordered by first association.
    ///
    /// With `active_only`, both the relationship and the counterpart must be
    /// active.
    fn list_counterparts(
        &self,
        entity_id: EntityId,
        role: Role,
        active_only: bool,
    ) -> RepoResult<Vec<Entity>>;
    /// Number of distinct counterparts linked with `status`, active or not.
    fn count_counterparts_with_status(
        &self,
        entity_id: EntityId,
        role: Role,
        status: &RelationshipStatus,
    ) -> RepoResult<u64>;
    /// Active entities of `kind` with no active relationship in `role`.
    fn list_without_active_relationships(
        &self,
        kind: &EntityKind,
        role: Role,
    ) -> RepoResult<Vec<Entity>>;
    /// Entities of `kind` holding more than `threshold` relationships with
    /// `status` in `role`, busiest first.
    fn list_exceeding(
        &self,
        kind: &EntityKind,
        role: Role,
        status: &RelationshipStatus,
        threshold: u64,
    ) -> RepoResult<Vec<(Entity, u64)>>;
}

/// SQLite-backed relationship repository.
#[derive(Debug, Clone, Copy)]
pub struct SqliteRelationshipRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteRelationshipRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }
}

impl RelationshipRepository for SqliteRelationshipRepository<'_> {
    fn insert_relationship(&self, relationship: &Relationship) -> RepoResult<Relationship> {
        let attributes = encode_attributes(&relationship.attributes)?;
        self.conn.execute(
            "INSERT INTO relationships (source_id, target_id, status, attributes, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5);",
            params![
                relationship.source_id.to_string(),
                relationship.target_id.to_string(),
                relationship.status.as_str(),
                attributes,
                bool_to_int(relationship.active),
            ],
        )?;
        self.get_relationship(relationship.source_id, relationship.target_id)?
            .ok_or_else(|| {
                RepoError::InvalidData(format!(
                    "relationship {}->{} missing after insert",
                    relationship.source_id, relationship.target_id
                ))
            })
    }

    fn get_relationship(
        &self,
        source_id: EntityId,
        target_id: EntityId,
    ) -> RepoResult<Option<Relationship>> {
        let mut stmt = self.conn.prepare(&format!(
            "{RELATIONSHIP_SELECT_SQL} WHERE source_id = ?1 AND target_id = ?2;"
        ))?;
        let mut rows = stmt.query(params![source_id.to_string(), target_id.to_string()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_relationship_row(row)?));
        }
        Ok(None)
    }

    fn reactivate_relationship(
        &self,
        source_id: EntityId,
        target_id: EntityId,
        attributes: &Attributes,
    ) -> RepoResult<bool> {
        let attributes = encode_attributes(attributes)?;
        let changed = self.conn.execute(
            &format!(
                "UPDATE relationships
                 SET is_active = 1,
                     status = ?3,
                     attributes = ?4,
                     created_at = {NOW_MS_SQL},
                     updated_at = {NOW_MS_SQL}
                 WHERE source_id = ?1
                   AND target_id = ?2
                   AND is_active = 0;"
            ),
            params![
                source_id.to_string(),
                target_id.to_string(),
                RelationshipStatus::Registered.as_str(),
                attributes,
            ],
        )?;
        Ok(changed > 0)
    }

    fn set_relationship_active(
        &self,
        source_id: EntityId,
        target_id: EntityId,
        active: bool,
    ) -> RepoResult<bool> {
        let changed = self.conn.execute(
            &format!(
                "UPDATE relationships
                 SET is_active = ?3,
                     updated_at = {NOW_MS_SQL}
                 WHERE source_id = ?1
                   AND target_id = ?2
                   AND is_active <> ?3;"
            ),
            params![
                source_id.to_string(),
                target_id.to_string(),
                bool_to_int(active)
            ],
        )?;
        Ok(changed > 0)
    }

    fn set_relationship_status(
        &self,
        source_id: EntityId,
        target_id: EntityId,
        status: &RelationshipStatus,
    ) -> RepoResult<bool> {
        let changed = self.conn.execute(
            &format!(
                "UPDATE relationships
                 SET status = ?3,
                     updated_at = {NOW_MS_SQL}
                 WHERE source_id = ?1
                   AND target_id = ?2
                   AND status <> ?3;"
            ),
            params![source_id.to_string(), target_id.to_string(), status.as_str()],
        )?;
        Ok(changed > 0)
    }

    fn replace_relationship_attributes(
        &self,
        source_id: EntityId,
        target_id: EntityId,
        attributes: &Attributes,
    ) -> RepoResult<bool> {
        let attributes = encode_attributes(attributes)?;
        let changed = self.conn.execute(
            &format!(
                "UPDATE relationships
                 SET attributes = ?3,
                     updated_at = {NOW_MS_SQL}
                 WHERE source_id = ?1
                   AND target_id = ?2;"
            ),
            params![source_id.to_string(), target_id.to_string(), attributes],
        )?;
        Ok(changed > 0)
    }

    fn list_by_entity(
        &self,
        entity_id: EntityId,
        role: Role,
        active_only: bool,
        after: Option<&PageKey>,
        limit: u32,
    ) -> RepoResult<Vec<(PageKey, Relationship)>> {
        let mut sql = format!(
            "{RELATIONSHIP_SELECT_SQL} WHERE {} AND seq > ?2",
            endpoint_clause(role, "")
        );
        if active_only {
            sql.push_str(" AND is_active = 1");
        }
        sql.push_str(" ORDER BY seq ASC LIMIT ?3;");

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![
            entity_id.to_string(),
            after.map_or(0, |key| key.seq),
            i64::from(limit)
        ])?;
        let mut relationships = Vec::new();
        while let Some(row) = rows.next()? {
            let key = PageKey::seq(row.get("seq")?);
            relationships.push((key, parse_relationship_row(row)?));
        }
        Ok(relationships)
    }

    fn list_recent(&self, limit: u32) -> RepoResult<Vec<Relationship>> {
        let mut stmt = self.conn.prepare(&format!(
            "{RELATIONSHIP_SELECT_SQL}
             WHERE is_active = 1
             ORDER BY created_at DESC, seq DESC
             LIMIT ?1;"
        ))?;
        let mut rows = stmt.query([i64::from(limit)])?;
        let mut relationships = Vec::new();
        while let Some(row) = rows.next()? {
            relationships.push(parse_relationship_row(row)?);
        }
        Ok(relationships)
    }

    fn list_counterparts(
        &self,
        entity_id: EntityId,
        role: Role,
        active_only: bool,
    ) -> RepoResult<Vec<Entity>> {
        let mut sql = format!(
            "SELECT {JOINED_ENTITY_COLUMNS}
             FROM relationships r
             JOIN entities e
               ON e.id = CASE WHEN r.source_id = ?1 THEN r.target_id ELSE r.source_id END
             WHERE {}",
            endpoint_clause(role, "r.")
        );
        if active_only {
            sql.push_str(" AND r.is_active = 1 AND e.is_active = 1");
        }
        sql.push_str(" GROUP BY e.seq ORDER BY MIN(r.seq) ASC;");

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([entity_id.to_string()])?;
        let mut entities = Vec::new();
        while let Some(row) = rows.next()? {
            entities.push(parse_entity_row(row)?);
        }
        Ok(entities)
    }

    fn count_counterparts_with_status(
        &self,
        entity_id: EntityId,
        role: Role,
        status: &RelationshipStatus,
    ) -> RepoResult<u64> {
        let count: i64 = self.conn.query_row(
            &format!(
                "SELECT COUNT(DISTINCT CASE WHEN source_id = ?1 THEN target_id ELSE source_id END)
                 FROM relationships
                 WHERE {}
                   AND status = ?2;",
                endpoint_clause(role, "")
            ),
            params![entity_id.to_string(), status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    fn list_without_active_relationships(
        &self,
        kind: &EntityKind,
        role: Role,
    ) -> RepoResult<Vec<Entity>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {JOINED_ENTITY_COLUMNS}
             FROM entities e
             WHERE e.kind = ?1
               AND e.is_active = 1
               AND NOT EXISTS (
                   SELECT 1 FROM relationships r
                   WHERE r.is_active = 1
                     AND {}
               )
             ORDER BY e.seq ASC;",
            entity_join_clause(role)
        ))?;
        let mut rows = stmt.query([kind.as_str()])?;
        let mut entities = Vec::new();
        while let Some(row) = rows.next()? {
            entities.push(parse_entity_row(row)?);
        }
        Ok(entities)
    }

    fn list_exceeding(
        &self,
        kind: &EntityKind,
        role: Role,
        status: &RelationshipStatus,
        threshold: u64,
    ) -> RepoResult<Vec<(Entity, u64)>> {
        let threshold = i64::try_from(threshold).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {JOINED_ENTITY_COLUMNS}, COUNT(*) AS hits
             FROM entities e
             JOIN relationships r ON {}
             WHERE e.kind = ?1
               AND r.status = ?2
             GROUP BY e.seq
             HAVING COUNT(*) > ?3
             ORDER BY hits DESC, e.seq ASC;",
            entity_join_clause(role)
        ))?;
        let mut rows = stmt.query(params![kind.as_str(), status.as_str(), threshold])?;
        let mut matches = Vec::new();
        while let Some(row) = rows.next()? {
            let hits: i64 = row.get("hits")?;
            matches.push((parse_entity_row(row)?, hits.max(0) as u64));
        }
        Ok(matches)
    }
}

/// Filters relationships by the `?1` endpoint in `role`.
fn endpoint_clause(role: Role, alias: &str) -> String {
    match role {
        Role::Source => format!("{alias}source_id = ?1"),
        Role::Target => format!("{alias}target_id = ?1"),
        Role::Any => format!("({alias}source_id = ?1 OR {alias}target_id = ?1)"),
    }
}

/// Joins relationship `r` to entity `e` occupying `role`.
fn entity_join_clause(role: Role) -> &'static str {
    match role {
        Role::Source => "r.source_id = e.id",
        Role::Target => "r.target_id = e.id",
        Role::Any => "(r.source_id = e.id OR r.target_id = e.id)",
    }
}

fn parse_relationship_row(row: &Row<'_>) -> RepoResult<Relationship> {
    let source_text: String = row.get("source_id")?;
    let target_text: String = row.get("target_id")?;
    let status_text: String = row.get("status")?;
    let attributes_text: String = row.get("attributes")?;
    let status = status_text.parse::<RelationshipStatus>().map_err(|_| {
        RepoError::InvalidData(format!(
            "invalid status `{status_text}` in relationships.status"
        ))
    })?;

    Ok(Relationship {
        source_id: parse_uuid(&source_text, "relationships.source_id")?,
        target_id: parse_uuid(&target_text, "relationships.target_id")?,
        status,
        attributes: decode_attributes(&attributes_text, "relationships.attributes")?,
        active: parse_flag(row.get("is_active")?, "relationships.is_active")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}
