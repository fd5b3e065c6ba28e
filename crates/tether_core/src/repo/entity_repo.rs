//! Entity repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Persist entities and their unique attribute index.
//! - Provide predicate queries with deterministic ordering.
//!
//! # Invariants
//! - Unique attribute values live in `entity_unique_values`, whose primary
//!   key `(kind, field, value)` is the only uniqueness guard.
//! - Entity rows and their unique values are written in one transaction.
//! - Default order is insertion order (`seq ASC`); sorted listings break ties
//!   by `seq` so every row has a unique page key.

use crate::model::entity::{Attributes, Entity, EntityId, EntityKind};
use crate::repo::cursor::PageKey;
use crate::repo::{
    bool_to_int, decode_attributes, encode_attributes, parse_flag, parse_uuid, with_write_tx,
    RepoError, RepoResult, NOW_MS_SQL,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde_json::Value;

const ENTITY_SELECT_SQL: &str = "SELECT
    id,
    kind,
    is_active,
    attributes,
    created_at,
    updated_at
FROM entities";

/// One indexed unique attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueKey {
    pub field: String,
    /// Canonical JSON encoding of the attribute value.
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Requested ordering for entity queries. Ties fall back to insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntitySort {
    CreatedAt(SortOrder),
    Attribute { field: String, order: SortOrder },
}

/// Predicate for entity queries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityQuery {
    pub kind: Option<EntityKind>,
    pub active: Option<bool>,
    /// Attribute equality filters; `Value::Null` matches absent fields too.
    pub attribute_equals: Vec<(String, Value)>,
    pub sort: Option<EntitySort>,
    pub limit: Option<u32>,
}

impl EntityQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: EntityKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn active(mut self, active: bool) -> Self {
        self.active = Some(active);
        self
    }

    pub fn where_eq(mut self, field: impl Into<String>, value: Value) -> Self {
        self.attribute_equals.push((field.into(), value));
        self
    }

    pub fn sort_by(mut self, sort: EntitySort) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Repository interface for entity persistence.
pub trait EntityRepository {
    /// Inserts a new entity with its unique keys and returns the stored row.
    ///
    /// A unique key collision fails with `UniqueViolation(field)`.
    fn insert_entity(&self, entity: &Entity, unique_keys: &[UniqueKey]) -> RepoResult<Entity>;
    fn get_entity(&self, id: EntityId) -> RepoResult<Option<Entity>>;
    /// Sets the active flag only if it differs; returns whether a row changed.
    fn set_entity_active(&self, id: EntityId, active: bool) -> RepoResult<bool>;
    /// Replaces attributes and unique keys of an active entity; returns
    /// whether a row changed.
    fn replace_attributes(
        &self,
        id: EntityId,
        attributes: &Attributes,
        unique_keys: &[UniqueKey],
    ) -> RepoResult<bool>;
    /// Reads up to `limit` entities matching `query` that sort after `after`
    /// (the query's own `limit` is ignored).
    fn list_entities(
        &self,
        query: &EntityQuery,
        after: Option<&PageKey>,
        limit: u32,
    ) -> RepoResult<Vec<(PageKey, Entity)>>;
}

/// SQLite-backed entity repository.
#[derive(Debug, Clone, Copy)]
pub struct SqliteEntityRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteEntityRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }
}

impl EntityRepository for SqliteEntityRepository<'_> {
    fn insert_entity(&self, entity: &Entity, unique_keys: &[UniqueKey]) -> RepoResult<Entity> {
        let attributes = encode_attributes(&entity.attributes)?;
        with_write_tx(self.conn, |conn| {
            conn.execute(
                "INSERT INTO entities (id, kind, is_active, attributes)
                 VALUES (?1, ?2, ?3, ?4);",
                params![
                    entity.id.to_string(),
                    entity.kind.as_str(),
                    bool_to_int(entity.active),
                    attributes,
                ],
            )?;
            insert_unique_keys(conn, entity.id, &entity.kind, unique_keys)?;
            load_required_entity(conn, entity.id)
        })
    }

    fn get_entity(&self, id: EntityId) -> RepoResult<Option<Entity>> {
        load_entity(self.conn, id)
    }

    fn set_entity_active(&self, id: EntityId, active: bool) -> RepoResult<bool> {
        let changed = self.conn.execute(
            &format!(
                "UPDATE entities
                 SET is_active = ?2,
                     updated_at = {NOW_MS_SQL}
                 WHERE id = ?1
                   AND is_active <> ?2;"
            ),
            params![id.to_string(), bool_to_int(active)],
        )?;
        Ok(changed > 0)
    }

    fn replace_attributes(
        &self,
        id: EntityId,
        attributes: &Attributes,
        unique_keys: &[UniqueKey],
    ) -> RepoResult<bool> {
        let encoded = encode_attributes(attributes)?;
        with_write_tx(self.conn, |conn| {
            let kind_text: Option<String> = conn
                .query_row(
                    "SELECT kind FROM entities WHERE id = ?1 AND is_active = 1;",
                    [id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(kind_text) = kind_text else {
                return Ok(false);
            };
            let kind = parse_kind(kind_text)?;

            conn.execute(
                &format!(
                    "UPDATE entities
                     SET attributes = ?2,
                         updated_at = {NOW_MS_SQL}
                     WHERE id = ?1;"
                ),
                params![id.to_string(), encoded],
            )?;
            conn.execute(
                "DELETE FROM entity_unique_values WHERE entity_id = ?1;",
                [id.to_string()],
            )?;
            insert_unique_keys(conn, id, &kind, unique_keys)?;
            Ok(true)
        })
    }

    fn list_entities(
        &self,
        query: &EntityQuery,
        after: Option<&PageKey>,
        limit: u32,
    ) -> RepoResult<Vec<(PageKey, Entity)>> {
        let mut bind_values: Vec<SqlValue> = Vec::new();
        let sort_expr = match query.sort.as_ref() {
            None => "NULL",
            Some(EntitySort::CreatedAt(_)) => "created_at",
            Some(EntitySort::Attribute { field, .. }) => {
                bind_values.push(SqlValue::Text(json_path(field)));
                "json_extract(attributes, ?)"
            }
        };
        let mut sql = format!(
            "SELECT * FROM (
                 SELECT seq, id, kind, is_active, attributes, created_at, updated_at,
                        {sort_expr} AS sort_key
                 FROM entities
                 WHERE 1 = 1"
        );

        if let Some(kind) = query.kind.as_ref() {
            sql.push_str(" AND kind = ?");
            bind_values.push(SqlValue::Text(kind.as_str().to_string()));
        }

        if let Some(active) = query.active {
            sql.push_str(" AND is_active = ?");
            bind_values.push(SqlValue::Integer(bool_to_int(active)));
        }

        for (field, value) in &query.attribute_equals {
            match json_to_sql(value) {
                Some(sql_value) => {
                    sql.push_str(" AND json_extract(attributes, ?) = ?");
                    bind_values.push(SqlValue::Text(json_path(field)));
                    bind_values.push(sql_value);
                }
                None => {
                    sql.push_str(" AND json_extract(attributes, ?) IS NULL");
                    bind_values.push(SqlValue::Text(json_path(field)));
                }
            }
        }
        sql.push_str(") WHERE 1 = 1");

        let order = sort_order(query.sort.as_ref());
        if let Some(after) = after {
            sql.push_str(" AND ");
            sql.push_str(&keyset_clause(order, after, &mut bind_values));
        }
        match order {
            None => sql.push_str(" ORDER BY seq ASC"),
            Some(order) => {
                sql.push_str(&format!(" ORDER BY sort_key {}, seq ASC", order.as_sql()));
            }
        }
        sql.push_str(" LIMIT ?");
        bind_values.push(SqlValue::Integer(i64::from(limit)));

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bind_values))?;
        let mut entities = Vec::new();
        while let Some(row) = rows.next()? {
            let key = PageKey {
                sort: row.get("sort_key")?,
                seq: row.get("seq")?,
            };
            entities.push((key, parse_entity_row(row)?));
        }
        Ok(entities)
    }
}

fn sort_order(sort: Option<&EntitySort>) -> Option<SortOrder> {
    match sort? {
        EntitySort::CreatedAt(order) => Some(*order),
        EntitySort::Attribute { order, .. } => Some(*order),
    }
}

/// Rows strictly after `after` in `ORDER BY sort_key <order>, seq ASC`.
///
/// SQLite sorts NULL first, so ascending listings start with NULL keys and
/// descending ones end with them.
fn keyset_clause(
    order: Option<SortOrder>,
    after: &PageKey,
    binds: &mut Vec<SqlValue>,
) -> String {
    let null_key = after.sort == SqlValue::Null;
    let clause = match (order, null_key) {
        (None, _) => "seq > ?",
        (Some(SortOrder::Asc), true) => {
            "((sort_key IS NULL AND seq > ?) OR sort_key IS NOT NULL)"
        }
        (Some(SortOrder::Desc), true) => "(sort_key IS NULL AND seq > ?)",
        (Some(SortOrder::Asc), false) => "(sort_key > ? OR (sort_key = ? AND seq > ?))",
        (Some(SortOrder::Desc), false) => {
            "(sort_key < ? OR (sort_key = ? AND seq > ?) OR sort_key IS NULL)"
        }
    };
    if order.is_some() && !null_key {
        binds.push(after.sort.clone());
        binds.push(after.sort.clone());
    }
    binds.push(SqlValue::Integer(after.seq));
    clause.to_string()
}

fn insert_unique_keys(
    conn: &Connection,
    id: EntityId,
    kind: &EntityKind,
    unique_keys: &[UniqueKey],
) -> RepoResult<()> {
    for key in unique_keys {
        conn.execute(
            "INSERT INTO entity_unique_values (kind, field, value, entity_id)
             VALUES (?1, ?2, ?3, ?4);",
            params![kind.as_str(), key.field, key.value, id.to_string()],
        )
        .map_err(|err| match RepoError::from(err) {
            RepoError::UniqueViolation(_) => RepoError::UniqueViolation(key.field.clone()),
            other => other,
        })?;
    }
    Ok(())
}

fn load_entity(conn: &Connection, id: EntityId) -> RepoResult<Option<Entity>> {
    let mut stmt = conn.prepare(&format!("{ENTITY_SELECT_SQL} WHERE id = ?1;"))?;
    let mut rows = stmt.query([id.to_string()])?;
    if let Some(row) = rows.next()? {
        return Ok(Some(parse_entity_row(row)?));
    }
    Ok(None)
}

fn load_required_entity(conn: &Connection, id: EntityId) -> RepoResult<Entity> {
    load_entity(conn, id)?
        .ok_or_else(|| RepoError::InvalidData(format!("entity {id} missing after write")))
}

pub(crate) fn parse_entity_row(row: &Row<'_>) -> RepoResult<Entity> {
    let id_text: String = row.get("id")?;
    let attributes_text: String = row.get("attributes")?;
    Ok(Entity {
        id: parse_uuid(&id_text, "entities.id")?,
        kind: parse_kind(row.get("kind")?)?,
        active: parse_flag(row.get("is_active")?, "entities.is_active")?,
        attributes: decode_attributes(&attributes_text, "entities.attributes")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn parse_kind(value: String) -> RepoResult<EntityKind> {
    EntityKind::new(value.clone())
        .map_err(|_| RepoError::InvalidData(format!("invalid kind `{value}` in entities.kind")))
}

fn json_path(field: &str) -> String {
    format!("$.{field}")
}

/// Converts a JSON value to the SQL value `json_extract` yields for it.
///
/// Returns `None` for null, which must be matched with `IS NULL`.
fn json_to_sql(value: &Value) -> Option<SqlValue> {
    match value {
        Value::Null => None,
        Value::Bool(flag) => Some(SqlValue::Integer(bool_to_int(*flag))),
        Value::Number(number) => match number.as_i64() {
            Some(integer) => Some(SqlValue::Integer(integer)),
            None => number.as_f64().map(SqlValue::Real),
        },
        Value::String(text) => Some(SqlValue::Text(text.clone())),
        Value::Array(_) | Value::Object(_) => Some(SqlValue::Text(value.to_string())),
    }
}
