//! Versioned schema scripts.
//!
//! Steps run once each, in version order, and every step commits together
//! with the `user_version` stamp that records it. A store stamped with a
//! version this build does not know is refused.

use crate::db::{DbError, DbResult};
use log::info;
use rusqlite::{Connection, Transaction};

struct SchemaStep {
    version: u32,
    name: &'static str,
    script: &'static str,
}

const SCHEMA_STEPS: &[SchemaStep] = &[
    SchemaStep {
        version: 1,
        name: "entities",
        script: include_str!("0001_entities.sql"),
    },
    SchemaStep {
        version: 2,
        name: "relationships",
        script: include_str!("0002_relationships.sql"),
    },
];

/// Highest schema version this build can produce.
pub fn latest_version() -> u32 {
    SCHEMA_STEPS.last().map_or(0, |step| step.version)
}

/// Brings the schema up to [`latest_version`] and returns how many steps ran.
pub fn apply_migrations(conn: &mut Connection) -> DbResult<usize> {
    let found = schema_version(conn)?;
    let latest = latest_version();
    if found > latest {
        return Err(DbError::UnsupportedSchemaVersion {
            db_version: found,
            latest_supported: latest,
        });
    }

    let pending: Vec<&SchemaStep> = SCHEMA_STEPS
        .iter()
        .filter(|step| step.version > found)
        .collect();
    if pending.is_empty() {
        return Ok(0);
    }

    let tx = conn.transaction()?;
    for step in &pending {
        run_step(&tx, step)?;
    }
    tx.commit()?;
    Ok(pending.len())
}

/// Schema version stamped in `PRAGMA user_version`.
pub fn schema_version(conn: &Connection) -> DbResult<u32> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

fn run_step(tx: &Transaction<'_>, step: &SchemaStep) -> DbResult<()> {
    tx.execute_batch(step.script)
        .and_then(|()| tx.pragma_update(None, "user_version", step.version))
        .map_err(|source| DbError::Migration {
            version: step.version,
            name: step.name,
            source,
        })?;
    info!(
        "event=db_migrate module=db status=ok version={} name={}",
        step.version, step.name
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{apply_migrations, latest_version, schema_version, SCHEMA_STEPS};
    use rusqlite::Connection;

    #[test]
    fn step_versions_increase_by_one() {
        for (index, step) in SCHEMA_STEPS.iter().enumerate() {
            assert_eq!(step.version as usize, index + 1, "step {}", step.name);
        }
    }

    #[test]
    fn second_run_applies_nothing() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(apply_migrations(&mut conn).unwrap(), SCHEMA_STEPS.len());
        assert_eq!(apply_migrations(&mut conn).unwrap(), 0);
        assert_eq!(schema_version(&conn).unwrap(), latest_version());
    }
}
