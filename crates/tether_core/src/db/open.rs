//! Store handle bootstrap for SQLite.
//!
//! # Responsibility
//! - Open file or in-memory SQLite connections.
//! - Configure connection pragmas required by core behavior.
//! - Trigger schema migrations before returning a usable store.
//!
//! # Invariants
//! - Returned stores have `foreign_keys=ON` and a 5s busy timeout.
//! - Returned stores have migrations fully applied.

use super::migrations::apply_migrations;
use super::{DbError, DbResult};
use crate::repo::entity_repo::SqliteEntityRepository;
use crate::repo::relationship_repo::SqliteRelationshipRepository;
use log::{error, info};
use rusqlite::Connection;
use std::path::Path;
use std::time::{Duration, Instant};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Explicitly opened store handle.
///
/// Repositories borrow the connection; the handle is closed with
/// [`Store::close`] (or on drop).
#[derive(Debug)]
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Opens a SQLite database file and applies all pending migrations.
    ///
    /// # Side effects
    /// - Emits `db_open` logging events with duration and status.
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        Self::bootstrap("file", || Connection::open(path))
    }

    /// Opens an in-memory SQLite database and applies all pending migrations.
    pub fn open_in_memory() -> DbResult<Self> {
        Self::bootstrap("memory", Connection::open_in_memory)
    }

    /// Returns the underlying connection for repository construction.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Entity repository bound to this store.
    pub fn entities(&self) -> SqliteEntityRepository<'_> {
        SqliteEntityRepository::new(&self.conn)
    }

    /// Relationship repository bound to this store.
    pub fn relationships(&self) -> SqliteRelationshipRepository<'_> {
        SqliteRelationshipRepository::new(&self.conn)
    }

    /// Closes the connection, surfacing any pending SQLite error.
    pub fn close(self) -> DbResult<()> {
        self.conn.close().map_err(|(_, err)| {
            error!("event=db_close module=db status=error error={}", err);
            DbError::Sqlite(err)
        })?;
        info!("event=db_close module=db status=ok");
        Ok(())
    }

    fn bootstrap(
        mode: &'static str,
        connect: impl FnOnce() -> rusqlite::Result<Connection>,
    ) -> DbResult<Self> {
        let started_at = Instant::now();
        info!("event=db_open module=db status=start mode={mode}");

        let mut conn = match connect() {
            Ok(conn) => conn,
            Err(err) => {
                error!(
                    "event=db_open module=db status=error mode={} duration_ms={} error_code=db_open_failed error={}",
                    mode,
                    started_at.elapsed().as_millis(),
                    err
                );
                return Err(err.into());
            }
        };

        match configure_connection(&mut conn) {
            Ok(applied) => {
                info!(
                    "event=db_open module=db status=ok mode={} migrations_applied={} duration_ms={}",
                    mode,
                    applied,
                    started_at.elapsed().as_millis()
                );
                Ok(Self { conn })
            }
            Err(err) => {
                error!(
                    "event=db_open module=db status=error mode={} duration_ms={} error_code=db_bootstrap_failed error={}",
                    mode,
                    started_at.elapsed().as_millis(),
                    err
                );
                Err(err)
            }
        }
    }
}

fn configure_connection(conn: &mut Connection) -> DbResult<usize> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    apply_migrations(conn)
}
