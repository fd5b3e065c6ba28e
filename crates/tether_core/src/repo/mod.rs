//! Repository layer abstractions and persistence implementations.
//!
//! # Responsibility
//! - Define use-case oriented data access contracts.
//! - Isolate SQLite query details from service/business orchestration.
//! - Classify store errors the services must react to (unique violations).
//!
//! # Invariants
//! - Conditional writes report whether a row actually changed, so callers can
//!   tell a no-op from a mutation.
//! - Read paths reject invalid persisted state instead of masking it.

use crate::db::DbError;
use crate::model::entity::Attributes;
use rusqlite::{Connection, ErrorCode, Transaction, TransactionBehavior};
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

pub mod cursor;
pub mod entity_repo;
pub mod relationship_repo;

/// SQL expression for the current time in epoch milliseconds.
pub(crate) const NOW_MS_SQL: &str =
    "CAST((julianday('now') - 2440587.5) * 86400000 AS INTEGER)";

pub type RepoResult<T> = Result<T, RepoError>;

/// Repository error for persistence and query operations.
#[derive(Debug)]
pub enum RepoError {
    Db(DbError),
    /// A unique index or primary key rejected the write.
    UniqueViolation(String),
    InvalidData(String),
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::UniqueViolation(message) => write!(f, "unique constraint violated: {message}"),
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::UniqueViolation(_) => None,
            Self::InvalidData(_) => None,
        }
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(failure, message) = &value {
            let unique = failure.code == ErrorCode::ConstraintViolation
                && (failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY);
            if unique {
                return Self::UniqueViolation(message.clone().unwrap_or_default());
            }
        }
        Self::Db(DbError::Sqlite(value))
    }
}

/// Runs `work` atomically on `conn`.
///
/// Opens a `BEGIN IMMEDIATE` transaction when the connection is in autocommit
/// mode; otherwise joins the transaction already open on it. The transaction
/// commits only if `work` returns `Ok`.
pub fn with_write_tx<T, E>(
    conn: &Connection,
    work: impl FnOnce(&Connection) -> Result<T, E>,
) -> Result<T, E>
where
    E: From<RepoError>,
{
    if !conn.is_autocommit() {
        return work(conn);
    }

    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
        .map_err(RepoError::from)?;
    let value = work(&tx)?;
    tx.commit().map_err(RepoError::from)?;
    Ok(value)
}

pub(crate) fn bool_to_int(value: bool) -> i64 {
    if value {
        1
    } else {
        0
    }
}

pub(crate) fn parse_flag(value: i64, column: &'static str) -> RepoResult<bool> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(RepoError::InvalidData(format!(
            "invalid flag value `{other}` in {column}"
        ))),
    }
}

pub(crate) fn parse_uuid(value: &str, column: &'static str) -> RepoResult<Uuid> {
    Uuid::parse_str(value)
        .map_err(|_| RepoError::InvalidData(format!("invalid uuid `{value}` in {column}")))
}

pub(crate) fn encode_attributes(attributes: &Attributes) -> RepoResult<String> {
    serde_json::to_string(attributes)
        .map_err(|err| RepoError::InvalidData(format!("unencodable attributes: {err}")))
}

pub(crate) fn decode_attributes(value: &str, column: &'static str) -> RepoResult<Attributes> {
    serde_json::from_str(value)
        .map_err(|err| RepoError::InvalidData(format!("invalid attributes in {column}: {err}")))
}
