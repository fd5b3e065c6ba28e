//! Relationship lifecycle core.
//!
//! Soft-deletable entities, the relationships between them, and a
//! policy-driven cascade engine keeping both consistent on top of SQLite.

pub mod clock;
pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{ConfigError, CoreConfig};
pub use db::{DbError, Store};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::entity::{Attributes, Entity, EntityId, EntityKind, Transition};
pub use model::policy::{CascadeRule, EntitySchema, LifecyclePolicy, PolicyError};
pub use model::relationship::{Relationship, RelationshipStatus, Role};
pub use model::validation::ValidationError;
pub use repo::entity_repo::{EntityQuery, EntitySort, SortOrder};
pub use repo::{RepoError, RepoResult};
pub use service::cascade_service::{CascadeEngine, CascadeOutcome, MAX_CASCADE_DEPTH};
pub use service::entity_service::{EntityCursor, EntityStore};
pub use service::error::{CoreError, CoreResult, ErrorKind, NotFoundTarget};
pub use service::relationship_service::{RelationshipCursor, RelationshipIndex};

/// Minimal health-check API.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::{core_version, ping};

    #[test]
    fn ping_returns_pong() {
        assert_eq!(ping(), "pong");
    }

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
