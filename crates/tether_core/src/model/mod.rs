//! Domain model for entities, relationships and lifecycle policy.
//!
//! # Responsibility
//! - Define canonical records used by stores and the cascade engine.
//! - Keep policy declarative so new entity kinds need no code changes.
//!
//! # Invariants
//! - Every entity is identified by a stable `EntityId`.
//! - Deletion is represented by the `active` flag, never by hard delete.

pub mod entity;
pub mod policy;
pub mod relationship;
pub mod validation;
