//! Core use-case services.
//!
//! # Responsibility
//! - Orchestrate repository calls into Entity Store, Relationship Index and
//!   Cascade Engine APIs.
//! - Translate repository failures into `CoreError` kinds callers can map.

pub mod cascade_service;
pub mod entity_service;
pub mod error;
pub mod relationship_service;
