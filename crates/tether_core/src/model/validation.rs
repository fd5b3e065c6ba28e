//! Input validation shared by entity, relationship and policy models.
//!
//! # Responsibility
//! - Validate identifier-shaped input (kinds, custom statuses) and attribute
//!   names.
//! - Define the `ValidationError` surfaced by create/update paths.
//!
//! # Invariants
//! - Identifiers match `^[a-z][a-z0-9_]*$` and are at most 64 chars.
//! - Attribute names match `^[A-Za-z_][A-Za-z0-9_]*$` (camelCase allowed) and
//!   are at most 64 chars, so they are safe to embed in JSON paths (`$.field`).
//!   Writes enforce the same rule as queries, so every stored field is
//!   queryable.

use once_cell::sync::Lazy;
use regex::Regex;
use std::error::Error;
use std::fmt::{Display, Formatter};

const IDENTIFIER_MAX_CHARS: usize = 64;

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("valid identifier regex"));
static FIELD_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid field name regex"));

/// Validation failures for caller-provided input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Value is not a lowercase identifier.
    InvalidIdentifier {
        what: &'static str,
        value: String,
    },
    /// Attribute name cannot be addressed as `$.name`.
    InvalidFieldName { value: String },
    /// Required attribute is absent, null or blank.
    MissingAttribute { kind: String, field: String },
    /// Unique attribute value already belongs to another entity of this kind.
    DuplicateValue { kind: String, field: String },
    /// Unique attribute holds a value that cannot be indexed (object/array).
    UnindexableValue { kind: String, field: String },
    /// Attribute patch is empty.
    EmptyPatch,
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidIdentifier { what, value } => {
                write!(f, "invalid {what} `{value}`; expected [a-z][a-z0-9_]*")
            }
            Self::InvalidFieldName { value } => {
                write!(f, "invalid attribute name `{value}`; expected [A-Za-z_][A-Za-z0-9_]*")
            }
            Self::MissingAttribute { kind, field } => {
                write!(f, "{kind}.{field} is required")
            }
            Self::DuplicateValue { kind, field } => {
                write!(f, "{kind}.{field} must be unique; value already in use")
            }
            Self::UnindexableValue { kind, field } => {
                write!(f, "{kind}.{field} is unique and must be a scalar value")
            }
            Self::EmptyPatch => write!(f, "attribute patch must not be empty"),
        }
    }
}

impl Error for ValidationError {}

/// Returns whether `value` is a valid lowercase identifier.
pub fn is_identifier(value: &str) -> bool {
    value.len() <= IDENTIFIER_MAX_CHARS && IDENTIFIER_RE.is_match(value)
}

/// Validates one identifier, naming `what` in the error.
pub fn require_identifier(what: &'static str, value: &str) -> Result<(), ValidationError> {
    if is_identifier(value) {
        Ok(())
    } else {
        Err(ValidationError::InvalidIdentifier {
            what,
            value: value.to_string(),
        })
    }
}

/// Returns whether `value` is a valid attribute name.
pub fn is_field_name(value: &str) -> bool {
    value.len() <= IDENTIFIER_MAX_CHARS && FIELD_NAME_RE.is_match(value)
}

/// Validates one attribute name.
pub fn require_field_name(value: &str) -> Result<(), ValidationError> {
    if is_field_name(value) {
        Ok(())
    } else {
        Err(ValidationError::InvalidFieldName {
            value: value.to_string(),
        })
    }
}
