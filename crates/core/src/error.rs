//! Domain error model.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Per-field validation messages, ordered by field name for stable output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldErrors(BTreeMap<String, String>);

impl FieldErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut errors = Self::new();
        errors.insert(field, message);
        errors
    }

    /// Record a message for `field`. The first message for a field wins.
    pub fn insert(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.entry(field.into()).or_insert_with(|| message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Turn accumulated messages into a validation error, or `Ok(())` when empty.
    pub fn into_result(self, message: impl Into<String>) -> DomainResult<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(DomainError::Validation {
                message: message.into(),
                details: self,
            })
        }
    }
}

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// missing entities, uniqueness). Infrastructure concerns belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A referenced entity does not exist (or is hidden by soft deletion).
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A value failed validation; `details` names the offending fields.
    #[error("validation failed: {message}")]
    Validation { message: String, details: FieldErrors },

    /// A uniqueness constraint on `field` rejected `value`.
    #[error("duplicate key: {field} = {value:?}")]
    DuplicateKey { field: String, value: String },

    /// A concurrent writer won the race.
    #[error("conflict: {0}")]
    Conflict(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            details: FieldErrors::new(),
        }
    }

    pub fn invalid_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        let field = field.into();
        let msg = msg.into();
        Self::Validation {
            message: format!("invalid value for {field}"),
            details: FieldErrors::single(field, msg),
        }
    }

    pub fn duplicate_key(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::DuplicateKey {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    /// Field details for validation errors; empty for every other kind.
    pub fn details(&self) -> Option<&FieldErrors> {
        match self {
            Self::Validation { details, .. } => Some(details),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_errors_keep_first_message_per_field() {
        let mut errors = FieldErrors::new();
        errors.insert("amount", "not a number");
        errors.insert("amount", "negative");
        errors.insert("date", "unparseable");

        assert_eq!(errors.len(), 2);
        assert_eq!(errors.get("amount"), Some("not a number"));
    }

    #[test]
    fn empty_field_errors_are_ok() {
        assert!(FieldErrors::new().into_result("row").is_ok());

        let err = FieldErrors::single("smp", "expected yes/no")
            .into_result("row rejected")
            .unwrap_err();
        assert_eq!(err.details().and_then(|d| d.get("smp")), Some("expected yes/no"));
    }

    #[test]
    fn not_found_message_names_entity_and_id() {
        let err = DomainError::not_found("purchase", "abc");
        assert_eq!(err.to_string(), "purchase not found: abc");
    }
}
