//! Error types for the vault storage engine.
//!
//! Every fallible operation in this crate returns [`StoreError`]. The
//! variants form the error taxonomy observable by callers: argument
//! validation failures, uniqueness violations, sequence-gated update
//! failures, missing records, and duplicate vaults. Storage-engine
//! failures are wrapped in [`StoreError::Engine`]; revision conflicts
//! never escape the store primitives, which retry them internally.

use std::fmt;

use crate::engine::EngineError;

/// Result type alias for vault storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the vault storage engine.
#[derive(Debug)]
pub enum StoreError {
    /// An argument had the wrong shape or type. Never retried.
    Validation {
        /// Name of the offending parameter.
        parameter: String,
        /// Description of the violation.
        reason: String,
    },

    /// A uniqueness constraint (id or blinded attribute) was violated.
    Constraint {
        /// Human-readable description of the violation.
        message: String,
        /// The record that already occupies the constrained slot, when known.
        existing: Option<Box<serde_json::Value>>,
    },

    /// A duplicate was detected at the transport boundary.
    Duplicate {
        /// Description of the duplicate.
        message: String,
    },

    /// A sequence-gated update found a stale sequence or no target.
    InvalidState {
        /// Description of the failed transition.
        message: String,
        /// The sequence the target was expected to hold, when known.
        expected: Option<u64>,
        /// The sequence actually supplied, when known.
        actual: Option<u64>,
    },

    /// The requested record does not exist.
    NotFound {
        /// Description of what was missing.
        message: String,
    },

    /// A plain error: invalid password, unsupported version, corrupted
    /// stored key material.
    Internal {
        /// Description of the error.
        message: String,
    },

    /// The underlying document engine failed.
    Engine(EngineError),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation { parameter, reason } => {
                write!(f, "invalid input \"{parameter}\": {reason}")
            }
            Self::Constraint { message, .. }
            | Self::Duplicate { message }
            | Self::InvalidState { message, .. }
            | Self::NotFound { message }
            | Self::Internal { message } => write!(f, "{message}"),
            Self::Engine(err) => write!(f, "document engine error: {err}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Engine(err) => Some(err),
            _ => None,
        }
    }
}

impl From<EngineError> for StoreError {
    fn from(err: EngineError) -> Self {
        Self::Engine(err)
    }
}

impl StoreError {
    /// Creates a validation error.
    pub fn validation<P: Into<String>, R: Into<String>>(parameter: P, reason: R) -> Self {
        Self::Validation {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    /// Creates a constraint error without an offending record.
    pub fn constraint<S: Into<String>>(message: S) -> Self {
        Self::Constraint {
            message: message.into(),
            existing: None,
        }
    }

    /// Creates a constraint error carrying the record already occupying
    /// the constrained slot.
    pub fn constraint_with_existing<S: Into<String>>(
        message: S,
        existing: serde_json::Value,
    ) -> Self {
        Self::Constraint {
            message: message.into(),
            existing: Some(Box::new(existing)),
        }
    }

    /// Creates a duplicate error.
    pub fn duplicate<S: Into<String>>(message: S) -> Self {
        Self::Duplicate {
            message: message.into(),
        }
    }

    /// Creates an invalid-state error.
    pub fn invalid_state<S: Into<String>>(message: S) -> Self {
        Self::InvalidState {
            message: message.into(),
            expected: None,
            actual: None,
        }
    }

    /// Creates an invalid-state error carrying the expected and actual
    /// sequence values.
    pub fn sequence_mismatch<S: Into<String>>(message: S, expected: u64, actual: u64) -> Self {
        Self::InvalidState {
            message: message.into(),
            expected: Some(expected),
            actual: Some(actual),
        }
    }

    /// Creates a not-found error.
    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Creates a plain internal error.
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns `true` if this is a constraint error.
    #[must_use]
    pub const fn is_constraint(&self) -> bool {
        matches!(self, Self::Constraint { .. })
    }

    /// Returns `true` if this is a not-found error.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns the record carried by a constraint error, if any.
    #[must_use]
    pub fn constraint_existing(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Constraint {
                existing: Some(existing),
                ..
            } => Some(existing),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_passes_message_through() {
        let err = StoreError::duplicate("Duplicate EDV configuration.");
        assert_eq!(format!("{err}"), "Duplicate EDV configuration.");

        let err = StoreError::not_found("Document not found.");
        assert_eq!(format!("{err}"), "Document not found.");
    }

    #[test]
    fn validation_display_names_parameter() {
        let err = StoreError::validation("config.sequence", "must be a non-negative integer");
        let text = format!("{err}");
        assert!(text.contains("config.sequence"));
        assert!(text.contains("non-negative"));
    }

    #[test]
    fn constraint_carries_existing_record() {
        let record = serde_json::json!({"_id": "a:b"});
        let err = StoreError::constraint_with_existing("duplicate", record.clone());
        assert!(err.is_constraint());
        assert_eq!(err.constraint_existing(), Some(&record));
    }
}
