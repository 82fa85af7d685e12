//! Error types for Quill operations

use crate::{EntityType, VoteValue};
use thiserror::Error;

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: EntityType, id: i64 },

    #[error("Unique constraint violated on {entity}: {constraint}")]
    AlreadyExists {
        entity: EntityType,
        constraint: String,
    },

    #[error("Transient storage conflict: {reason}")]
    Conflict { reason: String },

    #[error("Query failed: {reason}")]
    QueryFailed { reason: String },

    #[error("Connection unavailable: {reason}")]
    ConnectionFailed { reason: String },
}

impl StorageError {
    /// Whether the caller may safely retry the whole operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Conflict { .. })
    }
}

/// Vote ledger errors. The ledger retries `Conflict` internally before
/// surfacing it; everything else is terminal for the single operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VoteError {
    #[error("Post {0} not found")]
    PostNotFound(i64),

    #[error("User {0} not found")]
    UserNotFound(i64),

    #[error("Voting requires an authenticated session")]
    Unauthorized,

    #[error("Identical vote ({value}) already cast")]
    DuplicateVote { value: VoteValue },

    #[error("Vote could not be applied after retries: {reason}")]
    Conflict { reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Validation errors for request inputs.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Master error type for Quill core operations.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Vote error: {0}")]
    Vote(#[from] VoteError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

/// Result type alias for Quill core operations.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display_not_found() {
        let err = StorageError::NotFound {
            entity: EntityType::Post,
            id: 42,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Entity not found"));
        assert!(msg.contains("post"));
        assert!(msg.contains("42"));
    }

    #[test]
    fn test_storage_error_transient() {
        let conflict = StorageError::Conflict {
            reason: "deadlock".to_string(),
        };
        assert!(conflict.is_transient());

        let not_found = StorageError::NotFound {
            entity: EntityType::User,
            id: 1,
        };
        assert!(!not_found.is_transient());
    }

    #[test]
    fn test_vote_error_display_duplicate() {
        let err = VoteError::DuplicateVote {
            value: VoteValue::Up,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Identical vote"));
        assert!(msg.contains('1'));
    }

    #[test]
    fn test_validation_error_display_invalid_value() {
        let err = ValidationError::InvalidValue {
            field: "username".to_string(),
            reason: "too short".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("username"));
        assert!(msg.contains("too short"));
    }

    #[test]
    fn test_core_error_from_variants() {
        let storage = CoreError::from(StorageError::QueryFailed {
            reason: "timeout".to_string(),
        });
        assert!(matches!(storage, CoreError::Storage(_)));

        let vote = CoreError::from(VoteError::Unauthorized);
        assert!(matches!(vote, CoreError::Vote(_)));

        let validation = CoreError::from(ValidationError::RequiredFieldMissing {
            field: "email".to_string(),
        });
        assert!(matches!(validation, CoreError::Validation(_)));
    }

    #[test]
    fn test_vote_error_from_storage() {
        let err: VoteError = StorageError::QueryFailed {
            reason: "pool exhausted".to_string(),
        }
        .into();
        assert!(matches!(err, VoteError::Storage(_)));
    }
}
