//! Error Types for the Quill API
//!
//! This module defines error handling for the API layer, including:
//! - ApiError struct for structured error responses
//! - ErrorCode enum for categorizing errors
//! - IntoResponse implementation for Axum HTTP responses
//!
//! All errors are serialized as JSON with appropriate HTTP status codes.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use quill_core::{StorageError, ValidationError, VoteError};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// ERROR CODE ENUM
// ============================================================================

/// Error codes for API responses.
///
/// Each error code maps to a specific HTTP status code and represents
/// a category of error that can occur during API operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // ========================================================================
    // Authentication Errors (401, 403)
    // ========================================================================
    /// Request lacks a valid session
    Unauthorized,

    /// Request is authenticated but lacks permission for the resource
    Forbidden,

    // ========================================================================
    // Validation Errors (400)
    // ========================================================================
    /// Request validation failed
    ValidationFailed,

    /// Request contains invalid input data
    InvalidInput,

    /// Required field is missing from request
    MissingField,

    // ========================================================================
    // Not Found Errors (404)
    // ========================================================================
    /// Requested entity does not exist
    EntityNotFound,

    /// Requested post does not exist
    PostNotFound,

    /// Requested user does not exist
    UserNotFound,

    // ========================================================================
    // Conflict Errors (409)
    // ========================================================================
    /// Entity with the same identifier already exists
    EntityAlreadyExists,

    /// Vote already recorded with the same value
    DuplicateVote,

    /// Concurrent modification could not be resolved within the retry budget
    VoteConflict,

    // ========================================================================
    // Server Errors (500, 503)
    // ========================================================================
    /// Internal server error
    InternalError,

    /// Database operation failed
    DatabaseError,

    /// Service is temporarily unavailable
    ServiceUnavailable,
}

impl ErrorCode {
    /// Get the HTTP status code for this error code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,

            ErrorCode::Forbidden => StatusCode::FORBIDDEN,

            ErrorCode::ValidationFailed
            | ErrorCode::InvalidInput
            | ErrorCode::MissingField => StatusCode::BAD_REQUEST,

            ErrorCode::EntityNotFound
            | ErrorCode::PostNotFound
            | ErrorCode::UserNotFound => StatusCode::NOT_FOUND,

            ErrorCode::EntityAlreadyExists
            | ErrorCode::DuplicateVote
            | ErrorCode::VoteConflict => StatusCode::CONFLICT,

            ErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,

            ErrorCode::InternalError | ErrorCode::DatabaseError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Get a default message for this error code.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "Authentication required",
            ErrorCode::Forbidden => "Access forbidden",

            ErrorCode::ValidationFailed => "Request validation failed",
            ErrorCode::InvalidInput => "Invalid input data",
            ErrorCode::MissingField => "Required field is missing",

            ErrorCode::EntityNotFound => "Entity not found",
            ErrorCode::PostNotFound => "Post not found",
            ErrorCode::UserNotFound => "User not found",

            ErrorCode::EntityAlreadyExists => "Entity already exists",
            ErrorCode::DuplicateVote => "Vote already recorded with the same value",
            ErrorCode::VoteConflict => "Vote could not be applied due to concurrent updates",

            ErrorCode::InternalError => "Internal server error",
            ErrorCode::DatabaseError => "Database operation failed",
            ErrorCode::ServiceUnavailable => "Service temporarily unavailable",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// API ERROR STRUCT
// ============================================================================

/// Structured error response for API operations.
///
/// This type is returned by all API endpoints when an error occurs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    /// Error code categorizing the error
    pub code: ErrorCode,

    /// Human-readable error message
    pub message: String,

    /// Optional additional details (field errors, etc.)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Result type for API operations.
pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    /// Create a new API error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Create a new API error with the given code, using the default message.
    pub fn from_code(code: ErrorCode) -> Self {
        Self {
            code,
            message: code.default_message().to_string(),
            details: None,
        }
    }

    /// Add additional details to the error.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        self.code.status_code()
    }

    // ========================================================================
    // Convenience constructors for common errors
    // ========================================================================

    /// Create an Unauthorized error.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    /// Create a Forbidden error.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    /// Create a ValidationFailed error.
    pub fn validation_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationFailed, message)
    }

    /// Create an InvalidInput error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    /// Create an EntityNotFound error.
    pub fn entity_not_found(entity_type: &str, id: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::EntityNotFound,
            format!("{} with id {} not found", entity_type, id),
        )
    }

    /// Create an InternalError.
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// Create a DatabaseError.
    pub fn database_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DatabaseError, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(self)).into_response()
    }
}

// ============================================================================
// CONVERSIONS FROM DOMAIN ERRORS
// ============================================================================

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match &err {
            StorageError::NotFound { .. } => {
                Self::new(ErrorCode::EntityNotFound, err.to_string())
            }
            StorageError::AlreadyExists { .. } => {
                Self::new(ErrorCode::EntityAlreadyExists, err.to_string())
            }
            StorageError::Conflict { .. } => Self::new(ErrorCode::VoteConflict, err.to_string()),
            StorageError::QueryFailed { .. } => {
                Self::new(ErrorCode::DatabaseError, err.to_string())
            }
            StorageError::ConnectionFailed { .. } => {
                Self::new(ErrorCode::ServiceUnavailable, err.to_string())
            }
        }
    }
}

impl From<VoteError> for ApiError {
    fn from(err: VoteError) -> Self {
        match &err {
            VoteError::PostNotFound(_) => Self::new(ErrorCode::PostNotFound, err.to_string()),
            VoteError::UserNotFound(_) => Self::new(ErrorCode::UserNotFound, err.to_string()),
            VoteError::Unauthorized => Self::from_code(ErrorCode::Unauthorized),
            VoteError::DuplicateVote { .. } => Self::new(ErrorCode::DuplicateVote, err.to_string()),
            VoteError::Conflict { .. } => Self::new(ErrorCode::VoteConflict, err.to_string()),
            VoteError::Storage(inner) => Self::from(inner.clone()),
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        Self::new(ErrorCode::ValidationFailed, err.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for ApiError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        Self::new(
            ErrorCode::ServiceUnavailable,
            format!("Connection pool error: {}", err),
        )
    }
}

impl From<tokio_postgres::Error> for ApiError {
    fn from(err: tokio_postgres::Error) -> Self {
        Self::new(ErrorCode::DatabaseError, format!("Database error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::{EntityType, VoteValue};

    #[test]
    fn test_error_code_status_mapping() {
        assert_eq!(
            ErrorCode::Unauthorized.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(ErrorCode::PostNotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::DuplicateVote.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            ErrorCode::DatabaseError.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_api_error_serialization() {
        let err = ApiError::from_code(ErrorCode::PostNotFound);
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"POST_NOT_FOUND\""));
        assert!(json.contains("Post not found"));
        assert!(!json.contains("details"));
    }

    #[test]
    fn test_storage_error_conversion() {
        let err: ApiError = StorageError::NotFound {
            entity: EntityType::Post,
            id: 42,
        }
        .into();
        assert_eq!(err.code, ErrorCode::EntityNotFound);

        let err: ApiError = StorageError::AlreadyExists {
            entity: EntityType::User,
            constraint: "users_username_key".to_string(),
        }
        .into();
        assert_eq!(err.code, ErrorCode::EntityAlreadyExists);
    }

    #[test]
    fn test_vote_error_conversion() {
        let err: ApiError = VoteError::DuplicateVote {
            value: VoteValue::Up,
        }
        .into();
        assert_eq!(err.code, ErrorCode::DuplicateVote);
        assert_eq!(err.status_code(), StatusCode::CONFLICT);

        let err: ApiError = VoteError::PostNotFound(7).into();
        assert_eq!(err.code, ErrorCode::PostNotFound);
    }
}
