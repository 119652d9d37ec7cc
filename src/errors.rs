// ABOUTME: Centralized error handling and error types for the authorization server
// ABOUTME: Defines error codes, HTTP status mapping, and the AppError/AppResult pair
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Portico Project

//! # Unified Error Handling
//!
//! Standard error codes and a single application error type used across the
//! authorize pipeline, token pipeline, and repository layer. OAuth protocol
//! errors (the `error=...` values that go on the wire) live in
//! [`crate::oauth2::models::OAuth2Error`]; this module covers everything that
//! is not a protocol-level response.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

/// Standard error codes used throughout the application
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Authentication & Authorization
    /// Authentication is required but not provided
    AuthRequired,
    /// Authentication credentials are invalid
    AuthInvalid,
    /// Authentication token has expired
    AuthExpired,
    /// Authentication material is malformed
    AuthMalformed,
    /// User lacks permission for the requested operation
    PermissionDenied,

    // Validation
    /// Input validation failed
    InvalidInput,
    /// Required field is missing from request
    MissingRequiredField,

    // Resource Management
    /// Requested resource was not found
    ResourceNotFound,
    /// Resource already exists (conflict)
    ResourceAlreadyExists,

    // Configuration
    /// Configuration error occurred
    ConfigError,

    // Internal Errors
    /// Internal server error
    InternalError,
    /// Database operation failed
    DatabaseError,
    /// Cryptographic operation failed
    CryptoError,
    /// Serialization/deserialization failed
    SerializationError,
}

impl ErrorCode {
    /// Get the `HTTP` status code for this error
    #[must_use]
    pub const fn http_status(self) -> u16 {
        match self {
            Self::InvalidInput | Self::MissingRequiredField => 400,
            Self::AuthRequired | Self::AuthInvalid | Self::AuthExpired | Self::AuthMalformed => 401,
            Self::PermissionDenied => 403,
            Self::ResourceNotFound => 404,
            Self::ResourceAlreadyExists => 409,
            Self::ConfigError
            | Self::InternalError
            | Self::DatabaseError
            | Self::CryptoError
            | Self::SerializationError => 500,
        }
    }

    /// Stable string form used in logs and JSON bodies
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AuthRequired => "auth_required",
            Self::AuthInvalid => "auth_invalid",
            Self::AuthExpired => "auth_expired",
            Self::AuthMalformed => "auth_malformed",
            Self::PermissionDenied => "permission_denied",
            Self::InvalidInput => "invalid_input",
            Self::MissingRequiredField => "missing_required_field",
            Self::ResourceNotFound => "resource_not_found",
            Self::ResourceAlreadyExists => "resource_already_exists",
            Self::ConfigError => "config_error",
            Self::InternalError => "internal_error",
            Self::DatabaseError => "database_error",
            Self::CryptoError => "crypto_error",
            Self::SerializationError => "serialization_error",
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application error with a code and a human-readable message
#[derive(Debug, Clone, ThisError)]
#[error("{code}: {message}")]
pub struct AppError {
    /// Error classification
    pub code: ErrorCode,
    /// Human-readable message (never exposed to clients for 5xx codes)
    pub message: String,
}

impl AppError {
    /// Create a new error with the given code and message
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Internal server error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// Resource not found
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ResourceNotFound, message)
    }

    /// Invalid credentials
    pub fn auth_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AuthInvalid, message)
    }

    /// Invalid input
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    /// Configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigError, message)
    }

    /// Database error
    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DatabaseError, message)
    }

    /// HTTP status for this error
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        self.code.http_status()
    }

    /// JSON body for HTTP responses. Internal details are replaced with a
    /// generic message for 5xx codes so infrastructure errors never leak.
    #[must_use]
    pub fn to_response(&self) -> ErrorResponse {
        let message = if self.http_status() >= 500 {
            "An internal error occurred".to_owned()
        } else {
            self.message.clone()
        };
        ErrorResponse {
            error: self.code.as_str().to_owned(),
            message,
        }
    }
}

/// Wire shape of a non-OAuth error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Stable error code
    pub error: String,
    /// Human-readable message
    pub message: String,
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::new(ErrorCode::DatabaseError, format!("database error: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorCode::SerializationError, format!("serde error: {err}"))
    }
}

impl From<jsonwebtoken::errors::Error> for AppError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Self::new(ErrorCode::CryptoError, format!("jwt error: {err}"))
    }
}

impl From<bcrypt::BcryptError> for AppError {
    fn from(err: bcrypt::BcryptError) -> Self {
        Self::new(ErrorCode::CryptoError, format!("bcrypt error: {err}"))
    }
}

impl From<ring::error::Unspecified> for AppError {
    fn from(_: ring::error::Unspecified) -> Self {
        Self::new(ErrorCode::CryptoError, "ring cryptographic failure")
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(format!("{err:#}"))
    }
}

/// Result alias used across the crate
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_details_are_masked_in_responses() {
        let err = AppError::database("connection refused to 10.0.0.1:5432");
        let body = err.to_response();
        assert_eq!(body.error, "database_error");
        assert_eq!(body.message, "An internal error occurred");
    }

    #[test]
    fn client_errors_keep_their_message() {
        let err = AppError::invalid_input("scope token is not recognised");
        assert_eq!(err.http_status(), 400);
        assert_eq!(err.to_response().message, "scope token is not recognised");
    }
}
