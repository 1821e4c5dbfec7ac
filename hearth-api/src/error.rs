//! Error Types for Hearth API
//!
//! This module defines error handling for the API layer, including:
//! - ApiError struct for structured error responses
//! - ErrorCode enum for categorizing errors
//! - IntoResponse implementation for Axum HTTP responses
//! - Conversions from store, billing and outbound HTTP errors
//!
//! All errors are serialized as JSON with appropriate HTTP status codes.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use hearth_core::{BillingError, ConfigError, StoreError};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::http_client::HttpClientError;

// ============================================================================
// ERROR CODE ENUM
// ============================================================================

/// Error codes for API responses.
///
/// Each error code maps to a specific HTTP status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // ========================================================================
    // Authentication Errors (401)
    // ========================================================================
    /// Request carries no caller identity
    Unauthorized,

    // ========================================================================
    // Validation Errors (400)
    // ========================================================================
    /// Request contains invalid input data
    InvalidInput,

    /// Required field is missing from request
    MissingField,

    /// Field format is incorrect
    InvalidFormat,

    // ========================================================================
    // Billing Errors (402)
    // ========================================================================
    /// The caller's usage quota for the current period is exhausted
    QuotaExceeded,

    // ========================================================================
    // Not Found Errors (404)
    // ========================================================================
    /// Requested entity does not exist
    EntityNotFound,

    /// No billing account or customer mapping for the user
    AccountNotFound,

    // ========================================================================
    // Conflict Errors (409)
    // ========================================================================
    /// Another request holds the lock guarding this resource
    LockConflict,

    // ========================================================================
    // Throttling (429)
    // ========================================================================
    /// Request rate limit exceeded
    TooManyRequests,

    // ========================================================================
    // Server Errors (500, 502, 503, 504)
    // ========================================================================
    /// Internal server error
    InternalError,

    /// Shared key-value store operation failed
    StoreError,

    /// An upstream service answered with an error
    BadGateway,

    /// Service is temporarily unavailable
    ServiceUnavailable,

    /// Operation timed out
    Timeout,
}

impl ErrorCode {
    /// Get the HTTP status code for this error code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,

            ErrorCode::InvalidInput | ErrorCode::MissingField | ErrorCode::InvalidFormat => {
                StatusCode::BAD_REQUEST
            }

            ErrorCode::QuotaExceeded => StatusCode::PAYMENT_REQUIRED,

            ErrorCode::EntityNotFound | ErrorCode::AccountNotFound => StatusCode::NOT_FOUND,

            ErrorCode::LockConflict => StatusCode::CONFLICT,

            ErrorCode::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,

            ErrorCode::InternalError | ErrorCode::StoreError => StatusCode::INTERNAL_SERVER_ERROR,

            ErrorCode::BadGateway => StatusCode::BAD_GATEWAY,

            ErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,

            ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Get a default message for this error code.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "Authentication required",
            ErrorCode::InvalidInput => "Invalid input data",
            ErrorCode::MissingField => "Required field is missing",
            ErrorCode::InvalidFormat => "Invalid format",
            ErrorCode::QuotaExceeded => "Usage quota exceeded for the current billing period",
            ErrorCode::EntityNotFound => "Entity not found",
            ErrorCode::AccountNotFound => "Billing account not found",
            ErrorCode::LockConflict => "Resource is busy",
            ErrorCode::TooManyRequests => "Rate limit exceeded",
            ErrorCode::InternalError => "Internal server error",
            ErrorCode::StoreError => "Store operation failed",
            ErrorCode::BadGateway => "Upstream service error",
            ErrorCode::ServiceUnavailable => "Service temporarily unavailable",
            ErrorCode::Timeout => "Operation timed out",
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
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    /// Error code categorizing the error
    pub code: ErrorCode,

    /// Human-readable error message
    pub message: String,

    /// Optional additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

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

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    pub fn missing_field(field: &str) -> Self {
        Self::new(
            ErrorCode::MissingField,
            format!("Required field '{}' is missing", field),
        )
    }

    pub fn invalid_format(field: &str, expected: &str) -> Self {
        Self::new(
            ErrorCode::InvalidFormat,
            format!("Field '{}' has invalid format, expected {}", field, expected),
        )
    }

    /// Create a QuotaExceeded error carrying the quota numbers.
    pub fn quota_exceeded(limit: u64, used: u64) -> Self {
        Self::from_code(ErrorCode::QuotaExceeded).with_details(serde_json::json!({
            "limit": limit,
            "used": used,
        }))
    }

    pub fn entity_not_found(entity_type: &str, id: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::EntityNotFound,
            format!("{} with id {} not found", entity_type, id),
        )
    }

    pub fn account_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AccountNotFound, message)
    }

    pub fn lock_conflict(resource: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::LockConflict,
            format!("{} is busy, retry shortly", resource),
        )
    }

    /// Create a TooManyRequests error with optional retry-after in seconds.
    pub fn too_many_requests(retry_after_secs: Option<u64>) -> Self {
        let err = Self::from_code(ErrorCode::TooManyRequests);
        match retry_after_secs {
            Some(secs) => err.with_details(serde_json::json!({ "retry_after_secs": secs })),
            None => err,
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn store_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::StoreError, message)
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadGateway, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServiceUnavailable, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

// ============================================================================
// AXUM INTEGRATION
// ============================================================================

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(self);
        (status, body).into_response()
    }
}

// ============================================================================
// CONVERSIONS FROM LOWER LAYERS
// ============================================================================

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        tracing::error!(error = %err, "Store error");
        match err {
            StoreError::Unavailable { .. } => {
                ApiError::service_unavailable("Shared store is unavailable")
            }
            StoreError::Timeout { operation } => {
                ApiError::timeout(format!("Store operation {} timed out", operation))
            }
            _ => ApiError::store_error("Store operation failed"),
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::AccountMissing { .. }
            | BillingError::CustomerMissing { .. }
            | BillingError::SubscriptionMissing { .. } => ApiError::account_not_found(err.to_string()),
            BillingError::UnknownPrice { price_id } => {
                ApiError::invalid_input(format!("Unknown price id: {}", price_id))
            }
            BillingError::Busy { user_id } => {
                ApiError::lock_conflict(format!("Billing for user {}", user_id))
            }
            BillingError::Provider { status, message } => {
                tracing::warn!(status = status, message = %message, "Billing provider rejected request");
                ApiError::bad_gateway("Billing provider rejected the request")
                    .with_details(serde_json::json!({ "provider_status": status }))
            }
            BillingError::Transport { reason } | BillingError::InvalidResponse { reason } => {
                tracing::warn!(reason = %reason, "Billing provider call failed");
                ApiError::bad_gateway("Billing provider call failed")
            }
            BillingError::NotConfigured => {
                ApiError::service_unavailable("Billing is not configured")
            }
            BillingError::Store(store) => store.into(),
        }
    }
}

impl From<HttpClientError> for ApiError {
    fn from(err: HttpClientError) -> Self {
        tracing::warn!(error = %err, "Outbound request failed");
        match err {
            HttpClientError::Timeout { .. } => ApiError::timeout("Upstream service timed out"),
            HttpClientError::InvalidRequest { reason } => ApiError::internal_error(reason),
            _ => ApiError::bad_gateway("Upstream service call failed"),
        }
    }
}

impl From<ConfigError> for ApiError {
    fn from(err: ConfigError) -> Self {
        ApiError::internal_error(err.to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        tracing::error!("JSON serialization error: {:?}", err);
        ApiError::invalid_input(format!("Invalid JSON: {}", err))
    }
}

impl From<uuid::Error> for ApiError {
    fn from(err: uuid::Error) -> Self {
        ApiError::invalid_format("id", &format!("valid UUID: {}", err))
    }
}

// ============================================================================
// RESULT TYPE ALIAS
// ============================================================================

/// Result type alias for API operations.
pub type ApiResult<T> = Result<T, ApiError>;
