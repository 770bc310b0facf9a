use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Error surfaced by the interceptor chain and its supporting services,
/// mapped to HTTP by the `IntoResponse` impl below (the outer error mapper).
///
/// # Idempotency conflicts
///
/// The three `Key*` variants are deliberately distinct so callers can tell
/// apart the 409 causes:
///
/// - `KeyPayloadConflict` - same key reused with a different request payload
/// - `KeyPreviousFailed` - a prior attempt under this key terminal-failed
/// - `KeyInFlight` - another owner is still executing under this key
#[derive(Error, Debug)]
pub enum ToolkitError {
    #[error("Missing X-Idempotency-Key")]
    MissingIdempotencyKey,

    #[error("Idempotency key reused with different request payload")]
    KeyPayloadConflict,

    #[error("Previous attempt failed for this idempotency key")]
    KeyPreviousFailed,

    #[error("Request with this idempotency key is already in progress")]
    KeyInFlight,

    #[error("Rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    #[error("Stored idempotent response is unreadable: {0}")]
    StoredResponseUnreadable(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification of a `ToolkitError`, used by the retry stage to
/// decide retryability and by tests to assert outcomes without string
/// matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    MissingIdempotencyKey,
    KeyPayloadConflict,
    KeyPreviousFailed,
    KeyInFlight,
    RateLimited,
    StoredResponseUnreadable,
    BadRequest,
    Validation,
    Unauthorized,
    Transient,
    Database,
    Serialization,
    Config,
    Internal,
}

impl ErrorKind {
    /// Whether this kind is in the default retryable set.
    ///
    /// Only generic runtime failures are retryable by default. Client errors
    /// (validation, auth) and all idempotency conflicts must never be retried
    /// implicitly: retrying a 4xx cannot succeed, and retrying a conflict
    /// defeats the idempotency contract.
    pub fn retryable_by_default(self) -> bool {
        matches!(
            self,
            ErrorKind::Transient | ErrorKind::Database | ErrorKind::Internal
        )
    }
}

impl ToolkitError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ToolkitError::MissingIdempotencyKey => ErrorKind::MissingIdempotencyKey,
            ToolkitError::KeyPayloadConflict => ErrorKind::KeyPayloadConflict,
            ToolkitError::KeyPreviousFailed => ErrorKind::KeyPreviousFailed,
            ToolkitError::KeyInFlight => ErrorKind::KeyInFlight,
            ToolkitError::RateLimited { .. } => ErrorKind::RateLimited,
            ToolkitError::StoredResponseUnreadable(_) => ErrorKind::StoredResponseUnreadable,
            ToolkitError::BadRequest(_) => ErrorKind::BadRequest,
            ToolkitError::Validation(_) => ErrorKind::Validation,
            ToolkitError::Unauthorized(_) => ErrorKind::Unauthorized,
            ToolkitError::Transient(_) => ErrorKind::Transient,
            ToolkitError::Database(_) => ErrorKind::Database,
            ToolkitError::Serialization(_) => ErrorKind::Serialization,
            ToolkitError::Config(_) => ErrorKind::Config,
            ToolkitError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Error response body for API endpoints.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for ToolkitError {
    fn into_response(self) -> Response {
        // Log full details server-side; expose only sanitized messages.
        tracing::error!(error = %self, "Request failed");

        // Rate limiting carries the Retry-After contract (RFC 9110).
        if let ToolkitError::RateLimited { retry_after_secs } = &self {
            let body = ErrorResponse {
                error: "rate_limited".to_string(),
                message: "Rate limit exceeded. Please retry later.".to_string(),
            };
            return (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", retry_after_secs.to_string())],
                axum::Json(body),
            )
                .into_response();
        }

        let (status, error_type, message) = match &self {
            ToolkitError::MissingIdempotencyKey => (
                StatusCode::BAD_REQUEST,
                "missing_idempotency_key",
                "Missing X-Idempotency-Key header".to_string(),
            ),
            ToolkitError::KeyPayloadConflict => (
                StatusCode::CONFLICT,
                "key_payload_conflict",
                "Idempotency key reused with a different request payload".to_string(),
            ),
            ToolkitError::KeyPreviousFailed => (
                StatusCode::CONFLICT,
                "key_previous_failed",
                "Previous attempt failed for this idempotency key; use a new key".to_string(),
            ),
            ToolkitError::KeyInFlight => (
                StatusCode::CONFLICT,
                "key_in_flight",
                "A request with this idempotency key is already in progress".to_string(),
            ),
            ToolkitError::RateLimited { .. } => unreachable!("handled above"),
            ToolkitError::StoredResponseUnreadable(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "stored_response_unreadable",
                "Stored idempotent response could not be read".to_string(),
            ),
            ToolkitError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            ToolkitError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, "validation_failed", msg.clone())
            }
            ToolkitError::Unauthorized(_) => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "Authentication required".to_string(),
            ),
            ToolkitError::Transient(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "transient_failure",
                "Temporary failure. Please try again.".to_string(),
            ),
            // Internal errors: never leak database/serialization details.
            ToolkitError::Database(_) | ToolkitError::Serialization(_) | ToolkitError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "An internal error occurred. Please try again later.".to_string(),
            ),
            ToolkitError::Config(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                "Service configuration error. Please contact support.".to_string(),
            ),
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message,
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Convenience type alias for Results with ToolkitError.
pub type ToolkitResult<T> = Result<T, ToolkitError>;
