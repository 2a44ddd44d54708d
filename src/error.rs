//! # Error Handling
//!
//! Two layers of errors live here:
//!
//! - **SessionError**: failures of the streaming pipeline itself (bad frame, unknown
//!   connection, engine failure). These are returned to whoever submitted the frame or
//!   connection event and never tear down the process.
//! - **AppError**: failures of the HTTP surface, converted to JSON responses.
//!
//! ## Key Rust Concepts:
//! - **thiserror**: `#[derive(Error)]` generates `Display` and `std::error::Error`
//!   from the `#[error(...)]` attributes
//! - **ResponseError trait**: Converts errors to HTTP responses
//! - **From trait**: Lets `?` convert one error type into another automatically

use actix_web::{HttpResponse, ResponseError};  // Web framework error handling
use serde_json::json;                          // For creating JSON error responses
use std::fmt;                                  // For implementing Display trait
use thiserror::Error;

/// Errors produced by the per-connection detection pipeline.
///
/// ## Effect on the session:
/// - **InvalidFrame**: the frame is dropped, the session keeps its state and stays alive
/// - **UnknownSession**: nothing is mutated
/// - **DuplicateSession**: the already-registered session is left untouched
/// - **InferenceFailure**: recurrent state and frame counter stay at their pre-call values
/// - **CapacityExceeded**: the connection is refused, no session is created
/// - **Overloaded**: the frame was dropped before reaching the session
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("invalid audio frame: {0}")]
    InvalidFrame(String),

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("session already exists: {0}")]
    DuplicateSession(String),

    #[error("inference failed: {0}")]
    InferenceFailure(String),

    #[error("maximum concurrent sessions ({0}) reached")]
    CapacityExceeded(usize),

    #[error("frame queue full ({0} frames pending), frame dropped")]
    Overloaded(usize),
}

impl SessionError {
    /// Machine-readable code used in WebSocket `error` messages.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::InvalidFrame(_) => "invalid_frame",
            SessionError::UnknownSession(_) => "unknown_session",
            SessionError::DuplicateSession(_) => "duplicate_session",
            SessionError::InferenceFailure(_) => "inference_failure",
            SessionError::CapacityExceeded(_) => "capacity_exceeded",
            SessionError::Overloaded(_) => "overloaded",
        }
    }
}

/// Custom error types for the HTTP API.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **Unavailable**: The server cannot take more work right now (503 errors)
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors (engine failures, task panics, etc.)
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found
    NotFound(String),

    /// Session capacity exhausted
    Unavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

/// Implementation of the ResponseError trait for AppError.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "bad_request",
///     "message": "invalid audio frame: payload is empty",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        // Map each error type to HTTP status code, error type, and message
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,  // 500
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,  // 400
                "bad_request",
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,  // 404
                "not_found",
                msg.clone(),
            ),
            AppError::Unavailable(msg) => (
                actix_web::http::StatusCode::SERVICE_UNAVAILABLE,  // 503
                "unavailable",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Pipeline errors surfaced through HTTP (the debug probe and session lookups).
///
/// ## Status mapping:
/// - InvalidFrame → 400, UnknownSession → 404, DuplicateSession → 400
/// - InferenceFailure → 500, CapacityExceeded / Overloaded → 503
impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::InvalidFrame(_) | SessionError::DuplicateSession(_) => {
                AppError::BadRequest(err.to_string())
            }
            SessionError::UnknownSession(_) => AppError::NotFound(err.to_string()),
            SessionError::InferenceFailure(_) => AppError::Internal(err.to_string()),
            SessionError::CapacityExceeded(_) | SessionError::Overloaded(_) => {
                AppError::Unavailable(err.to_string())
            }
        }
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;

/// Shorthand for `Result<T, SessionError>`.
pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;

    #[test]
    fn test_session_error_codes() {
        assert_eq!(SessionError::InvalidFrame("x".into()).code(), "invalid_frame");
        assert_eq!(SessionError::UnknownSession("a".into()).code(), "unknown_session");
        assert_eq!(SessionError::DuplicateSession("a".into()).code(), "duplicate_session");
        assert_eq!(SessionError::InferenceFailure("boom".into()).code(), "inference_failure");
        assert_eq!(SessionError::CapacityExceeded(3).code(), "capacity_exceeded");
        assert_eq!(SessionError::Overloaded(32).code(), "overloaded");
    }

    #[test]
    fn test_session_error_status_mapping() {
        let cases = [
            (SessionError::InvalidFrame("empty".into()), StatusCode::BAD_REQUEST),
            (SessionError::UnknownSession("a".into()), StatusCode::NOT_FOUND),
            (SessionError::InferenceFailure("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (SessionError::CapacityExceeded(1), StatusCode::SERVICE_UNAVAILABLE),
        ];

        for (err, expected) in cases {
            let app_err: AppError = err.into();
            assert_eq!(app_err.error_response().status(), expected);
        }
    }

    #[test]
    fn test_error_display() {
        let err = SessionError::UnknownSession("conn-1".into());
        assert_eq!(err.to_string(), "unknown session: conn-1");

        let app_err = AppError::BadRequest("empty body".into());
        assert_eq!(app_err.to_string(), "Bad request: empty body");
    }
}
