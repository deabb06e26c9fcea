//! Relay service error types.
//!
//! Errors map to HTTP status codes via the `IntoResponse` impl and to the
//! `code`/`message` pair of the relay's `error` event. Client-facing text is
//! generic for internal failures; the detail is logged server-side.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use signaling_protocol::ProtocolError;
use thiserror::Error;

/// Relay service error type.
///
/// - `BadRequest`: 400
/// - `RoomFull`: 409
/// - `Database`, `Internal`: 500
/// - `ServiceUnavailable`: 503
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Room is at mesh capacity ({capacity} participants)")]
    RoomFull { capacity: usize },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// HTTP status code for this error.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::RoomFull { .. } => StatusCode::CONFLICT,
            RelayError::Database(_) | RelayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            RelayError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Stable error code for response bodies and relay `error` events.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            RelayError::BadRequest(_) => "BAD_REQUEST",
            RelayError::RoomFull { .. } => "ROOM_FULL",
            RelayError::Database(_) => "DATABASE_ERROR",
            RelayError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            RelayError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            RelayError::BadRequest(reason) => reason.clone(),
            RelayError::RoomFull { capacity } => {
                format!("Room is full (at most {capacity} participants)")
            }
            RelayError::Database(_) => "An internal database error occurred".to_string(),
            RelayError::ServiceUnavailable(_) => "Service temporarily unavailable".to_string(),
            RelayError::Internal(_) => "An internal error occurred".to_string(),
        }
    }
}

impl From<ProtocolError> for RelayError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Encode(reason) => RelayError::Internal(reason),
            other => RelayError::BadRequest(other.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        match &self {
            RelayError::Database(err) => {
                tracing::error!(target: "relay.database", error = %err, "Database operation failed");
            }
            RelayError::ServiceUnavailable(reason) => {
                tracing::warn!(target: "relay.availability", reason = %reason, "Service unavailable");
            }
            RelayError::Internal(err) => {
                tracing::error!(target: "relay.internal", error = %err, "Internal error");
            }
            RelayError::BadRequest(_) | RelayError::RoomFull { .. } => {}
        }

        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.error_code().to_string(),
                message: self.client_message(),
            },
        };

        (self.status_code(), Json(body)).into_response()
    }
}
